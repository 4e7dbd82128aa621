//! Error types for the storage engine

use thiserror::Error;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Status reported by the flash controller after a program or erase
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlashError {
    /// Write to an address that is not word aligned
    #[error("programming alignment error at {0:#06x}")]
    Alignment(u32),

    /// Word program did not take (e.g. an attempt to set a cleared bit)
    #[error("programming error at {0:#06x}")]
    Program(u32),

    /// Write or erase issued while the flash was locked
    #[error("programming sequence error")]
    Sequence,

    /// Write to a protected address
    #[error("write protection error at {0:#06x}")]
    WriteProtected(u32),

    /// Access past the end of the storage region
    #[error("address {addr:#06x}+{len} outside the storage region")]
    OutOfRange { addr: u32, len: u32 },

    /// Unknown sector id
    #[error("no such sector: {0}")]
    NoSuchSector(u8),

    /// Power was lost before the operation completed
    #[error("power lost during flash operation")]
    PowerLoss,

    /// Backing store for a host-side flash image failed
    #[error("flash image IO error: {0}")]
    Io(String),
}

/// Invalid layout configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("{0} must be word aligned (got {1:#x})")]
    Unaligned(&'static str, u32),

    #[error("record ends at {record_end:#06x}, past the journal sector at {journal_start:#06x}")]
    RecordTooLarge { record_end: u32, journal_start: u32 },

    #[error("journal areas end at {areas_end:#06x}, past the journal sector end {sector_end:#06x}")]
    AreasTooLarge { areas_end: u32, sector_end: u32 },

    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("meta and journal sectors must differ (both are {0})")]
    SharedSector(u8),

    #[error("{0} overflows the address space")]
    Overflow(&'static str),
}

/// Failure inside the crypto capability
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid private key for {0}")]
    InvalidKey(&'static str),

    #[error("non-hardened derivation is not supported on {0}")]
    HardenedOnly(&'static str),

    #[error("node has no private key")]
    MissingPrivateKey,

    #[error("cipher error: {0}")]
    Cipher(String),
}

/// Failure inside a secret gate
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("secure element rejected the request: {0}")]
    SecureElement(String),

    #[error("secure element zone is locked")]
    Locked,

    #[error("mnemonic too long ({0} bytes)")]
    MnemonicTooLong(usize),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Errors surfaced by the storage engine
#[derive(Debug, Error)]
pub enum StorageError {
    /// Flash integrity failure; the engine has halted
    #[error("storage failure detected: {0}")]
    Fatal(String),

    /// A previous fatal error halted the engine
    #[error("storage engine halted after a fatal failure")]
    Halted,

    #[error("flash error: {0}")]
    Flash(#[from] FlashError),

    #[error("invalid layout: {0}")]
    Layout(#[from] LayoutError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("gate error: {0}")]
    Gate(#[from] GateError),

    #[error("record codec error: {0}")]
    Codec(String),
}
