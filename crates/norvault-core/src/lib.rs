//! Norvault Core - Flash-backed secure storage for hardware wallet secrets
//!
//! This crate keeps a wallet's persistent state in two NOR flash sectors:
//! a meta sector holding the bootloader descriptor, a header and the
//! fixed-layout storage record, and a journal sector holding the PIN
//! failure and U2F counter journals. The journals only ever clear bits, so
//! routine operations never erase; a full journal is recycled into the
//! record.

pub mod crypto;
pub mod engine;
pub mod error;
pub mod flash;
pub mod gate;
pub mod journal;
pub mod layout;
pub mod migration;
pub mod record;
pub mod session;
pub mod ui;

pub use crypto::{CryptoProvider, Curve, SoftwareCrypto};
pub use engine::{EngineBuilder, LoadDevice, StorageEngine, LANGUAGES, SESSION_STATE_LEN};
pub use error::{CryptoError, FlashError, GateError, LayoutError, Result, StorageError};
pub use flash::{Flash, FlashSession, MemoryFlash};
pub use gate::{
    PlaintextPinGate, SecretGate, SecureElement, SecureElementGate, SimulatedSecureElement,
};
pub use layout::{FlashLayout, STORAGE_MAGIC, UUID_LEN};
pub use migration::STORAGE_VERSION;
pub use record::{HdNode, RecordView, StorageRecord, RECORD_SIZE};
pub use session::SessionCache;
pub use ui::{StorageUi, TracingUi};

/// Hardened BIP-32 index of the U2F root (`0x80000000 | 'U2F'`)
pub const U2F_KEY_PATH: u32 = 0x8055_3246;
