//! Storage record and its fixed flash encoding
//!
//! Record layout (all words little endian, every optional field preceded by
//! a presence word that is 1 when the field is set):
//! ```text
//! OFFSET  SIZE    FIELD
//! ──────────────────────────────────────────────────────
//! 0x0000  4       version
//! 0x0004  4+80    node (depth, fingerprint, child_num, chain_code[32],
//!                       has_private_key, private_key[32])
//! 0x0058  4+240   mnemonic (NUL padded, or sealed by the secret gate)
//! 0x014C  4+4     passphrase_protection
//! 0x0154  4+4     pin_failed_attempts (legacy, versions <= 5)
//! 0x015C  4+12    pin (NUL terminated, 9 digits max)
//! 0x016C  4+20    language (NUL terminated, 16 bytes max)
//! 0x0184  4+36    label (NUL terminated, 32 bytes max)
//! 0x01AC  4+4     imported
//! 0x01B4  4+4+1024 homescreen (size word + bitmap)
//! 0x05BC  4+4     u2f_counter
//! 0x05C4  4+4     needs_backup
//! 0x05CC  4+4     flags
//! 0x05D4  4+80    u2f_root
//! 0x0628          end
//! ```

use std::fmt;

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{Result, StorageError};

const WORD: usize = 4;

/// Encoded size of an [`HdNode`]
pub const NODE_SIZE: usize = 3 * WORD + 32 + WORD + 32;
/// Mnemonic field size (a 16-byte multiple so the secure element can seal it)
pub const MNEMONIC_LEN: usize = 240;
/// PIN buffer size including the terminator
pub const PIN_LEN: usize = 10;
/// Language buffer size including the terminator
pub const LANGUAGE_LEN: usize = 17;
/// Label buffer size including the terminator
pub const LABEL_LEN: usize = 33;
/// Homescreen bitmap size (128x64, one bit per pixel)
pub const HOMESCREEN_LEN: usize = 1024;

const fn padded(len: usize) -> usize {
    (len + 3) & !3
}

const OFF_VERSION: usize = 0;
const OFF_HAS_NODE: usize = OFF_VERSION + WORD;
const OFF_NODE: usize = OFF_HAS_NODE + WORD;
const OFF_HAS_MNEMONIC: usize = OFF_NODE + NODE_SIZE;
const OFF_MNEMONIC: usize = OFF_HAS_MNEMONIC + WORD;
const OFF_HAS_PASSPHRASE_PROTECTION: usize = OFF_MNEMONIC + MNEMONIC_LEN;
const OFF_PASSPHRASE_PROTECTION: usize = OFF_HAS_PASSPHRASE_PROTECTION + WORD;
const OFF_HAS_PIN_FAILED_ATTEMPTS: usize = OFF_PASSPHRASE_PROTECTION + WORD;
const OFF_PIN_FAILED_ATTEMPTS: usize = OFF_HAS_PIN_FAILED_ATTEMPTS + WORD;
const OFF_HAS_PIN: usize = OFF_PIN_FAILED_ATTEMPTS + WORD;
const OFF_PIN: usize = OFF_HAS_PIN + WORD;
const OFF_HAS_LANGUAGE: usize = OFF_PIN + padded(PIN_LEN);
const OFF_LANGUAGE: usize = OFF_HAS_LANGUAGE + WORD;
const OFF_HAS_LABEL: usize = OFF_LANGUAGE + padded(LANGUAGE_LEN);
const OFF_LABEL: usize = OFF_HAS_LABEL + WORD;
const OFF_HAS_IMPORTED: usize = OFF_LABEL + padded(LABEL_LEN);
const OFF_IMPORTED: usize = OFF_HAS_IMPORTED + WORD;
const OFF_HAS_HOMESCREEN: usize = OFF_IMPORTED + WORD;
const OFF_HOMESCREEN_SIZE: usize = OFF_HAS_HOMESCREEN + WORD;
const OFF_HOMESCREEN: usize = OFF_HOMESCREEN_SIZE + WORD;
const OFF_HAS_U2F_COUNTER: usize = OFF_HOMESCREEN + HOMESCREEN_LEN;
const OFF_U2F_COUNTER: usize = OFF_HAS_U2F_COUNTER + WORD;
const OFF_HAS_NEEDS_BACKUP: usize = OFF_U2F_COUNTER + WORD;
const OFF_NEEDS_BACKUP: usize = OFF_HAS_NEEDS_BACKUP + WORD;
const OFF_HAS_FLAGS: usize = OFF_NEEDS_BACKUP + WORD;
const OFF_FLAGS: usize = OFF_HAS_FLAGS + WORD;
const OFF_HAS_U2F_ROOT: usize = OFF_FLAGS + WORD;
const OFF_U2F_ROOT: usize = OFF_HAS_U2F_ROOT + WORD;

/// Encoded record size
pub const RECORD_SIZE: usize = OFF_U2F_ROOT + NODE_SIZE;

const _: () = assert!(RECORD_SIZE % WORD == 0);
const _: () = assert!(MNEMONIC_LEN % 16 == 0);

/// Fields that older record versions ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordField {
    Imported,
    Homescreen,
    U2fCounter,
    Flags,
    U2fRoot,
}

impl RecordField {
    /// Offset just past the field, rounded up to a word
    pub const fn end_offset(self) -> usize {
        match self {
            RecordField::Imported => OFF_IMPORTED + WORD,
            RecordField::Homescreen => OFF_HOMESCREEN + HOMESCREEN_LEN,
            RecordField::U2fCounter => OFF_U2F_COUNTER + WORD,
            RecordField::Flags => OFF_FLAGS + WORD,
            RecordField::U2fRoot => OFF_U2F_ROOT + NODE_SIZE,
        }
    }
}

/// Extended private key as kept in the record
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct HdNode {
    pub depth: u32,
    pub fingerprint: u32,
    pub child_num: u32,
    pub chain_code: [u8; 32],
    pub private_key: Option<[u8; 32]>,
}

impl HdNode {
    fn encode_into(&self, out: &mut [u8]) {
        put_word(out, 0, self.depth);
        put_word(out, 4, self.fingerprint);
        put_word(out, 8, self.child_num);
        out[12..44].copy_from_slice(&self.chain_code);
        if let Some(key) = &self.private_key {
            put_word(out, 44, 1);
            out[48..80].copy_from_slice(key);
        }
    }

    fn decode(bytes: &[u8]) -> Self {
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&bytes[12..44]);
        let private_key = if word(bytes, 44) != 0 {
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes[48..80]);
            Some(key)
        } else {
            None
        };
        Self {
            depth: word(bytes, 0),
            fingerprint: word(bytes, 4),
            child_num: word(bytes, 8),
            chain_code,
            private_key,
        }
    }
}

impl fmt::Debug for HdNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HdNode")
            .field("depth", &self.depth)
            .field("fingerprint", &format_args!("{:#010x}", self.fingerprint))
            .field("child_num", &format_args!("{:#010x}", self.child_num))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

/// The persisted wallet record
///
/// Every field is independently optional. Used both for the decoded flash
/// contents and for the pending update, where `Some` marks a field touched
/// since the last commit. Copies that hold secrets are kept in
/// [`Zeroizing`] by the engine.
#[derive(Clone, Default, PartialEq, Eq, Zeroize)]
pub struct StorageRecord {
    pub version: u32,
    pub node: Option<HdNode>,
    /// Raw mnemonic field, always [`MNEMONIC_LEN`] bytes
    pub mnemonic: Option<Vec<u8>>,
    pub passphrase_protection: Option<bool>,
    /// Only present in records written by versions <= 5
    pub pin_failed_attempts: Option<u32>,
    /// Raw PIN field without terminator; empty means "no PIN"
    pub pin: Option<Vec<u8>>,
    pub language: Option<String>,
    pub label: Option<String>,
    pub imported: Option<bool>,
    pub homescreen: Option<Vec<u8>>,
    pub u2f_counter: Option<u32>,
    pub needs_backup: Option<bool>,
    pub flags: Option<u32>,
    pub u2f_root: Option<HdNode>,
}

impl StorageRecord {
    /// True when no field is set
    pub fn is_empty(&self) -> bool {
        self.node.is_none()
            && self.mnemonic.is_none()
            && self.passphrase_protection.is_none()
            && self.pin_failed_attempts.is_none()
            && self.pin.is_none()
            && self.language.is_none()
            && self.label.is_none()
            && self.imported.is_none()
            && self.homescreen.is_none()
            && self.u2f_counter.is_none()
            && self.needs_backup.is_none()
            && self.flags.is_none()
            && self.u2f_root.is_none()
    }

    /// Whether the root secret (node or mnemonic) was touched
    pub fn touches_secret(&self) -> bool {
        self.node.is_some() || self.mnemonic.is_some()
    }

    /// Apply `pending` over `persisted`
    ///
    /// Pending fields win when set. A touched node or mnemonic replaces both
    /// (they are mutually exclusive) and drops the persisted U2F root; the
    /// caller recomputes it when the mnemonic changed. Empty PIN, label or
    /// homescreen clear the field. The legacy failure counter is never
    /// carried forward.
    pub fn merge(pending: &StorageRecord, persisted: &StorageRecord) -> StorageRecord {
        let mut merged = StorageRecord {
            version: pending.version,
            ..Default::default()
        };

        if pending.touches_secret() {
            merged.node = pending.node.clone();
            merged.mnemonic = pending.mnemonic.clone();
            merged.u2f_root = pending.u2f_root.clone();
        } else {
            merged.node = persisted.node.clone();
            merged.mnemonic = persisted.mnemonic.clone();
            merged.u2f_root = persisted.u2f_root.clone();
        }

        merged.passphrase_protection = pending
            .passphrase_protection
            .or(persisted.passphrase_protection);
        merged.pin = pick(&pending.pin, &persisted.pin).filter(|pin| !pin.is_empty());
        merged.language = pick(&pending.language, &persisted.language);
        merged.label = pick(&pending.label, &persisted.label).filter(|label| !label.is_empty());
        merged.imported = pending.imported.or(persisted.imported);
        merged.homescreen =
            pick(&pending.homescreen, &persisted.homescreen).filter(|image| !image.is_empty());
        merged.u2f_counter = pending.u2f_counter.or(persisted.u2f_counter);
        merged.needs_backup = pending.needs_backup.or(persisted.needs_backup);
        merged.flags = pending.flags.or(persisted.flags);

        merged
    }

    /// Encode into the fixed flash layout
    pub fn encode(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(vec![0u8; RECORD_SIZE]);
        put_word(&mut out, OFF_VERSION, self.version);

        if let Some(node) = &self.node {
            put_word(&mut out, OFF_HAS_NODE, 1);
            node.encode_into(&mut out[OFF_NODE..OFF_NODE + NODE_SIZE]);
        }
        if let Some(mnemonic) = &self.mnemonic {
            put_word(&mut out, OFF_HAS_MNEMONIC, 1);
            put_bytes(&mut out, OFF_MNEMONIC, MNEMONIC_LEN, mnemonic);
        }
        if let Some(enabled) = self.passphrase_protection {
            put_word(&mut out, OFF_HAS_PASSPHRASE_PROTECTION, 1);
            put_word(&mut out, OFF_PASSPHRASE_PROTECTION, enabled as u32);
        }
        if let Some(attempts) = self.pin_failed_attempts {
            put_word(&mut out, OFF_HAS_PIN_FAILED_ATTEMPTS, 1);
            put_word(&mut out, OFF_PIN_FAILED_ATTEMPTS, attempts);
        }
        if let Some(pin) = &self.pin {
            put_word(&mut out, OFF_HAS_PIN, 1);
            put_bytes(&mut out, OFF_PIN, PIN_LEN - 1, pin);
        }
        if let Some(language) = &self.language {
            put_word(&mut out, OFF_HAS_LANGUAGE, 1);
            put_str(&mut out, OFF_LANGUAGE, LANGUAGE_LEN, language);
        }
        if let Some(label) = &self.label {
            put_word(&mut out, OFF_HAS_LABEL, 1);
            put_str(&mut out, OFF_LABEL, LABEL_LEN, label);
        }
        if let Some(imported) = self.imported {
            put_word(&mut out, OFF_HAS_IMPORTED, 1);
            put_word(&mut out, OFF_IMPORTED, imported as u32);
        }
        if let Some(image) = &self.homescreen {
            let size = image.len().min(HOMESCREEN_LEN);
            put_word(&mut out, OFF_HAS_HOMESCREEN, 1);
            put_word(&mut out, OFF_HOMESCREEN_SIZE, size as u32);
            put_bytes(&mut out, OFF_HOMESCREEN, HOMESCREEN_LEN, image);
        }
        if let Some(counter) = self.u2f_counter {
            put_word(&mut out, OFF_HAS_U2F_COUNTER, 1);
            put_word(&mut out, OFF_U2F_COUNTER, counter);
        }
        if let Some(needs_backup) = self.needs_backup {
            put_word(&mut out, OFF_HAS_NEEDS_BACKUP, 1);
            put_word(&mut out, OFF_NEEDS_BACKUP, needs_backup as u32);
        }
        if let Some(flags) = self.flags {
            put_word(&mut out, OFF_HAS_FLAGS, 1);
            put_word(&mut out, OFF_FLAGS, flags);
        }
        if let Some(root) = &self.u2f_root {
            put_word(&mut out, OFF_HAS_U2F_ROOT, 1);
            root.encode_into(&mut out[OFF_U2F_ROOT..OFF_U2F_ROOT + NODE_SIZE]);
        }

        out
    }

    /// Decode from the fixed flash layout
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(RecordView::new(bytes)?.to_record())
    }
}

impl fmt::Debug for StorageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageRecord")
            .field("version", &format_args!("{:#x}", self.version))
            .field("node", &self.node)
            .field("mnemonic", &self.mnemonic.as_ref().map(|_| "<redacted>"))
            .field("passphrase_protection", &self.passphrase_protection)
            .field("pin_failed_attempts", &self.pin_failed_attempts)
            .field("pin", &self.pin.as_ref().map(|_| "<redacted>"))
            .field("language", &self.language)
            .field("label", &self.label)
            .field("imported", &self.imported)
            .field("homescreen", &self.homescreen.as_ref().map(Vec::len))
            .field("u2f_counter", &self.u2f_counter)
            .field("needs_backup", &self.needs_backup)
            .field("flags", &self.flags)
            .field("u2f_root", &self.u2f_root)
            .finish()
    }
}

/// Typed, bounds-checked view of an encoded record in flash
///
/// Accessors read straight from the mapped bytes so secrets need not be
/// copied into RAM to be inspected.
#[derive(Clone, Copy)]
pub struct RecordView<'a> {
    bytes: &'a [u8],
}

impl<'a> RecordView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < RECORD_SIZE {
            return Err(StorageError::Codec(format!(
                "record needs {} bytes, got {}",
                RECORD_SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            bytes: &bytes[..RECORD_SIZE],
        })
    }

    fn has(&self, offset: usize) -> bool {
        word(self.bytes, offset) != 0
    }

    pub fn version(&self) -> u32 {
        word(self.bytes, OFF_VERSION)
    }

    pub fn has_node(&self) -> bool {
        self.has(OFF_HAS_NODE)
    }

    pub fn node(&self) -> Option<HdNode> {
        self.has_node()
            .then(|| HdNode::decode(&self.bytes[OFF_NODE..OFF_NODE + NODE_SIZE]))
    }

    pub fn has_mnemonic(&self) -> bool {
        self.has(OFF_HAS_MNEMONIC)
    }

    /// Raw mnemonic field (plaintext NUL padded, or sealed)
    pub fn mnemonic_field(&self) -> Option<&'a [u8]> {
        self.has_mnemonic()
            .then(|| &self.bytes[OFF_MNEMONIC..OFF_MNEMONIC + MNEMONIC_LEN])
    }

    pub fn passphrase_protection(&self) -> Option<bool> {
        self.has(OFF_HAS_PASSPHRASE_PROTECTION)
            .then(|| word(self.bytes, OFF_PASSPHRASE_PROTECTION) != 0)
    }

    pub fn pin_failed_attempts(&self) -> Option<u32> {
        self.has(OFF_HAS_PIN_FAILED_ATTEMPTS)
            .then(|| word(self.bytes, OFF_PIN_FAILED_ATTEMPTS))
    }

    /// PIN field up to its terminator
    pub fn pin_field(&self) -> Option<&'a [u8]> {
        self.has(OFF_HAS_PIN)
            .then(|| until_nul(&self.bytes[OFF_PIN..OFF_PIN + PIN_LEN]))
    }

    pub fn language(&self) -> Option<String> {
        self.has(OFF_HAS_LANGUAGE)
            .then(|| text(&self.bytes[OFF_LANGUAGE..OFF_LANGUAGE + LANGUAGE_LEN]))
    }

    pub fn label(&self) -> Option<String> {
        self.has(OFF_HAS_LABEL)
            .then(|| text(&self.bytes[OFF_LABEL..OFF_LABEL + LABEL_LEN]))
    }

    pub fn imported(&self) -> Option<bool> {
        self.has(OFF_HAS_IMPORTED)
            .then(|| word(self.bytes, OFF_IMPORTED) != 0)
    }

    pub fn homescreen(&self) -> Option<&'a [u8]> {
        if !self.has(OFF_HAS_HOMESCREEN) {
            return None;
        }
        let size = (word(self.bytes, OFF_HOMESCREEN_SIZE) as usize).min(HOMESCREEN_LEN);
        Some(&self.bytes[OFF_HOMESCREEN..OFF_HOMESCREEN + size])
    }

    pub fn u2f_counter(&self) -> Option<u32> {
        self.has(OFF_HAS_U2F_COUNTER)
            .then(|| word(self.bytes, OFF_U2F_COUNTER))
    }

    pub fn needs_backup(&self) -> Option<bool> {
        self.has(OFF_HAS_NEEDS_BACKUP)
            .then(|| word(self.bytes, OFF_NEEDS_BACKUP) != 0)
    }

    pub fn flags(&self) -> Option<u32> {
        self.has(OFF_HAS_FLAGS).then(|| word(self.bytes, OFF_FLAGS))
    }

    pub fn u2f_root(&self) -> Option<HdNode> {
        self.has(OFF_HAS_U2F_ROOT)
            .then(|| HdNode::decode(&self.bytes[OFF_U2F_ROOT..OFF_U2F_ROOT + NODE_SIZE]))
    }

    /// Owned copy of every field
    pub fn to_record(&self) -> StorageRecord {
        StorageRecord {
            version: self.version(),
            node: self.node(),
            mnemonic: self.mnemonic_field().map(<[u8]>::to_vec),
            passphrase_protection: self.passphrase_protection(),
            pin_failed_attempts: self.pin_failed_attempts(),
            pin: self.pin_field().map(<[u8]>::to_vec),
            language: self.language(),
            label: self.label(),
            imported: self.imported(),
            homescreen: self.homescreen().map(<[u8]>::to_vec),
            u2f_counter: self.u2f_counter(),
            needs_backup: self.needs_backup(),
            flags: self.flags(),
            u2f_root: self.u2f_root(),
        }
    }
}

fn pick<T: Clone>(pending: &Option<T>, persisted: &Option<T>) -> Option<T> {
    pending.as_ref().or(persisted.as_ref()).cloned()
}

fn word(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn put_word(out: &mut [u8], offset: usize, value: u32) {
    out[offset..offset + WORD].copy_from_slice(&value.to_le_bytes());
}

/// Copy at most `max` bytes of `value` to `offset`; the rest stays zero
fn put_bytes(out: &mut [u8], offset: usize, max: usize, value: &[u8]) {
    let len = value.len().min(max);
    out[offset..offset + len].copy_from_slice(&value[..len]);
}

/// NUL-terminated string in a `capacity` byte buffer, truncated on a char boundary
fn put_str(out: &mut [u8], offset: usize, capacity: usize, value: &str) {
    let mut len = value.len().min(capacity - 1);
    while !value.is_char_boundary(len) {
        len -= 1;
    }
    put_bytes(out, offset, len, value.as_bytes());
}

fn until_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(until_nul(bytes)).into_owned()
}

/// Zero-pad a plaintext mnemonic to the field size
pub fn mnemonic_field(phrase: &str) -> Vec<u8> {
    let mut field = vec![0u8; MNEMONIC_LEN];
    let len = phrase.len().min(MNEMONIC_LEN - 1);
    field[..len].copy_from_slice(&phrase.as_bytes()[..len]);
    field
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node() -> HdNode {
        HdNode {
            depth: 1,
            fingerprint: 0xdead_beef,
            child_num: 0x8000_002c,
            chain_code: [0x11; 32],
            private_key: Some([0x22; 32]),
        }
    }

    #[test]
    fn test_layout_offsets() {
        assert_eq!(OFF_HAS_MNEMONIC, 0x58);
        assert_eq!(OFF_HAS_PASSPHRASE_PROTECTION, 0x14c);
        assert_eq!(OFF_HAS_PIN, 0x15c);
        assert_eq!(OFF_HAS_IMPORTED, 0x1ac);
        assert_eq!(OFF_HAS_U2F_COUNTER, 0x5bc);
        assert_eq!(OFF_HAS_U2F_ROOT, 0x5d4);
        assert_eq!(RECORD_SIZE, 0x628);
    }

    #[test]
    fn test_record_roundtrip() {
        let record = StorageRecord {
            version: 0x0001_0001,
            node: Some(sample_node()),
            passphrase_protection: Some(true),
            pin: Some(b"1234".to_vec()),
            language: Some("EN".to_string()),
            label: Some("My wallet".to_string()),
            imported: Some(true),
            homescreen: Some(vec![0xa5; HOMESCREEN_LEN]),
            u2f_counter: Some(77),
            needs_backup: Some(false),
            flags: Some(0b101),
            ..Default::default()
        };

        let bytes = record.encode();
        assert_eq!(bytes.len(), RECORD_SIZE);

        let decoded = StorageRecord::decode(&bytes).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_absent_fields_encode_as_zero() {
        let record = StorageRecord {
            version: 3,
            ..Default::default()
        };
        let bytes = record.encode();
        assert_eq!(word(&bytes, 0), 3);
        assert!(bytes[4..].iter().all(|&b| b == 0));

        let view = RecordView::new(&bytes).unwrap();
        assert!(!view.has_node());
        assert!(!view.has_mnemonic());
        assert_eq!(view.flags(), None);
    }

    #[test]
    fn test_presence_word_independent_of_value() {
        let record = StorageRecord {
            u2f_counter: Some(0),
            flags: Some(0),
            ..Default::default()
        };
        let view_bytes = record.encode();
        let view = RecordView::new(&view_bytes).unwrap();
        assert_eq!(view.u2f_counter(), Some(0));
        assert_eq!(view.flags(), Some(0));
        assert_eq!(view.needs_backup(), None);
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(matches!(
            StorageRecord::decode(&[0u8; 16]),
            Err(StorageError::Codec(_))
        ));
    }

    #[test]
    fn test_long_label_truncated() {
        let record = StorageRecord {
            label: Some("x".repeat(64)),
            ..Default::default()
        };
        let decoded = StorageRecord::decode(&record.encode()).unwrap();
        assert_eq!(decoded.label.unwrap().len(), LABEL_LEN - 1);
    }

    #[test]
    fn test_mnemonic_field_padding() {
        let field = mnemonic_field("abandon ability");
        assert_eq!(field.len(), MNEMONIC_LEN);
        assert_eq!(&field[..15], b"abandon ability");
        assert!(field[15..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_merge_pending_wins() {
        let persisted = StorageRecord {
            label: Some("old".to_string()),
            language: Some("EN".to_string()),
            u2f_counter: Some(5),
            ..Default::default()
        };
        let pending = StorageRecord {
            label: Some("new".to_string()),
            ..Default::default()
        };

        let merged = StorageRecord::merge(&pending, &persisted);
        assert_eq!(merged.label.as_deref(), Some("new"));
        assert_eq!(merged.language.as_deref(), Some("EN"));
        assert_eq!(merged.u2f_counter, Some(5));
    }

    #[test]
    fn test_merge_empty_values_clear() {
        let persisted = StorageRecord {
            label: Some("old".to_string()),
            pin: Some(b"1234".to_vec()),
            homescreen: Some(vec![1; HOMESCREEN_LEN]),
            ..Default::default()
        };
        let pending = StorageRecord {
            label: Some(String::new()),
            pin: Some(Vec::new()),
            homescreen: Some(Vec::new()),
            ..Default::default()
        };

        let merged = StorageRecord::merge(&pending, &persisted);
        assert_eq!(merged.label, None);
        assert_eq!(merged.pin, None);
        assert_eq!(merged.homescreen, None);
    }

    #[test]
    fn test_merge_node_replaces_mnemonic() {
        let persisted = StorageRecord {
            mnemonic: Some(mnemonic_field("abandon")),
            u2f_root: Some(sample_node()),
            ..Default::default()
        };
        let pending = StorageRecord {
            node: Some(sample_node()),
            ..Default::default()
        };

        let merged = StorageRecord::merge(&pending, &persisted);
        assert!(merged.node.is_some());
        assert!(merged.mnemonic.is_none());
        assert!(merged.u2f_root.is_none());
    }

    #[test]
    fn test_merge_drops_legacy_counter() {
        let persisted = StorageRecord {
            pin_failed_attempts: Some(4),
            ..Default::default()
        };
        let merged = StorageRecord::merge(&StorageRecord::default(), &persisted);
        assert_eq!(merged.pin_failed_attempts, None);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let record = StorageRecord {
            mnemonic: Some(mnemonic_field("abandon abandon")),
            pin: Some(b"9999".to_vec()),
            node: Some(sample_node()),
            ..Default::default()
        };
        let rendered = format!("{:?}", record);
        assert!(!rendered.contains("abandon"));
        assert!(!rendered.contains("9999"));
        assert!(rendered.contains("<redacted>"));
    }
}
