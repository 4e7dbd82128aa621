//! The storage engine
//!
//! Owns the flash, the pending update and the session cache. Mutators stage
//! fields in the pending update; [`StorageEngine::commit`] merges them over
//! the persisted record and rewrites the meta sector. The PIN failure and
//! U2F journals live in the journal sector and are written in place.
//!
//! Any flash failure while writing is fatal: the UI is told, the engine
//! halts, and every later call returns [`StorageError::Halted`].

mod counters;
mod secrets;

use std::fmt;

use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

pub use secrets::{LoadDevice, SESSION_STATE_LEN};

use crate::crypto::{CryptoProvider, SoftwareCrypto};
use crate::error::{FlashError, Result, StorageError};
use crate::flash::{Flash, FlashSession};
use crate::gate::{PlaintextPinGate, SecretGate};
use crate::journal;
use crate::layout::{FlashLayout, STORAGE_MAGIC, UUID_LEN};
use crate::migration::{MigrationPlan, STORAGE_VERSION};
use crate::record::{RecordView, StorageRecord, HOMESCREEN_LEN, RECORD_SIZE};
use crate::session::SessionCache;
use crate::ui::{StorageUi, TracingUi};

/// Languages the device accepts
pub const LANGUAGES: [&str; 3] = ["EN", "FR", "DE"];

/// Typed view of the record currently in flash
fn record_view<'f, F: Flash>(flash: &'f F, layout: &FlashLayout) -> Result<RecordView<'f>> {
    let bytes = flash.read(layout.record_start(), RECORD_SIZE as u32)?;
    RecordView::new(bytes)
}

/// Builder for [`StorageEngine`]
///
/// Defaults to the standard layout, the plaintext PIN gate, software crypto
/// and a `tracing` backed UI.
pub struct EngineBuilder {
    layout: FlashLayout,
    gate: Box<dyn SecretGate>,
    crypto: Box<dyn CryptoProvider>,
    ui: Box<dyn StorageUi>,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            layout: FlashLayout::default(),
            gate: Box::new(PlaintextPinGate),
            crypto: Box::new(SoftwareCrypto),
            ui: Box::new(TracingUi),
        }
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layout(mut self, layout: FlashLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn gate(mut self, gate: impl SecretGate + 'static) -> Self {
        self.gate = Box::new(gate);
        self
    }

    pub fn crypto(mut self, crypto: impl CryptoProvider + 'static) -> Self {
        self.crypto = Box::new(crypto);
        self
    }

    pub fn ui(mut self, ui: impl StorageUi + 'static) -> Self {
        self.ui = Box::new(ui);
        self
    }

    /// Engine over `flash` without touching it
    pub fn build<F: Flash>(self, flash: F) -> Result<StorageEngine<F>> {
        self.layout.validate()?;
        flash.read(0, self.layout.region_len())?;

        Ok(StorageEngine {
            flash,
            layout: self.layout,
            gate: self.gate,
            crypto: self.crypto,
            ui: self.ui,
            pending: Zeroizing::default(),
            uuid: [0u8; UUID_LEN],
            u2f_offset: 0,
            session: SessionCache::new(),
            gate_ready: false,
            halted: false,
        })
    }

    /// Engine over `flash`, initialised: the gate is brought up and the
    /// storage is loaded, or wiped when it is absent or unsupported
    pub fn open<F: Flash>(self, flash: F) -> Result<StorageEngine<F>> {
        let mut engine = self.build(flash)?;
        engine.gate_ready = engine.gate.init();
        if !engine.load()? {
            engine.wipe()?;
        }
        Ok(engine)
    }
}

/// Flash-backed storage for wallet secrets, settings and counters
pub struct StorageEngine<F: Flash> {
    flash: F,
    layout: FlashLayout,
    gate: Box<dyn SecretGate>,
    crypto: Box<dyn CryptoProvider>,
    ui: Box<dyn StorageUi>,
    pending: Zeroizing<StorageRecord>,
    uuid: [u8; UUID_LEN],
    u2f_offset: u32,
    session: SessionCache,
    gate_ready: bool,
    halted: bool,
}

impl<F: Flash> fmt::Debug for StorageEngine<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageEngine")
            .field("layout", &self.layout)
            .field("uuid", &self.uuid_hex())
            .field("u2f_offset", &self.u2f_offset)
            .field("pending", &!self.pending.is_empty())
            .field("halted", &self.halted)
            .finish_non_exhaustive()
    }
}

impl<F: Flash> StorageEngine<F> {
    /// Shorthand for [`EngineBuilder::new`]
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Direct flash access, bypassing the engine
    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_flash(self) -> F {
        self.flash
    }

    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    /// Whether the secret gate came up at construction
    pub fn gate_ready(&self) -> bool {
        self.gate_ready
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Whether any field is staged for the next commit
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn uuid(&self) -> &[u8; UUID_LEN] {
        &self.uuid
    }

    pub fn uuid_hex(&self) -> String {
        hex::encode_upper(self.uuid)
    }

    fn guard(&self) -> Result<()> {
        if self.halted {
            return Err(StorageError::Halted);
        }
        Ok(())
    }

    /// Enter the halted state
    fn fatal(&mut self, reason: impl fmt::Display) -> StorageError {
        error!(%reason, "storage failure");
        self.halted = true;
        self.ui.storage_failure();
        StorageError::Fatal(reason.to_string())
    }

    /// Run `op` inside an unlocked flash session and check the lock status
    fn with_flash<T>(
        &mut self,
        op: impl FnOnce(&mut FlashSession<'_, F>) -> std::result::Result<T, FlashError>,
    ) -> Result<T> {
        let mut session = FlashSession::begin(&mut self.flash);
        let outcome = op(&mut session);
        let status = session.finish();
        match (outcome, status) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(error), _) | (Ok(_), Err(error)) => Err(self.fatal(error)),
        }
    }

    fn view(&self) -> Result<RecordView<'_>> {
        record_view(&self.flash, &self.layout)
    }

    /// Load the header and record from flash, migrating older versions
    ///
    /// Returns `false` when the storage is absent or was written by a newer
    /// version; the caller is expected to wipe.
    pub fn load(&mut self) -> Result<bool> {
        self.guard()?;
        self.pending = Zeroizing::default();

        let layout = self.layout;
        let magic = self.flash.read_word(layout.storage_start())?;
        if magic != STORAGE_MAGIC {
            info!(magic = %format!("{:#010x}", magic), "no storage found");
            return Ok(false);
        }

        let version = self.flash.read_word(layout.record_start())?;
        let plan = match MigrationPlan::for_version(version) {
            Some(plan) => plan,
            None => {
                warn!(version, current = STORAGE_VERSION, "storage written by a newer version");
                return Ok(false);
            }
        };

        self.uuid
            .copy_from_slice(self.flash.read(layout.uuid_start(), UUID_LEN as u32)?);

        let fill = plan.zero_fill();
        if !fill.is_empty() {
            debug!(version, from = fill.start, "clearing fields added after this version");
            let start = layout.record_start() + fill.start as u32;
            let end = layout.record_start() + fill.end as u32;
            self.with_flash(|session| session.zero_fill(start..end))?;
        }

        if plan.convert_pin_counter {
            let failures = self.view()?.pin_failed_attempts().unwrap_or(0);
            let word = journal::failure_word(failures);
            debug!(failures, "moving legacy PIN counter into the journal");
            self.with_flash(|session| {
                session.erase_sector(layout.journal_sector)?;
                session.write_word(layout.pin_area().start, word)
            })?;
        }

        self.u2f_offset = self.scan_u2f_offset()?;

        if plan.recompute_u2f_root {
            let field = self.view()?.mnemonic_field().map(<[u8]>::to_vec);
            if field.is_some() {
                self.pending.mnemonic = field;
            }
        }

        if plan.needs_commit {
            info!(from = version, to = STORAGE_VERSION, "upgrading storage");
            self.write_meta(true)?;
        }

        info!(uuid = %self.uuid_hex(), u2f_offset = self.u2f_offset, "storage loaded");
        Ok(true)
    }

    /// Merge the pending update over the persisted record and rewrite the
    /// meta sector
    pub fn commit(&mut self) -> Result<()> {
        self.guard()?;
        self.write_meta(true)
    }

    /// Erase everything: secure element zone, session, record and journals.
    /// A fresh uuid is generated.
    pub fn wipe(&mut self) -> Result<()> {
        self.guard()?;
        if let Err(error) = self.gate.wipe() {
            warn!(%error, "secret gate wipe failed");
        }
        self.session_clear(true);
        self.crypto.random_bytes(&mut self.uuid);

        self.write_meta(false)?;

        let journal_sector = self.layout.journal_sector;
        self.with_flash(|session| session.erase_sector(journal_sector))?;
        self.u2f_offset = 0;

        info!(uuid = %self.uuid_hex(), "storage wiped");
        Ok(())
    }

    /// Rewrite the meta sector: descriptor, header and (when `update`) the
    /// merged record, then zero fill to the end of the sector
    ///
    /// The pending update is consumed whatever the outcome.
    fn write_meta(&mut self, update: bool) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);

        let encoded = if update {
            if pending.passphrase_protection.is_some() {
                self.session.invalidate_seed();
                self.session.clear_passphrase();
            }
            if pending.pin.is_some() {
                self.session.set_pin_cached(false);
            }
            let merged = self.merge(&pending)?;
            Some(merged.encode())
        } else {
            None
        };
        drop(pending);

        let layout = self.layout;
        let descriptor = self.flash.read(0, layout.descriptor_len)?.to_vec();
        let uuid = self.uuid;

        // The magic goes in last: until it is programmed the sector reads
        // as uninitialized and the next load wipes it.
        self.with_flash(|session| {
            session.erase_sector(layout.meta_sector)?;
            let magic_addr = session.write_bytes(0, &descriptor)?;
            let mut addr = session.write_bytes(magic_addr + 4, &uuid)?;
            if let Some(record) = &encoded {
                addr = session.write_bytes(addr, record)?;
            }
            session.zero_fill(addr..layout.journal_start())?;
            session.write_word(magic_addr, STORAGE_MAGIC)
        })?;

        debug!(update, "meta sector rewritten");
        Ok(())
    }

    /// Pending over persisted, with the U2F root recomputed when the
    /// mnemonic changed
    fn merge(&mut self, pending: &StorageRecord) -> Result<Zeroizing<StorageRecord>> {
        let persisted = Zeroizing::new(self.view()?.to_record());
        let mut merged = Zeroizing::new(StorageRecord::merge(pending, &persisted));
        merged.version = STORAGE_VERSION;

        if let Some(field) = &pending.mnemonic {
            let pin_set = merged.pin.as_ref().is_some_and(|pin| !pin.is_empty());
            merged.u2f_root = self.compute_u2f_root(field, pin_set);
        }
        Ok(merged)
    }

    /// Zero the magic, reset the journal sector with `fail_word` as the
    /// first PIN failure word, fold the U2F offset into the counter base
    /// and commit
    fn recycle(&mut self, fail_word: u32) -> Result<()> {
        let layout = self.layout;
        let magic_addr = layout.storage_start();
        let fail_addr = layout.pin_area().start;

        info!(u2f_offset = self.u2f_offset, "recycling journal sector");
        self.with_flash(|session| {
            session.write_word(magic_addr, 0)?;
            if session.read_word(magic_addr)? != 0 {
                return Err(FlashError::Program(magic_addr));
            }
            session.erase_sector(layout.journal_sector)?;
            session.write_word(fail_addr, fail_word)?;
            if session.read_word(fail_addr)? != fail_word {
                return Err(FlashError::Program(fail_addr));
            }
            Ok(())
        })?;

        let base = match self.pending.u2f_counter {
            Some(base) => base,
            None => self.view()?.u2f_counter().unwrap_or(0),
        };
        self.pending.u2f_counter = Some(base.wrapping_add(self.u2f_offset));
        self.u2f_offset = 0;

        self.write_meta(true)
    }

    /// A node or a mnemonic is stored
    pub fn is_initialized(&self) -> Result<bool> {
        self.guard()?;
        let view = self.view()?;
        Ok(view.has_node() || view.has_mnemonic())
    }

    pub fn label(&self) -> Result<Option<String>> {
        self.guard()?;
        Ok(self.view()?.label())
    }

    /// Stage a new label; an empty label clears it
    pub fn set_label(&mut self, label: &str) {
        self.pending.label = Some(label.to_owned());
    }

    pub fn language(&self) -> Result<Option<String>> {
        self.guard()?;
        Ok(self.view()?.language())
    }

    /// Stage a language code; `"english"` maps to `"EN"` and anything but
    /// EN, FR or DE is ignored. Returns whether it was staged.
    pub fn set_language(&mut self, language: &str) -> bool {
        let code = if language == "english" { "EN" } else { language };
        if !LANGUAGES.contains(&code) {
            debug!(language, "ignoring unsupported language");
            return false;
        }
        self.pending.language = Some(code.to_owned());
        true
    }

    /// Stored homescreen, only when it is a full bitmap
    pub fn homescreen(&self) -> Result<Option<Vec<u8>>> {
        self.guard()?;
        Ok(self
            .view()?
            .homescreen()
            .filter(|image| image.len() == HOMESCREEN_LEN)
            .map(<[u8]>::to_vec))
    }

    /// Stage a homescreen; anything but a full bitmap clears it
    pub fn set_homescreen(&mut self, image: Option<&[u8]>) {
        let image = match image {
            Some(image) if image.len() == HOMESCREEN_LEN => image.to_vec(),
            _ => Vec::new(),
        };
        self.pending.homescreen = Some(image);
    }

    pub fn is_imported(&self) -> Result<bool> {
        self.guard()?;
        Ok(self.view()?.imported() == Some(true))
    }

    pub fn set_imported(&mut self, imported: bool) {
        self.pending.imported = Some(imported);
    }

    /// Pending value first, then the persisted one
    pub fn needs_backup(&self) -> Result<bool> {
        self.guard()?;
        if let Some(needs_backup) = self.pending.needs_backup {
            return Ok(needs_backup);
        }
        Ok(self.view()?.needs_backup() == Some(true))
    }

    pub fn set_needs_backup(&mut self, needs_backup: bool) {
        self.pending.needs_backup = Some(needs_backup);
    }

    /// Pending flags first, then the persisted ones
    pub fn get_flags(&self) -> Result<u32> {
        self.guard()?;
        if let Some(flags) = self.pending.flags {
            return Ok(flags);
        }
        Ok(self.view()?.flags().unwrap_or(0))
    }

    /// OR `flags` into the stored flags. Returns `false` and stages nothing
    /// when every bit is already set.
    pub fn apply_flags(&mut self, flags: u32) -> Result<bool> {
        let current = self.get_flags()?;
        if current | flags == current {
            return Ok(false);
        }
        self.pending.flags = Some(current | flags);
        Ok(true)
    }

    pub fn has_passphrase_protection(&self) -> Result<bool> {
        self.guard()?;
        Ok(self.view()?.passphrase_protection() == Some(true))
    }

    /// Stage passphrase protection; drops the cached seed and passphrase
    pub fn set_passphrase_protection(&mut self, enabled: bool) {
        self.session.invalidate_seed();
        self.session.clear_passphrase();
        self.pending.passphrase_protection = Some(enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemoryFlash;

    fn engine() -> StorageEngine<MemoryFlash> {
        StorageEngine::<MemoryFlash>::builder()
            .open(MemoryFlash::new(FlashLayout::default()))
            .unwrap()
    }

    #[test]
    fn test_open_wipes_blank_flash() {
        let engine = engine();
        assert!(!engine.is_initialized().unwrap());
        assert_eq!(
            engine.flash().read_word(engine.layout().storage_start()).unwrap(),
            STORAGE_MAGIC
        );
        assert_ne!(engine.uuid(), &[0u8; UUID_LEN]);
        assert!(engine.gate_ready());
    }

    #[test]
    fn test_descriptor_preserved() {
        let layout = FlashLayout::default();
        let mut flash = MemoryFlash::new(layout);
        {
            let mut session = FlashSession::begin(&mut flash);
            session.write_word(0, 0x1234_5678).unwrap();
            session.write_word(0xfc, 0x0bad_f00d).unwrap();
            session.finish().unwrap();
        }

        let mut engine = StorageEngine::<MemoryFlash>::builder().open(flash).unwrap();
        engine.set_label("kept");
        engine.commit().unwrap();

        assert_eq!(engine.flash().read_word(0).unwrap(), 0x1234_5678);
        assert_eq!(engine.flash().read_word(0xfc).unwrap(), 0x0bad_f00d);
    }

    #[test]
    fn test_meta_sector_zero_filled() {
        let engine = engine();
        let layout = *engine.layout();
        let tail = engine
            .flash()
            .read(layout.record_start(), layout.journal_start() - layout.record_start())
            .unwrap();
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_set_language() {
        let mut engine = engine();
        assert!(engine.set_language("english"));
        assert!(!engine.set_language("klingon"));
        engine.commit().unwrap();
        assert_eq!(engine.language().unwrap().as_deref(), Some("EN"));
    }

    #[test]
    fn test_homescreen_requires_full_bitmap() {
        let mut engine = engine();
        engine.set_homescreen(Some(&[0x55; HOMESCREEN_LEN]));
        engine.commit().unwrap();
        assert_eq!(engine.homescreen().unwrap(), Some(vec![0x55; HOMESCREEN_LEN]));

        engine.set_homescreen(Some(&[0x55; 10]));
        engine.commit().unwrap();
        assert_eq!(engine.homescreen().unwrap(), None);
    }

    #[test]
    fn test_needs_backup_reads_pending_first() {
        let mut engine = engine();
        assert!(!engine.needs_backup().unwrap());
        engine.set_needs_backup(true);
        assert!(engine.needs_backup().unwrap());
    }

    #[test]
    fn test_flags_keep_persisted_bits() {
        let mut engine = engine();
        assert!(engine.apply_flags(0b0001).unwrap());
        engine.commit().unwrap();
        assert!(engine.apply_flags(0b0100).unwrap());
        engine.commit().unwrap();
        assert_eq!(engine.get_flags().unwrap(), 0b0101);
    }

    #[test]
    fn test_pending_cleared_after_commit() {
        let mut engine = engine();
        engine.set_label("x");
        assert!(engine.has_pending());
        engine.commit().unwrap();
        assert!(!engine.has_pending());
    }

    #[test]
    fn test_uuid_survives_reload() {
        let engine = engine();
        let uuid = *engine.uuid();
        let flash = engine.into_flash();
        let reopened = StorageEngine::<MemoryFlash>::builder().open(flash).unwrap();
        assert_eq!(reopened.uuid(), &uuid);
        assert_eq!(reopened.uuid_hex().len(), 2 * UUID_LEN);
    }
}
