//! End-to-end tests for the storage engine over simulated flash

use std::cell::Cell;
use std::rc::Rc;

use norvault_core::{
    Curve, EngineBuilder, Flash, FlashLayout, FlashSession, HdNode, MemoryFlash, StorageEngine,
    StorageError, StorageUi, RECORD_SIZE, STORAGE_MAGIC, STORAGE_VERSION,
};
use zeroize::Zeroizing;

const PHRASE_12: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

const PHRASE_24: &str = "abandon abandon abandon abandon abandon abandon abandon abandon \
                         abandon abandon abandon abandon abandon abandon abandon abandon \
                         abandon abandon abandon abandon abandon abandon abandon art";

/// UI that answers passphrase prompts and records failures
#[derive(Clone, Default)]
struct TestUi {
    passphrase: Option<&'static str>,
    failed: Rc<Cell<bool>>,
    progress_calls: Rc<Cell<u32>>,
}

impl StorageUi for TestUi {
    fn progress(&mut self, _label: &str, _permille: u32) {
        self.progress_calls.set(self.progress_calls.get() + 1);
    }

    fn storage_failure(&mut self) {
        self.failed.set(true);
    }

    fn request_passphrase(&mut self) -> Option<Zeroizing<String>> {
        self.passphrase.map(|p| Zeroizing::new(p.to_owned()))
    }
}

fn open(layout: FlashLayout) -> StorageEngine<MemoryFlash> {
    EngineBuilder::new()
        .layout(layout)
        .open(MemoryFlash::new(layout))
        .unwrap()
}

fn meta_sector(engine: &StorageEngine<MemoryFlash>) -> Vec<u8> {
    let layout = engine.layout();
    engine
        .flash()
        .read(0, layout.journal_start())
        .unwrap()
        .to_vec()
}

fn reopen(engine: StorageEngine<MemoryFlash>) -> StorageEngine<MemoryFlash> {
    let layout = *engine.layout();
    EngineBuilder::new().layout(layout).open(engine.into_flash()).unwrap()
}

// ============================================
// Scenario A: fresh device
// ============================================

#[test]
fn test_fresh_device_lifecycle() {
    let mut engine = open(FlashLayout::default());
    assert!(!engine.is_initialized().unwrap());

    engine.set_mnemonic(PHRASE_12).unwrap();
    engine.commit().unwrap();
    assert!(engine.is_initialized().unwrap());

    let seed = engine.get_seed(false).unwrap().unwrap();
    assert_eq!(
        hex::encode(&seed[..]),
        "5eb00bbddcf069084889a8ab9155568165f5c453ccb85e70811aaed6f6da5fc1\
         9a5ac40b389cd370d086206dec8aa6c43daea6690f20ad3d8d48b2d2ce9e38e4"
    );

    let mut engine = reopen(engine);
    assert!(engine.is_initialized().unwrap());
    assert_eq!(engine.get_seed(false).unwrap().unwrap(), seed);
}

#[test]
fn test_24_word_mnemonic_with_passphrase() {
    let layout = FlashLayout::default();
    let ui = TestUi {
        passphrase: Some("TREZOR"),
        ..Default::default()
    };
    let mut engine = EngineBuilder::new()
        .ui(ui.clone())
        .open(MemoryFlash::new(layout))
        .unwrap();

    engine.set_mnemonic(PHRASE_24).unwrap();
    engine.set_passphrase_protection(true);
    engine.commit().unwrap();

    let seed = engine.get_seed(true).unwrap().unwrap();
    assert_eq!(
        hex::encode(&seed[..]),
        "bda85446c68413707090a52022edd26a1c9462295029f2e60cd7c4f2bbd30971\
         70af7a4d73245cafa9c3cca8d561a7c3de6f5d4a10be8ed2a5e608d68f92fcc8"
    );
    assert!(ui.progress_calls.get() > 0);
}

#[test]
fn test_root_node_derived_from_seed() {
    let mut engine = open(FlashLayout::default());
    engine.set_mnemonic(PHRASE_12).unwrap();
    engine.commit().unwrap();

    let node = engine.get_root_node(Curve::Secp256k1, false).unwrap().unwrap();
    assert_eq!(node.depth, 0);
    assert!(node.private_key.is_some());

    let nist = engine.get_root_node(Curve::Nist256p1, false).unwrap().unwrap();
    assert_ne!(node.private_key, nist.private_key);
}

// ============================================
// Scenario B: PIN anti-hammering
// ============================================

#[test]
fn test_pin_failures_then_success() {
    let mut engine = open(FlashLayout::default());
    engine.set_pin("1234").unwrap();
    engine.commit().unwrap();

    let addr = engine.pin_fail_address().unwrap();
    assert_eq!(addr, 0x4000);

    for _ in 0..5 {
        assert!(!engine.contains_pin("0000").unwrap());
        assert!(engine.record_pin_failure(addr).unwrap());
    }
    assert_eq!(engine.pin_fail_count().unwrap(), 5);
    assert_eq!(engine.pin_wait_time(addr).unwrap(), 31);

    assert!(engine.contains_pin("1234").unwrap());
    engine.reset_pin_failures(addr).unwrap();
    engine.cache_pin();

    assert_eq!(engine.flash().read_word(0x4000).unwrap(), 0);
    assert_eq!(engine.pin_fail_address().unwrap(), 0x4004);
    assert_eq!(engine.pin_fail_count().unwrap(), 0);
    assert!(engine.is_pin_cached());
}

#[test]
fn test_pin_failures_survive_reload() {
    let mut engine = open(FlashLayout::default());
    let addr = engine.pin_fail_address().unwrap();
    engine.record_pin_failure(addr).unwrap();
    engine.record_pin_failure(addr).unwrap();

    let engine = reopen(engine);
    assert_eq!(engine.pin_fail_count().unwrap(), 2);
}

// ============================================
// Scenario C: U2F counter recycling
// ============================================

#[test]
fn test_u2f_counter_recycles_once() {
    let layout = FlashLayout::compact();
    assert_eq!(layout.u2f_capacity(), 256);

    let mut engine = open(layout);
    engine.set_u2f_counter(1000);
    engine.commit().unwrap();

    let erases_before = engine.flash().erase_count();
    let mut last = 1000;
    for _ in 0..300 {
        let value = engine.next_u2f_counter().unwrap();
        assert_eq!(value, last + 1);
        last = value;
    }
    assert_eq!(last, 1300);

    // one recycle: journal sector erase plus the meta sector rewrite
    assert_eq!(engine.flash().erase_count() - erases_before, 2);
    assert_eq!(engine.u2f_offset(), 44);

    let engine = reopen(engine);
    assert_eq!(engine.u2f_counter().unwrap(), 1300);
}

#[test]
fn test_u2f_offset_recovered_after_reload() {
    let mut engine = open(FlashLayout::default());
    for _ in 0..70 {
        engine.next_u2f_counter().unwrap();
    }
    let engine = reopen(engine);
    assert_eq!(engine.u2f_offset(), 70);
    assert_eq!(engine.u2f_counter().unwrap(), 70);
}

// ============================================
// Scenario D: monotonic flags
// ============================================

#[test]
fn test_flags_are_monotonic() {
    let mut engine = open(FlashLayout::default());
    assert!(engine.apply_flags(0b0001).unwrap());
    engine.commit().unwrap();

    assert!(engine.apply_flags(0b0010).unwrap());
    assert_eq!(engine.get_flags().unwrap(), 0b0011);
    engine.commit().unwrap();

    let writes = engine.flash().write_count();
    assert!(!engine.apply_flags(0b0001).unwrap());
    assert!(!engine.has_pending());
    assert_eq!(engine.flash().write_count(), writes);
    assert_eq!(engine.get_flags().unwrap(), 0b0011);
}

// ============================================
// Commit semantics
// ============================================

#[test]
fn test_commit_merges_untouched_fields() {
    let mut engine = open(FlashLayout::default());
    engine.set_label("wallet");
    engine.set_pin("1234").unwrap();
    engine.commit().unwrap();

    engine.set_language("FR");
    engine.commit().unwrap();

    assert_eq!(engine.label().unwrap().as_deref(), Some("wallet"));
    assert_eq!(engine.language().unwrap().as_deref(), Some("FR"));
    assert!(engine.has_pin().unwrap());

    engine.set_label("");
    engine.commit().unwrap();
    assert_eq!(engine.label().unwrap(), None);
}

#[test]
fn test_node_and_mnemonic_are_exclusive() {
    let mut engine = open(FlashLayout::default());
    engine.set_node(HdNode {
        chain_code: [4u8; 32],
        private_key: Some([5u8; 32]),
        ..Default::default()
    });
    engine.commit().unwrap();
    assert!(engine.has_node().unwrap());

    engine.set_mnemonic(PHRASE_12).unwrap();
    engine.commit().unwrap();
    assert!(engine.has_mnemonic().unwrap());
    assert!(!engine.has_node().unwrap());
    assert!(engine.get_u2f_root().unwrap().is_some());
}

#[test]
fn test_pending_mnemonic_visible_before_commit() {
    let mut engine = open(FlashLayout::default());
    engine.set_mnemonic(PHRASE_12).unwrap();
    assert_eq!(engine.get_mnemonic().unwrap().unwrap().as_str(), PHRASE_12);
    assert!(!engine.is_initialized().unwrap());
}

#[test]
fn test_passphrase_protection_change_clears_session() {
    let mut engine = open(FlashLayout::default());
    engine.set_mnemonic(PHRASE_12).unwrap();
    engine.commit().unwrap();
    engine.cache_passphrase("x");
    engine.get_seed(false).unwrap();

    engine.set_passphrase_protection(true);
    assert!(!engine.is_passphrase_cached());
    engine.commit().unwrap();
    assert!(engine.has_passphrase_protection().unwrap());
}

#[test]
fn test_set_pin_clears_cached_pin() {
    let mut engine = open(FlashLayout::default());
    engine.cache_pin();
    engine.set_pin("42").unwrap();
    assert!(!engine.is_pin_cached());
}

// ============================================
// Wipe
// ============================================

#[test]
fn test_wipe_resets_everything() {
    let mut engine = open(FlashLayout::default());
    engine.set_mnemonic(PHRASE_12).unwrap();
    engine.set_label("gone");
    engine.commit().unwrap();
    let addr = engine.pin_fail_address().unwrap();
    engine.record_pin_failure(addr).unwrap();
    engine.next_u2f_counter().unwrap();
    engine.cache_pin();
    let uuid = *engine.uuid();

    engine.wipe().unwrap();

    assert!(!engine.is_initialized().unwrap());
    assert_eq!(engine.label().unwrap(), None);
    assert_eq!(engine.pin_fail_count().unwrap(), 0);
    assert_eq!(engine.u2f_offset(), 0);
    assert!(!engine.is_pin_cached());
    assert_ne!(engine.uuid(), &uuid);
    assert_eq!(engine.get_seed(false).unwrap(), None);
}

// ============================================
// Fatal path
// ============================================

#[test]
fn test_flash_failure_halts_engine() {
    let ui = TestUi::default();
    let mut engine = EngineBuilder::new()
        .ui(ui.clone())
        .open(MemoryFlash::new(FlashLayout::default()))
        .unwrap();

    engine.flash_mut().cut_power_after(3);
    engine.set_label("doomed");
    assert!(matches!(engine.commit(), Err(StorageError::Fatal(_))));
    assert!(ui.failed.get());
    assert!(engine.is_halted());

    assert!(matches!(engine.label(), Err(StorageError::Halted)));
    assert!(matches!(engine.next_u2f_counter(), Err(StorageError::Halted)));
    assert!(matches!(engine.commit(), Err(StorageError::Halted)));
}

#[test]
fn test_interrupted_commit_is_wiped_on_reload() {
    let mut engine = open(FlashLayout::default());
    engine.set_label("old");
    engine.commit().unwrap();
    let uuid = *engine.uuid();

    engine.flash_mut().cut_power_after(1);
    engine.set_label("new");
    assert!(engine.commit().is_err());

    let mut flash = engine.into_flash();
    flash.restore_power();
    let layout = *flash.layout();
    assert_ne!(flash.read_word(layout.storage_start()).unwrap(), STORAGE_MAGIC);

    let engine = EngineBuilder::new().open(flash).unwrap();
    assert_ne!(engine.uuid(), &uuid);
    assert_eq!(engine.label().unwrap(), None);
}

#[test]
fn test_commit_cut_before_magic_is_wiped_on_reload() {
    let mut engine = open(FlashLayout::default());
    engine.set_label("old");
    engine.set_pin("1234").unwrap();
    engine.commit().unwrap();
    let uuid = *engine.uuid();

    // erase, descriptor, uuid and record all land; the zero fill does not
    let layout = *engine.layout();
    let words = (layout.descriptor_len + 12 + RECORD_SIZE as u32) / 4;
    engine.flash_mut().cut_power_after(1 + u64::from(words));
    engine.set_label("new");
    assert!(engine.commit().is_err());

    let mut flash = engine.into_flash();
    flash.restore_power();
    assert_eq!(flash.read_word(layout.storage_start()).unwrap(), 0xffff_ffff);

    let engine = EngineBuilder::new().open(flash).unwrap();
    assert_ne!(engine.uuid(), &uuid);
    assert!(!engine.is_initialized().unwrap());
    assert!(!engine.has_pin().unwrap());
    assert_eq!(engine.label().unwrap(), None);
    assert_eq!(engine.get_flags().unwrap(), 0);
}

// ============================================
// Idempotent commits
// ============================================

#[test]
fn test_empty_commit_keeps_meta_sector() {
    let mut engine = open(FlashLayout::default());
    engine.set_mnemonic(PHRASE_12).unwrap();
    engine.set_pin("1234").unwrap();
    engine.set_label("same");
    engine.apply_flags(0x11).unwrap();
    engine.commit().unwrap();

    let before = meta_sector(&engine);
    engine.commit().unwrap();
    assert_eq!(meta_sector(&engine), before);

    let engine = reopen(engine);
    assert_eq!(meta_sector(&engine), before);
}

#[test]
fn test_stale_version_reload_only_bumps_version() {
    let mut engine = open(FlashLayout::default());
    engine.set_label("same");
    engine.set_u2f_counter(7);
    engine.commit().unwrap();
    let before = meta_sector(&engine);

    let layout = *engine.layout();
    let stale = STORAGE_VERSION & !1;
    {
        let mut session = FlashSession::begin(engine.flash_mut());
        session.write_word(layout.record_start(), stale).unwrap();
        session.finish().unwrap();
    }
    assert_ne!(meta_sector(&engine), before);

    let erases = engine.flash().erase_count();
    let engine = reopen(engine);
    assert_eq!(engine.flash().erase_count(), erases + 1);
    assert_eq!(meta_sector(&engine), before);
    assert_eq!(engine.label().unwrap().as_deref(), Some("same"));
}
