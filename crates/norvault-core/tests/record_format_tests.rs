//! Integration tests for the on-flash format and version migration

use norvault_core::{
    journal::failure_count, record::mnemonic_field, EngineBuilder, Flash, FlashLayout, HdNode,
    MemoryFlash, RecordView, StorageEngine, StorageRecord, RECORD_SIZE, STORAGE_MAGIC,
    STORAGE_VERSION, UUID_LEN,
};

const PHRASE: &str =
    "legal winner thank year wave sausage worth useful legal winner thank yellow";

/// Flash holding a valid header followed by `record` as written by an
/// older firmware
fn image_with_record(record: &StorageRecord) -> (MemoryFlash, [u8; UUID_LEN]) {
    let layout = FlashLayout::default();
    let engine = EngineBuilder::new().open(MemoryFlash::new(layout)).unwrap();
    let uuid = *engine.uuid();

    let mut image = engine.into_flash().into_image();
    let start = layout.record_start() as usize;
    image[start..start + RECORD_SIZE].copy_from_slice(&record.encode());
    (MemoryFlash::from_image(layout, image).unwrap(), uuid)
}

fn persisted(engine: &StorageEngine<MemoryFlash>) -> StorageRecord {
    let layout = engine.layout();
    let bytes = engine
        .flash()
        .read(layout.record_start(), RECORD_SIZE as u32)
        .unwrap();
    StorageRecord::decode(bytes).unwrap()
}

#[test]
fn test_header_layout() {
    let engine = EngineBuilder::new()
        .open(MemoryFlash::new(FlashLayout::default()))
        .unwrap();
    let flash = engine.flash();

    assert_eq!(flash.read_word(0x100).unwrap(), STORAGE_MAGIC);
    assert_eq!(flash.read(0x104, UUID_LEN as u32).unwrap(), engine.uuid());
    // wiped record: version written, every field absent
    let view = RecordView::new(flash.read(0x110, RECORD_SIZE as u32).unwrap()).unwrap();
    assert_eq!(view.version(), 0);
    assert!(!view.has_node());
    assert!(!view.has_mnemonic());
}

#[test]
fn test_committed_record_version() {
    let mut engine = EngineBuilder::new()
        .open(MemoryFlash::new(FlashLayout::default()))
        .unwrap();
    engine.set_label("v");
    engine.commit().unwrap();
    assert_eq!(persisted(&engine).version, STORAGE_VERSION);
}

#[test]
fn test_migrate_from_version_5() {
    let record = StorageRecord {
        version: 5,
        mnemonic: Some(mnemonic_field(PHRASE)),
        pin_failed_attempts: Some(3),
        pin: Some(b"1234".to_vec()),
        label: Some("legacy".into()),
        homescreen: Some(vec![0xa5; 1024]),
        // fields a version 5 firmware never wrote
        u2f_counter: Some(77),
        flags: Some(0xff),
        ..Default::default()
    };
    let (flash, uuid) = image_with_record(&record);

    let mut engine = EngineBuilder::new().open(flash).unwrap();
    assert_eq!(engine.uuid(), &uuid);
    assert!(engine.is_initialized().unwrap());
    assert_eq!(engine.label().unwrap().as_deref(), Some("legacy"));
    assert!(engine.contains_pin("1234").unwrap());
    assert_eq!(engine.homescreen().unwrap(), Some(vec![0xa5; 1024]));

    // newer fields were cleared
    assert_eq!(engine.u2f_counter().unwrap(), 0);
    assert_eq!(engine.get_flags().unwrap(), 0);

    // legacy counter moved into the journal
    assert_eq!(engine.pin_fail_count().unwrap(), 3);
    let first_word = engine.flash().read_word(engine.layout().pin_area().start).unwrap();
    assert_eq!(failure_count(first_word), 3);

    let migrated = persisted(&engine);
    assert_eq!(migrated.version, STORAGE_VERSION);
    assert_eq!(migrated.pin_failed_attempts, None);
    assert!(migrated.u2f_root.is_some());

    assert!(engine.contains_mnemonic(PHRASE).unwrap());
}

#[test]
fn test_migrate_from_version_8_keeps_flags() {
    let record = StorageRecord {
        version: 8,
        mnemonic: Some(mnemonic_field(PHRASE)),
        u2f_counter: Some(500),
        needs_backup: Some(true),
        flags: Some(0b1010),
        ..Default::default()
    };
    let (flash, _) = image_with_record(&record);

    let engine = EngineBuilder::new().open(flash).unwrap();
    assert_eq!(engine.get_flags().unwrap(), 0b1010);
    assert_eq!(engine.u2f_counter().unwrap(), 500);
    assert!(engine.needs_backup().unwrap());
    assert!(engine.get_u2f_root().unwrap().is_some());
    assert_eq!(persisted(&engine).version, STORAGE_VERSION);
}

#[test]
fn test_migrate_from_version_9_keeps_stored_root() {
    let root = HdNode {
        depth: 1,
        child_num: norvault_core::U2F_KEY_PATH,
        chain_code: [6u8; 32],
        private_key: Some([7u8; 32]),
        ..Default::default()
    };
    let record = StorageRecord {
        version: 9,
        mnemonic: Some(mnemonic_field(PHRASE)),
        u2f_root: Some(root.clone()),
        ..Default::default()
    };
    let (flash, _) = image_with_record(&record);

    let engine = EngineBuilder::new().open(flash).unwrap();
    assert_eq!(engine.get_u2f_root().unwrap(), Some(root));
}

#[test]
fn test_migrate_from_version_6_keeps_journal() {
    let record = StorageRecord {
        version: 6,
        pin_failed_attempts: Some(9),
        u2f_counter: Some(10),
        ..Default::default()
    };
    let (mut flash, _) = image_with_record(&record);
    let layout = *flash.layout();
    {
        let mut session = norvault_core::FlashSession::begin(&mut flash);
        session.write_word(layout.pin_area().start, 0xffff_fffc).unwrap();
        session.write_word(layout.u2f_area().start, 0xffff_fff0).unwrap();
        session.finish().unwrap();
    }

    let engine = EngineBuilder::new().open(flash).unwrap();
    assert_eq!(engine.pin_fail_count().unwrap(), 2);
    assert_eq!(engine.u2f_offset(), 4);
    assert_eq!(engine.u2f_counter().unwrap(), 14);
}

#[test]
fn test_newer_version_is_wiped() {
    let record = StorageRecord {
        version: STORAGE_VERSION + 1,
        mnemonic: Some(mnemonic_field(PHRASE)),
        label: Some("future".into()),
        ..Default::default()
    };
    let (flash, uuid) = image_with_record(&record);

    let mut engine = EngineBuilder::new().build(flash).unwrap();
    assert!(!engine.load().unwrap());

    let engine = EngineBuilder::new().open(engine.into_flash()).unwrap();
    assert_ne!(engine.uuid(), &uuid);
    assert!(!engine.is_initialized().unwrap());
    assert_eq!(engine.label().unwrap(), None);
}

#[test]
fn test_bad_magic_is_absent() {
    let layout = FlashLayout::default();
    let mut engine = EngineBuilder::new().build(MemoryFlash::new(layout)).unwrap();
    assert!(!engine.load().unwrap());
}

#[test]
fn test_current_version_reload_is_read_only() {
    let mut engine = EngineBuilder::new()
        .open(MemoryFlash::new(FlashLayout::default()))
        .unwrap();
    engine.set_label("stable");
    engine.commit().unwrap();

    let flash = engine.into_flash();
    let writes = flash.write_count();
    let erases = flash.erase_count();

    let engine = EngineBuilder::new().open(flash).unwrap();
    assert_eq!(engine.flash().write_count(), writes);
    assert_eq!(engine.flash().erase_count(), erases);
}

#[test]
fn test_decode_rejects_short_buffer() {
    assert!(StorageRecord::decode(&[0u8; RECORD_SIZE - 4]).is_err());
}
