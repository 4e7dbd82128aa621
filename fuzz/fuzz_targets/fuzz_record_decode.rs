#![no_main]

use libfuzzer_sys::fuzz_target;
use norvault_core::{StorageRecord, RECORD_SIZE};

fuzz_target!(|data: &[u8]| {
    // Try to parse - should not panic
    if let Ok(record) = StorageRecord::decode(data) {
        // Re-encoding a decoded record must decode to the same fields
        let encoded = record.encode();
        assert_eq!(encoded.len(), RECORD_SIZE);

        let again = StorageRecord::decode(&encoded).unwrap();
        assert_eq!(record.node, again.node);
        assert_eq!(record.u2f_counter, again.u2f_counter);
        assert_eq!(record.flags, again.flags);
        assert_eq!(record.imported, again.imported);
    }
});
