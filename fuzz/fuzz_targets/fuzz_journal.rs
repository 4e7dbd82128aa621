#![no_main]

use libfuzzer_sys::fuzz_target;
use norvault_core::journal::{active_pin_word, failure_count, u2f_offset, MAX_PIN_FAILURES};

fuzz_target!(|data: &[u8]| {
    let area = &data[..data.len() & !3];
    let words = area.len() / 4;

    let offset = u2f_offset(area);
    assert!(offset as usize <= 32 * words);

    if words > 0 {
        let index = active_pin_word(area);
        assert!(index < words);

        let at = 4 * index;
        let word = u32::from_le_bytes([area[at], area[at + 1], area[at + 2], area[at + 3]]);
        assert!(failure_count(word) <= MAX_PIN_FAILURES);
    }
});
