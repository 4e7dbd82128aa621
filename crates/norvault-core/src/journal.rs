//! Bit-clearing journals
//!
//! Pure arithmetic over the two journal areas. Nothing here touches flash;
//! the engine reads the area, asks these helpers what to write, and programs
//! the result.

/// Largest failure count a single word can hold
pub const MAX_PIN_FAILURES: u32 = 31;

/// Fresh failure word (no failures)
pub const PIN_WORD_ERASED: u32 = 0xffff_ffff;

fn words(area: &[u8]) -> impl Iterator<Item = u32> + '_ {
    area.chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
}

/// Index of the active failure word: the first word that is not retired
///
/// When every word is retired the last one is reported, so the caller's
/// next reset lands on the recycle path.
pub fn active_pin_word(area: &[u8]) -> usize {
    let count = area.len() / 4;
    words(area)
        .position(|word| word != 0)
        .unwrap_or(count.saturating_sub(1))
}

/// Failures recorded in a failure word
pub fn failure_count(word: u32) -> u32 {
    word.trailing_zeros().min(MAX_PIN_FAILURES)
}

/// Word after one more failure, or `None` once the word is saturated
pub fn next_failure_word(word: u32) -> Option<u32> {
    let next = word << 1;
    (next != 0).then_some(next)
}

/// Lockout delay in seconds encoded by a failure word (`2^n - 1`)
pub fn wait_time(word: u32) -> u32 {
    !word
}

/// Failure word carrying `failures` failures
pub fn failure_word(failures: u32) -> u32 {
    PIN_WORD_ERASED << failures.min(MAX_PIN_FAILURES)
}

/// Number of cleared bits at the start of the counter area
///
/// Zero words count 32 each; the first word with a set bit adds its
/// trailing zeros. Never exceeds the area's bit capacity.
pub fn u2f_offset(area: &[u8]) -> u32 {
    let mut offset = 0u32;
    for word in words(area) {
        if word != 0 {
            offset += word.trailing_zeros();
            break;
        }
        offset += 32;
    }
    offset
}

/// Word index and value that clear bit `offset` of the counter area
pub fn u2f_mark(offset: u32) -> (u32, u32) {
    (offset / 32, 0xffff_fffe << (offset & 31))
}
