//! Record version history and in-place upgrades
//!
//! | version | firmware | added                         |
//! |---------|----------|-------------------------------|
//! | 1       | 1.0.0    |                               |
//! | 2       | 1.2.1    |                               |
//! | 3       | 1.3.1    | homescreen                    |
//! | 4       | 1.3.2    |                               |
//! | 5       | 1.3.3    |                               |
//! | 6       | 1.3.6    | u2f_counter, journal PIN word |
//! | 7       | 1.5.1    |                               |
//! | 8       | 1.5.2    | needs_backup, flags           |
//! | 9       | 1.6.1    | u2f_root                      |
//!
//! Fields newer than the persisted version are zero filled in place, which
//! the record codec reads as "absent".

use crate::record::{RecordField, RECORD_SIZE};

/// Version written by this engine
pub const STORAGE_VERSION: u32 = 0x0001_0001;

/// Work needed to bring a persisted record up to [`STORAGE_VERSION`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationPlan {
    /// Bytes at the start of the record that the persisted version wrote
    pub preserved_len: usize,
    /// Move the legacy record PIN counter into the failure journal
    ///
    /// Version 0 is what a wipe leaves behind; its journal is already fresh.
    pub convert_pin_counter: bool,
    /// Stage the persisted mnemonic so the next commit derives the U2F root
    pub recompute_u2f_root: bool,
    /// The persisted version is stale and a commit must follow
    pub needs_commit: bool,
}

impl MigrationPlan {
    /// Plan for a persisted version, `None` for a downgrade
    pub fn for_version(version: u32) -> Option<Self> {
        if version > STORAGE_VERSION {
            return None;
        }

        let preserved_len = match version {
            0 => 0,
            1..=2 => RecordField::Imported.end_offset(),
            3..=5 => RecordField::Homescreen.end_offset(),
            6..=7 => RecordField::U2fCounter.end_offset(),
            8 => RecordField::Flags.end_offset(),
            _ => RECORD_SIZE,
        };

        Some(Self {
            preserved_len,
            convert_pin_counter: (1..=5).contains(&version),
            recompute_u2f_root: version < 9,
            needs_commit: version != STORAGE_VERSION,
        })
    }

    /// Record byte range to zero fill
    pub fn zero_fill(&self) -> std::ops::Range<usize> {
        self.preserved_len..RECORD_SIZE
    }
}
