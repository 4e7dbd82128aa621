//! Address-space layout of the storage region
//!
//! Storage region layout with the default configuration:
//! ```text
//! OFFSET      SIZE        FIELD
//! ──────────────────────────────────────────────────────
//! 0x0000      0x100       bootloader descriptor (preserved)
//! 0x0100      4           magic: 'stor'
//! 0x0104      12          device uuid
//! 0x0110      RECORD_SIZE storage record
//! ...                     zero fill to end of meta sector
//!
//! 0x4000      4 KiB       PIN failure journal
//! 0x5000      256         U2F counter journal
//! 0x5100      ~11.75 KiB  reserved
//! ```
//!
//! The meta sector and the journal sector are separate erase units. The
//! failure journal is a sequence of words `0 ... 0 pinfail 0xffffffff ...`
//! where `pinfail` has the form `1...10...0` and its number of zeros is the
//! current failure count. The counter journal is a run of zero bits followed
//! by one bits, numbered from LSB to MSB in each little-endian word; the
//! number of zero bits is added to the record's base U2F counter.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::LayoutError;
use crate::record::RECORD_SIZE;

/// Magic word marking a valid storage header ("stor" little endian)
pub const STORAGE_MAGIC: u32 = 0x726f_7473;

/// Length of the random device uuid
pub const UUID_LEN: usize = 12;

/// Magic + uuid
pub const HEADER_LEN: u32 = 4 + UUID_LEN as u32;

/// Default erase unit size
pub const DEFAULT_SECTOR_SIZE: u32 = 0x4000;

/// Default length of the bootloader descriptor at the start of the meta sector
pub const DEFAULT_DESCRIPTOR_LEN: u32 = 0x100;

/// Default size of the PIN failure journal
pub const DEFAULT_PIN_AREA_LEN: u32 = 0x1000;

/// Default size of the U2F counter journal
pub const DEFAULT_U2F_AREA_LEN: u32 = 0x100;

const _: () = assert!(
    DEFAULT_DESCRIPTOR_LEN + HEADER_LEN + RECORD_SIZE as u32 <= DEFAULT_SECTOR_SIZE,
    "storage record does not fit in the meta sector"
);
const _: () = assert!(DEFAULT_PIN_AREA_LEN + DEFAULT_U2F_AREA_LEN <= DEFAULT_SECTOR_SIZE);

/// Flash layout configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlashLayout {
    /// Size of each of the two sectors
    pub sector_size: u32,
    /// Sector id holding descriptor, header and record
    pub meta_sector: u8,
    /// Sector id holding both journals
    pub journal_sector: u8,
    /// Bytes at the start of the meta sector that belong to the bootloader
    pub descriptor_len: u32,
    /// PIN failure journal size in bytes
    pub pin_area_len: u32,
    /// U2F counter journal size in bytes
    pub u2f_area_len: u32,
}

impl Default for FlashLayout {
    fn default() -> Self {
        Self {
            sector_size: DEFAULT_SECTOR_SIZE,
            meta_sector: 0,
            journal_sector: 1,
            descriptor_len: DEFAULT_DESCRIPTOR_LEN,
            pin_area_len: DEFAULT_PIN_AREA_LEN,
            u2f_area_len: DEFAULT_U2F_AREA_LEN,
        }
    }
}

impl FlashLayout {
    /// Layout with small journals, so recycling happens after a few hundred
    /// operations (useful for exercising the recycle path)
    pub fn compact() -> Self {
        Self {
            pin_area_len: 0x40,
            u2f_area_len: 0x20,
            ..Default::default()
        }
    }

    /// Override the PIN failure journal size
    pub fn with_pin_area_len(mut self, len: u32) -> Self {
        self.pin_area_len = len;
        self
    }

    /// Override the U2F counter journal size
    pub fn with_u2f_area_len(mut self, len: u32) -> Self {
        self.u2f_area_len = len;
        self
    }

    /// Check alignment and that every region fits where it must
    pub fn validate(&self) -> Result<(), LayoutError> {
        if self.meta_sector == self.journal_sector {
            return Err(LayoutError::SharedSector(self.meta_sector));
        }
        for (name, value) in [
            ("sector size", self.sector_size),
            ("descriptor length", self.descriptor_len),
            ("PIN area length", self.pin_area_len),
            ("U2F area length", self.u2f_area_len),
        ] {
            if value % 4 != 0 {
                return Err(LayoutError::Unaligned(name, value));
            }
        }
        if self.pin_area_len == 0 {
            return Err(LayoutError::Empty("PIN area"));
        }
        if self.u2f_area_len == 0 {
            return Err(LayoutError::Empty("U2F area"));
        }

        // Accessors below do unchecked arithmetic once these hold
        let region_len = self
            .sector_size
            .checked_mul(2)
            .ok_or(LayoutError::Overflow("region length"))?;
        let record_end = self
            .descriptor_len
            .checked_add(HEADER_LEN + RECORD_SIZE as u32)
            .ok_or(LayoutError::Overflow("record end"))?;
        let areas_end = self
            .sector_size
            .checked_add(self.pin_area_len)
            .and_then(|end| end.checked_add(self.u2f_area_len))
            .ok_or(LayoutError::Overflow("journal areas end"))?;

        if record_end > self.journal_start() {
            return Err(LayoutError::RecordTooLarge {
                record_end,
                journal_start: self.journal_start(),
            });
        }
        if areas_end > region_len {
            return Err(LayoutError::AreasTooLarge {
                areas_end,
                sector_end: region_len,
            });
        }

        Ok(())
    }

    /// Total size of the storage region (meta sector + journal sector)
    pub fn region_len(&self) -> u32 {
        2 * self.sector_size
    }

    /// Address range of the erase unit with the given id
    pub fn sector_range(&self, sector: u8) -> Option<Range<u32>> {
        if sector == self.meta_sector {
            Some(0..self.sector_size)
        } else if sector == self.journal_sector {
            Some(self.sector_size..self.region_len())
        } else {
            None
        }
    }

    /// Bootloader descriptor bytes, preserved across commits
    pub fn descriptor(&self) -> Range<u32> {
        0..self.descriptor_len
    }

    /// Address of the magic word
    pub fn storage_start(&self) -> u32 {
        self.descriptor_len
    }

    /// Address of the device uuid
    pub fn uuid_start(&self) -> u32 {
        self.storage_start() + 4
    }

    /// Address of the encoded record
    pub fn record_start(&self) -> u32 {
        self.storage_start() + HEADER_LEN
    }

    /// First address past the encoded record
    pub fn record_end(&self) -> u32 {
        self.record_start() + RECORD_SIZE as u32
    }

    /// Start of the journal sector; commits zero fill up to here
    pub fn journal_start(&self) -> u32 {
        self.sector_size
    }

    /// PIN failure journal
    pub fn pin_area(&self) -> Range<u32> {
        let start = self.journal_start();
        start..start + self.pin_area_len
    }

    /// U2F counter journal
    pub fn u2f_area(&self) -> Range<u32> {
        let start = self.pin_area().end;
        start..start + self.u2f_area_len
    }

    /// Number of counter increments the U2F journal holds before recycling
    pub fn u2f_capacity(&self) -> u32 {
        8 * self.u2f_area_len
    }
}
