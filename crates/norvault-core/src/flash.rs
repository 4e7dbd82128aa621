//! Flash primitives
//!
//! The engine only needs two write primitives: program a 32-bit word (which
//! can clear bits but never set them) and erase a whole sector (which resets
//! it to all ones). Writes must be bracketed by an unlock and a lock; the lock
//! reports the controller status accumulated since the unlock.

use tracing::trace;

use crate::error::FlashError;
use crate::layout::FlashLayout;

/// NOR flash covering the storage region
///
/// Addresses are byte offsets from the start of the storage region.
pub trait Flash {
    /// Read-only view of `len` bytes at `addr`
    fn read(&self, addr: u32, len: u32) -> Result<&[u8], FlashError>;

    /// Enable programming
    fn unlock(&mut self);

    /// Disable programming and report the accumulated status
    fn lock(&mut self) -> Result<(), FlashError>;

    /// Program one little-endian word (bitwise AND with the current content)
    fn write_word(&mut self, addr: u32, value: u32) -> Result<(), FlashError>;

    /// Reset a sector to all ones
    fn erase_sector(&mut self, sector: u8) -> Result<(), FlashError>;

    /// Read one little-endian word
    fn read_word(&self, addr: u32) -> Result<u32, FlashError> {
        let bytes = self.read(addr, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Scoped write access to the flash
///
/// Creating a session unlocks the flash. [`FlashSession::finish`] locks it
/// again and returns the controller status; dropping an unfinished session
/// still locks the flash.
pub struct FlashSession<'a, F: Flash + ?Sized> {
    flash: &'a mut F,
    open: bool,
}

impl<'a, F: Flash + ?Sized> FlashSession<'a, F> {
    /// Unlock the flash for programming
    pub fn begin(flash: &'a mut F) -> Self {
        flash.unlock();
        Self { flash, open: true }
    }

    pub fn read(&self, addr: u32, len: u32) -> Result<&[u8], FlashError> {
        self.flash.read(addr, len)
    }

    pub fn read_word(&self, addr: u32) -> Result<u32, FlashError> {
        self.flash.read_word(addr)
    }

    pub fn write_word(&mut self, addr: u32, value: u32) -> Result<(), FlashError> {
        self.flash.write_word(addr, value)
    }

    /// Program `bytes` word by word starting at `addr`; returns the next address
    ///
    /// `bytes.len()` must be a multiple of four.
    pub fn write_bytes(&mut self, mut addr: u32, bytes: &[u8]) -> Result<u32, FlashError> {
        if bytes.len() % 4 != 0 {
            return Err(FlashError::Alignment(addr + bytes.len() as u32));
        }
        for word in bytes.chunks_exact(4) {
            self.flash
                .write_word(addr, u32::from_le_bytes([word[0], word[1], word[2], word[3]]))?;
            addr += 4;
        }
        Ok(addr)
    }

    /// Program zero words over `range`
    pub fn zero_fill(&mut self, range: std::ops::Range<u32>) -> Result<(), FlashError> {
        let mut addr = range.start;
        while addr < range.end {
            self.flash.write_word(addr, 0)?;
            addr += 4;
        }
        Ok(())
    }

    pub fn erase_sector(&mut self, sector: u8) -> Result<(), FlashError> {
        trace!(sector, "erasing sector");
        self.flash.erase_sector(sector)
    }

    /// Lock the flash and return the controller status
    pub fn finish(mut self) -> Result<(), FlashError> {
        self.open = false;
        self.flash.lock()
    }
}

impl<F: Flash + ?Sized> Drop for FlashSession<'_, F> {
    fn drop(&mut self) {
        if self.open {
            let _ = self.flash.lock();
        }
    }
}

/// In-memory NOR flash with the storage region's two sectors
///
/// Enforces the NOR write model: programming ANDs the new value into the
/// cell and reports an error when that would need a 0 → 1 transition.
/// A power cut can be scheduled after a number of operations to simulate
/// interrupted writes.
#[derive(Debug, Clone)]
pub struct MemoryFlash {
    layout: FlashLayout,
    bytes: Vec<u8>,
    unlocked: bool,
    status: Option<FlashError>,
    writes: u64,
    erases: u64,
    power_budget: Option<u64>,
}

impl MemoryFlash {
    /// Fully erased flash for the given layout
    pub fn new(layout: FlashLayout) -> Self {
        Self {
            layout,
            bytes: vec![0xff; layout.region_len() as usize],
            unlocked: false,
            status: None,
            writes: 0,
            erases: 0,
            power_budget: None,
        }
    }

    /// Flash initialised from a raw image of the storage region
    pub fn from_image(layout: FlashLayout, image: Vec<u8>) -> Result<Self, FlashError> {
        if image.len() != layout.region_len() as usize {
            return Err(FlashError::Io(format!(
                "image is {} bytes, layout needs {}",
                image.len(),
                layout.region_len()
            )));
        }
        Ok(Self {
            bytes: image,
            ..Self::new(layout)
        })
    }

    /// Raw contents of the storage region
    pub fn image(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_image(self) -> Vec<u8> {
        self.bytes
    }

    pub fn layout(&self) -> &FlashLayout {
        &self.layout
    }

    /// Number of successful word programs
    pub fn write_count(&self) -> u64 {
        self.writes
    }

    /// Number of successful sector erases
    pub fn erase_count(&self) -> u64 {
        self.erases
    }

    /// Let `operations` more writes or erases succeed, then lose power
    pub fn cut_power_after(&mut self, operations: u64) {
        self.power_budget = Some(operations);
    }

    /// Power up again; pending status is discarded
    pub fn restore_power(&mut self) {
        self.power_budget = None;
        self.status = None;
        self.unlocked = false;
    }

    fn check_range(&self, addr: u32, len: u32) -> Result<(), FlashError> {
        match addr.checked_add(len) {
            Some(end) if end as usize <= self.bytes.len() => Ok(()),
            _ => Err(FlashError::OutOfRange { addr, len }),
        }
    }

    fn fail(&mut self, error: FlashError) -> Result<(), FlashError> {
        if self.status.is_none() {
            self.status = Some(error.clone());
        }
        Err(error)
    }

    fn consume_power(&mut self) -> Result<(), FlashError> {
        match self.power_budget {
            Some(0) => self.fail(FlashError::PowerLoss),
            Some(remaining) => {
                self.power_budget = Some(remaining - 1);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Flash for MemoryFlash {
    fn read(&self, addr: u32, len: u32) -> Result<&[u8], FlashError> {
        self.check_range(addr, len)?;
        Ok(&self.bytes[addr as usize..(addr + len) as usize])
    }

    fn unlock(&mut self) {
        self.unlocked = true;
    }

    fn lock(&mut self) -> Result<(), FlashError> {
        self.unlocked = false;
        match self.status.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn write_word(&mut self, addr: u32, value: u32) -> Result<(), FlashError> {
        if !self.unlocked {
            return self.fail(FlashError::Sequence);
        }
        if addr % 4 != 0 {
            return self.fail(FlashError::Alignment(addr));
        }
        if let Err(error) = self.check_range(addr, 4) {
            return self.fail(error);
        }
        self.consume_power()?;

        let at = addr as usize;
        let current = u32::from_le_bytes([
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ]);
        let programmed = current & value;
        self.bytes[at..at + 4].copy_from_slice(&programmed.to_le_bytes());
        if programmed != value {
            return self.fail(FlashError::Program(addr));
        }
        self.writes += 1;
        Ok(())
    }

    fn erase_sector(&mut self, sector: u8) -> Result<(), FlashError> {
        if !self.unlocked {
            return self.fail(FlashError::Sequence);
        }
        let range = match self.layout.sector_range(sector) {
            Some(range) => range,
            None => return self.fail(FlashError::NoSuchSector(sector)),
        };
        self.consume_power()?;
        self.bytes[range.start as usize..range.end as usize].fill(0xff);
        self.erases += 1;
        Ok(())
    }
}
