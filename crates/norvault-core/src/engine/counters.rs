//! PIN failure journal and U2F counter

use tracing::{debug, warn};

use super::StorageEngine;
use crate::error::{FlashError, Result};
use crate::flash::Flash;
use crate::journal::{self, PIN_WORD_ERASED};

impl<F: Flash> StorageEngine<F> {
    /// Address of the active PIN failure word
    pub fn pin_fail_address(&self) -> Result<u32> {
        self.guard()?;
        let area = self.layout.pin_area();
        let words = self.flash.read(area.start, area.end - area.start)?;
        Ok(area.start + 4 * journal::active_pin_word(words) as u32)
    }

    /// Consecutive failures recorded in the active word
    pub fn pin_fail_count(&self) -> Result<u32> {
        let addr = self.pin_fail_address()?;
        Ok(journal::failure_count(self.flash.read_word(addr)?))
    }

    /// Lockout delay in seconds for the word at `addr`
    pub fn pin_wait_time(&self, addr: u32) -> Result<u32> {
        self.guard()?;
        if !self.gate.uses_pin_journal() {
            return Ok(0);
        }
        self.check_pin_word(addr)?;
        Ok(journal::wait_time(self.flash.read_word(addr)?))
    }

    /// Record one failed PIN attempt in the word at `addr`
    ///
    /// Returns whether the flash holds the new value. A saturated word is
    /// left alone and reported as success.
    pub fn record_pin_failure(&mut self, addr: u32) -> Result<bool> {
        self.guard()?;
        if !self.gate.uses_pin_journal() {
            return Ok(true);
        }
        self.check_pin_word(addr)?;

        let word = self.flash.read_word(addr)?;
        let Some(next) = journal::next_failure_word(word) else {
            debug!(addr, "failure word saturated");
            return Ok(true);
        };
        self.with_flash(|session| session.write_word(addr, next))?;

        let written = self.flash.read_word(addr)?;
        if written != next {
            warn!(addr, expected = next, written, "failure word readback mismatch");
        }
        Ok(written == next)
    }

    /// Retire the word at `addr` after a correct PIN
    ///
    /// Retiring the last word of the area recycles the journal sector.
    pub fn reset_pin_failures(&mut self, addr: u32) -> Result<()> {
        self.guard()?;
        if !self.gate.uses_pin_journal() {
            return Ok(());
        }
        self.check_pin_word(addr)?;

        if addr + 4 >= self.layout.pin_area().end {
            return self.recycle(PIN_WORD_ERASED);
        }
        self.with_flash(|session| session.write_word(addr, 0))
    }

    /// Attempts left, for gates that count them
    pub fn pin_remaining_attempts(&mut self) -> Result<Option<u32>> {
        self.guard()?;
        Ok(self.gate.remaining_pin_attempts())
    }

    fn check_pin_word(&self, addr: u32) -> Result<()> {
        let area = self.layout.pin_area();
        if addr % 4 != 0 || !area.contains(&addr) {
            return Err(FlashError::OutOfRange { addr, len: 4 }.into());
        }
        Ok(())
    }

    /// Increments recorded in the U2F journal since the last recycle
    pub fn u2f_offset(&self) -> u32 {
        self.u2f_offset
    }

    pub(super) fn scan_u2f_offset(&self) -> Result<u32> {
        let area = self.layout.u2f_area();
        let words = self.flash.read(area.start, area.end - area.start)?;
        Ok(journal::u2f_offset(words).min(self.layout.u2f_capacity()))
    }

    /// Current U2F counter: persisted base plus journal offset
    pub fn u2f_counter(&self) -> Result<u32> {
        self.guard()?;
        let base = self.view()?.u2f_counter().unwrap_or(0);
        Ok(base.wrapping_add(self.u2f_offset))
    }

    /// Advance the U2F counter by one and return the new value
    ///
    /// Clears one bit of the journal; a full journal is folded into the
    /// record base by a recycle.
    pub fn next_u2f_counter(&mut self) -> Result<u32> {
        self.guard()?;
        let capacity = self.layout.u2f_capacity();
        if self.u2f_offset >= capacity {
            let word = self.current_pin_word()?;
            self.recycle(word)?;
        }

        let (index, value) = journal::u2f_mark(self.u2f_offset);
        let addr = self.layout.u2f_area().start + 4 * index;
        self.with_flash(|session| session.write_word(addr, value))?;
        self.u2f_offset += 1;

        if self.u2f_offset >= capacity {
            let word = self.current_pin_word()?;
            self.recycle(word)?;
        }
        self.u2f_counter()
    }

    /// Stage a new counter value; the journal offset is subtracted so the
    /// reported counter equals `value` after commit
    pub fn set_u2f_counter(&mut self, value: u32) {
        self.pending.u2f_counter = Some(value.wrapping_sub(self.u2f_offset));
    }

    /// Active failure word, carried over when the sector is recycled
    fn current_pin_word(&self) -> Result<u32> {
        let addr = self.pin_fail_address()?;
        Ok(self.flash.read_word(addr)?)
    }
}
