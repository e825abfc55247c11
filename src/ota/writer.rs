//! Streams an image into a slot as it arrives.
//!
//! Writes must be 4-byte aligned, so up to three trailing bytes of each chunk are carried over
//! to the next one. Sectors are erased just ahead of the data that lands in them.

use super::OtaError;
use crate::flash::{sector_of, Flash, ERASED, WRITE_ALIGN};
use crate::layout::Region;
use log::debug;

#[derive(Debug)]
pub struct SlotWriter {
    region: Region,
    next_addr: u32,
    last_sector_erased: u32,
    carry: [u8; WRITE_ALIGN as usize],
    carry_len: usize,
    total: u32,
}

impl SlotWriter {
    pub fn new(region: Region) -> Self {
        Self {
            region,
            next_addr: region.base,
            // nothing erased yet
            last_sector_erased: region.first_sector().wrapping_sub(1),
            carry: [ERASED; WRITE_ALIGN as usize],
            carry_len: 0,
            total: 0,
        }
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Bytes accepted so far, including any still carried
    pub fn total(&self) -> u32 {
        self.total
    }

    fn erase_through<F: Flash + ?Sized>(&mut self, flash: &mut F, last_addr: u32) -> Result<(), OtaError> {
        let target = sector_of(last_addr);
        while self.last_sector_erased.wrapping_add(1) <= target {
            let sector = self.last_sector_erased.wrapping_add(1);
            debug!("OTA erasing sector 0x{:03x}", sector);
            flash.erase_sector(sector)?;
            self.last_sector_erased = sector;
        }
        Ok(())
    }

    fn program<F: Flash + ?Sized>(&mut self, flash: &mut F, data: &[u8]) -> Result<(), OtaError> {
        if data.is_empty() {
            return Ok(());
        }
        let end = self.next_addr + data.len() as u32;
        if end > self.region.end() {
            return Err(OtaError::TooLarge);
        }
        self.erase_through(flash, end - 1)?;
        flash.write(self.next_addr, data)?;
        self.next_addr = end;
        Ok(())
    }

    pub fn write<F: Flash + ?Sized>(&mut self, flash: &mut F, data: &[u8]) -> Result<(), OtaError> {
        if self.total as u64 + data.len() as u64 > self.region.len as u64 {
            return Err(OtaError::TooLarge);
        }
        self.total += data.len() as u32;

        let mut buf = Vec::with_capacity(self.carry_len + data.len());
        buf.extend_from_slice(&self.carry[..self.carry_len]);
        buf.extend_from_slice(data);

        let aligned = buf.len() - buf.len() % WRITE_ALIGN as usize;
        self.program(flash, &buf[..aligned])?;

        self.carry_len = buf.len() - aligned;
        self.carry[..self.carry_len].copy_from_slice(&buf[aligned..]);
        Ok(())
    }

    /// Flush carried bytes padded with erased filler
    pub fn finish<F: Flash + ?Sized>(&mut self, flash: &mut F) -> Result<(), OtaError> {
        if self.carry_len == 0 {
            return Ok(());
        }
        let mut word = [ERASED; WRITE_ALIGN as usize];
        word[..self.carry_len].copy_from_slice(&self.carry[..self.carry_len]);
        self.carry_len = 0;
        self.program(flash, &word)
    }
}
