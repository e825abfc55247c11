// In-memory NOR flash used by the simulator and the tests

use super::{check_range, Flash, FlashError, ERASED, SECTOR_SIZE, WRITE_ALIGN};
use super::big_flash::ChipSizeRegister;

/// RAM-backed flash with NOR semantics: erase sets bytes to 0xFF, programming can only clear bits.
#[derive(Debug, Clone)]
pub struct MemFlash {
    data: Vec<u8>,
    reported_size: u32,
    fail_erase: Option<i32>,
    fail_write: Option<i32>,
    fail_read: Option<i32>,
    erases: usize,
    writes: usize,
}

impl MemFlash {
    /// Blank (fully erased) device of `capacity` bytes
    pub fn new(capacity: u32) -> Self {
        Self::from_bytes(vec![ERASED; capacity as usize])
    }

    /// Wrap an existing dump, e.g. a flash image file
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let reported_size = data.len() as u32;
        Self {
            data,
            reported_size,
            fail_erase: None,
            fail_write: None,
            fail_read: None,
            erases: 0,
            writes: 0,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Raw mutable access for fault injection (bit rot, torn writes)
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Fail the next erase with a device error
    pub fn fail_next_erase(&mut self, code: i32) {
        self.fail_erase = Some(code);
    }

    pub fn fail_next_write(&mut self, code: i32) {
        self.fail_write = Some(code);
    }

    pub fn fail_next_read(&mut self, code: i32) {
        self.fail_read = Some(code);
    }

    pub fn erase_count(&self) -> usize {
        self.erases
    }

    pub fn write_count(&self) -> usize {
        self.writes
    }

    fn check_window(&self, addr: u32, len: usize) -> Result<(), FlashError> {
        let end = addr as u64 + len as u64;
        if end > self.reported_size as u64 {
            return Err(FlashError::SizeWindow { addr });
        }
        Ok(())
    }
}

impl Flash for MemFlash {
    fn capacity(&self) -> u32 {
        self.data.len() as u32
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        if let Some(code) = self.fail_read.take() {
            return Err(FlashError::Device { code });
        }
        check_range(self.capacity(), addr, buf.len())?;
        self.check_window(addr, buf.len())?;
        let start = addr as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        if addr % WRITE_ALIGN != 0 || data.len() % WRITE_ALIGN as usize != 0 {
            return Err(FlashError::Misaligned { addr, len: data.len() });
        }
        check_range(self.capacity(), addr, data.len())?;
        self.check_window(addr, data.len())?;
        if let Some(code) = self.fail_write.take() {
            return Err(FlashError::Device { code });
        }
        let start = addr as usize;
        for (cell, byte) in self.data[start..start + data.len()].iter_mut().zip(data) {
            *cell &= *byte;
        }
        self.writes += 1;
        Ok(())
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        let addr = sector.saturating_mul(SECTOR_SIZE);
        check_range(self.capacity(), addr, SECTOR_SIZE as usize)?;
        self.check_window(addr, SECTOR_SIZE as usize)?;
        if let Some(code) = self.fail_erase.take() {
            return Err(FlashError::Device { code });
        }
        let start = addr as usize;
        self.data[start..start + SECTOR_SIZE as usize].fill(ERASED);
        self.erases += 1;
        Ok(())
    }
}

/// The simulated controller exposes its reported chip size directly
impl ChipSizeRegister for MemFlash {
    fn chip_size(&self) -> u32 {
        self.reported_size
    }

    fn set_chip_size(&mut self, size: u32) {
        self.reported_size = size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_flash_is_erased() {
        let mut flash = MemFlash::new(SECTOR_SIZE);
        assert_eq!(flash.read_vec(0, 16).unwrap(), vec![0xFF; 16]);
    }

    #[test]
    fn test_write_only_clears_bits() {
        let mut flash = MemFlash::new(SECTOR_SIZE);
        flash.write(0, &[0xF0, 0x0F, 0xAA, 0x55]).unwrap();
        flash.write(0, &[0x3C, 0x3C, 0xFF, 0x00]).unwrap();
        assert_eq!(flash.read_vec(0, 4).unwrap(), vec![0x30, 0x0C, 0xAA, 0x00]);
    }

    #[test]
    fn test_write_alignment() {
        let mut flash = MemFlash::new(SECTOR_SIZE);
        assert!(matches!(flash.write(2, &[0; 4]), Err(FlashError::Misaligned { .. })));
        assert!(matches!(flash.write(0, &[0; 3]), Err(FlashError::Misaligned { .. })));
        // Reads have no alignment requirement
        let mut buf = [0u8; 3];
        assert!(flash.read(1, &mut buf).is_ok());
    }

    #[test]
    fn test_out_of_range() {
        let mut flash = MemFlash::new(SECTOR_SIZE);
        assert!(matches!(flash.read_vec(SECTOR_SIZE - 2, 4), Err(FlashError::OutOfRange { .. })));
        assert!(matches!(flash.erase_sector(1), Err(FlashError::OutOfRange { .. })));
    }

    #[test]
    fn test_reported_size_window() {
        let mut flash = MemFlash::new(4 * SECTOR_SIZE);
        flash.set_chip_size(2 * SECTOR_SIZE);
        assert_eq!(flash.erase_sector(3), Err(FlashError::SizeWindow { addr: 3 * SECTOR_SIZE }));
        assert!(flash.erase_sector(1).is_ok());
    }

    #[test]
    fn test_fault_injection_fires_once() {
        let mut flash = MemFlash::new(SECTOR_SIZE);
        flash.fail_next_erase(-2);
        assert_eq!(flash.erase_sector(0), Err(FlashError::Device { code: -2 }));
        assert!(flash.erase_sector(0).is_ok());
        assert_eq!(flash.erase_count(), 1);
    }
}
