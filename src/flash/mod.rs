//! Raw NOR flash access.
//!
//! Everything above this module talks to the chip through the [`Flash`] trait. Erase works on
//! whole sectors, writes must be word aligned, reads can land anywhere. Errors are returned
//! verbatim and never retried here: a retried erase can leave a sector half programmed.

pub mod big_flash;
pub mod sim;

pub use big_flash::{BigFlash, ChipSizeRegister};
pub use sim::MemFlash;

/// Erase granularity of the chip
pub const SECTOR_SIZE: u32 = 0x1000;

/// Write granularity (address and length)
pub const WRITE_ALIGN: u32 = 4;

/// Value of an erased byte
pub const ERASED: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Access runs past the end of the device
    OutOfRange { addr: u32, len: usize },
    /// Write or erase not on the required boundary
    Misaligned { addr: u32, len: usize },
    /// Address lies beyond the chip size currently reported to the controller
    SizeWindow { addr: u32 },
    /// Error code reported by the device itself
    Device { code: i32 },
}

impl std::fmt::Display for FlashError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlashError::OutOfRange { addr, len } => {
                write!(f, "flash access out of range: 0x{:06x}+{}", addr, len)
            }
            FlashError::Misaligned { addr, len } => {
                write!(f, "misaligned flash access: 0x{:06x}+{}", addr, len)
            }
            FlashError::SizeWindow { addr } => {
                write!(f, "address 0x{:06x} beyond reported chip size", addr)
            }
            FlashError::Device { code } => write!(f, "flash device error {}", code),
        }
    }
}

impl std::error::Error for FlashError {}

pub trait Flash {
    /// Total addressable bytes
    fn capacity(&self) -> u32;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    /// Program `data` at `addr`. Both must be [`WRITE_ALIGN`] aligned and the target erased.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erase the sector with index `sector` (address `sector * SECTOR_SIZE`)
    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError>;

    fn read_vec(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, FlashError> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    /// Erase every sector of a sector-aligned range
    fn erase_range(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        if !is_sector_aligned(addr) || !is_sector_aligned(len) {
            return Err(FlashError::Misaligned { addr, len: len as usize });
        }
        let first = addr / SECTOR_SIZE;
        for sector in first..first + len / SECTOR_SIZE {
            self.erase_sector(sector)?;
        }
        Ok(())
    }
}

impl<T: Flash + ?Sized> Flash for &mut T {
    fn capacity(&self) -> u32 {
        (**self).capacity()
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        (**self).read(addr, buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).write(addr, data)
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        (**self).erase_sector(sector)
    }
}

pub fn is_sector_aligned(value: u32) -> bool {
    value % SECTOR_SIZE == 0
}

pub fn sector_of(addr: u32) -> u32 {
    addr / SECTOR_SIZE
}

/// Round `len` up to the write granularity
pub fn align_up(len: usize) -> usize {
    let align = WRITE_ALIGN as usize;
    (len + align - 1) / align * align
}

/// Check an access against the device bounds
pub(crate) fn check_range(capacity: u32, addr: u32, len: usize) -> Result<(), FlashError> {
    let end = addr as u64 + len as u64;
    if end > capacity as u64 {
        return Err(FlashError::OutOfRange { addr, len });
    }
    Ok(())
}

/// Erase a whole sector and rewrite it with `data`, padded with erased bytes to the write
/// granularity. Used for every single-sector record (boot config, config, reboot reason).
pub fn rewrite_sector<F: Flash + ?Sized>(
    flash: &mut F,
    addr: u32,
    data: &[u8],
) -> Result<(), FlashError> {
    if !is_sector_aligned(addr) || data.len() > SECTOR_SIZE as usize {
        return Err(FlashError::Misaligned { addr, len: data.len() });
    }
    let mut padded = data.to_vec();
    padded.resize(align_up(data.len()), ERASED);
    flash.erase_sector(sector_of(addr))?;
    flash.write(addr, &padded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 4);
        assert_eq!(align_up(4), 4);
        assert_eq!(align_up(25), 28);
    }

    #[test]
    fn test_erase_range_rejects_unaligned() {
        let mut flash = MemFlash::new(4 * SECTOR_SIZE);
        assert_eq!(
            flash.erase_range(0x800, SECTOR_SIZE),
            Err(FlashError::Misaligned { addr: 0x800, len: SECTOR_SIZE as usize })
        );
    }

    #[test]
    fn test_erase_range_erases_each_sector() {
        let mut flash = MemFlash::new(4 * SECTOR_SIZE);
        flash.write(0, &[0u8; 4]).unwrap();
        flash.write(SECTOR_SIZE, &[0u8; 4]).unwrap();
        flash.erase_range(0, 2 * SECTOR_SIZE).unwrap();
        assert_eq!(flash.read_vec(0, 4).unwrap(), vec![ERASED; 4]);
        assert_eq!(flash.read_vec(SECTOR_SIZE, 4).unwrap(), vec![ERASED; 4]);
        assert_eq!(flash.erase_count(), 2);
    }

    #[test]
    fn test_rewrite_sector_pads_to_word() {
        let mut flash = MemFlash::new(2 * SECTOR_SIZE);
        rewrite_sector(&mut flash, SECTOR_SIZE, &[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(flash.read_vec(SECTOR_SIZE, 8).unwrap(), vec![1, 2, 3, 4, 5, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_error_display() {
        let err = FlashError::Device { code: 3 };
        assert_eq!(err.to_string(), "flash device error 3");
    }
}
