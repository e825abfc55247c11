// Chip-size shim for flash parts larger than the controller's native addressing window.
//
// The boot ROM programs the controller with the chip size taken from the image header, which
// caps addressing at that size. For each primitive we swap in the real size and put the old
// value back afterwards, error or not.

use super::{Flash, FlashError};
use log::trace;
use std::ops::{Deref, DerefMut};

/// Controller register holding the chip size used for address checks
pub trait ChipSizeRegister {
    fn chip_size(&self) -> u32;
    fn set_chip_size(&mut self, size: u32);
}

/// Wraps a device and widens the reported chip size around every erase/read/write.
///
/// All primitives take `&mut self`, so a second operation cannot start while a substitution
/// is live.
pub struct BigFlash<F: Flash + ChipSizeRegister> {
    inner: F,
    real_size: u32,
}

/// Restores the saved chip size when dropped
struct SizeGuard<'a, F: ChipSizeRegister> {
    dev: &'a mut F,
    saved: u32,
}

impl<'a, F: ChipSizeRegister> SizeGuard<'a, F> {
    fn enter(dev: &'a mut F, size: u32) -> Self {
        let saved = dev.chip_size();
        dev.set_chip_size(size);
        trace!("chip size 0x{:x} -> 0x{:x}", saved, size);
        Self { dev, saved }
    }
}

impl<F: ChipSizeRegister> Deref for SizeGuard<'_, F> {
    type Target = F;

    fn deref(&self) -> &F {
        self.dev
    }
}

impl<F: ChipSizeRegister> DerefMut for SizeGuard<'_, F> {
    fn deref_mut(&mut self) -> &mut F {
        self.dev
    }
}

impl<F: ChipSizeRegister> Drop for SizeGuard<'_, F> {
    fn drop(&mut self) {
        self.dev.set_chip_size(self.saved);
    }
}

impl<F: Flash + ChipSizeRegister> BigFlash<F> {
    /// Use the device's full capacity as the substituted size
    pub fn new(inner: F) -> Self {
        let real_size = inner.capacity();
        Self { inner, real_size }
    }

    pub fn with_size(inner: F, real_size: u32) -> Self {
        Self { inner, real_size }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    fn guard(&mut self) -> SizeGuard<'_, F> {
        SizeGuard::enter(&mut self.inner, self.real_size)
    }
}

impl<F: Flash + ChipSizeRegister> Flash for BigFlash<F> {
    fn capacity(&self) -> u32 {
        self.real_size.min(self.inner.capacity())
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.guard().read(addr, buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        self.guard().write(addr, data)
    }

    fn erase_sector(&mut self, sector: u32) -> Result<(), FlashError> {
        self.guard().erase_sector(sector)
    }
}
