/// Reset handling with a persisted reboot reason
/// The reason survives the reset so the next boot can report why it happened

use crate::boot::platform::BootPlatform;
use crate::flash::{rewrite_sector, Flash, FlashError};
use crate::layout::{FlashLayout, LayoutError, Region};
use log::{info, warn};

/// Stored reasons are NUL-terminated within this many bytes
pub const REASON_MAX: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetError {
    Flash(FlashError),
    Layout(LayoutError),
}

impl std::fmt::Display for ResetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResetError::Flash(e) => write!(f, "flash error: {}", e),
            ResetError::Layout(e) => write!(f, "layout error: {}", e),
        }
    }
}

impl std::error::Error for ResetError {}

impl From<FlashError> for ResetError {
    fn from(e: FlashError) -> Self {
        ResetError::Flash(e)
    }
}

impl From<LayoutError> for ResetError {
    fn from(e: LayoutError) -> Self {
        ResetError::Layout(e)
    }
}

pub struct RebootReason {
    region: Region,
}

impl RebootReason {
    pub fn new(layout: &FlashLayout) -> Result<Self, ResetError> {
        Ok(Self { region: layout.reboot_reason()? })
    }

    pub fn read_reason<F: Flash + ?Sized>(&self, flash: &mut F) -> Result<Option<String>, ResetError> {
        let raw = flash.read_vec(self.region.base, REASON_MAX)?;
        let Some(end) = raw.iter().position(|&b| b == 0) else {
            // erased or never terminated
            return Ok(None);
        };
        Ok(std::str::from_utf8(&raw[..end]).ok().map(str::to_string))
    }

    /// Store `reason`, truncated to fit. Returns false when it matched what was already stored,
    /// in which case flash is left alone.
    pub fn store_reason<F: Flash + ?Sized>(&self, flash: &mut F, reason: &str) -> Result<bool, ResetError> {
        let mut end = reason.len().min(REASON_MAX - 1);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        let reason = &reason[..end];

        if self.read_reason(flash)?.as_deref() == Some(reason) {
            return Ok(false);
        }
        let mut raw = reason.as_bytes().to_vec();
        raw.push(0);
        rewrite_sector(flash, self.region.base, &raw)?;
        Ok(true)
    }
}

/// Record why we are resetting, then reset. A failure to store the reason does not stop the
/// reset.
pub fn perform_reset<F, P>(flash: &mut F, platform: &mut P, layout: &FlashLayout, reason: &str)
where
    F: Flash + ?Sized,
    P: BootPlatform + ?Sized,
{
    info!("Rebooting: {}", reason);
    match RebootReason::new(layout).and_then(|store| store.store_reason(flash, reason)) {
        Ok(_) => {}
        Err(e) => warn!("Failed to store reboot reason: {}", e),
    }
    log::logger().flush();
    platform.system_reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::platform::ScriptedPlatform;
    use crate::flash::MemFlash;

    fn setup() -> (MemFlash, RebootReason) {
        let layout = FlashLayout::default();
        (MemFlash::new(layout.flash_size), RebootReason::new(&layout).unwrap())
    }

    #[test]
    fn test_blank_has_no_reason() {
        let (mut flash, store) = setup();
        assert_eq!(store.read_reason(&mut flash).unwrap(), None);
    }

    #[test]
    fn test_store_only_when_changed() {
        let (mut flash, store) = setup();
        assert!(store.store_reason(&mut flash, "OTA update").unwrap());
        let erases = flash.erase_count();
        assert!(!store.store_reason(&mut flash, "OTA update").unwrap());
        assert_eq!(flash.erase_count(), erases);
        assert_eq!(store.read_reason(&mut flash).unwrap().as_deref(), Some("OTA update"));

        assert!(store.store_reason(&mut flash, "watchdog").unwrap());
        assert_eq!(store.read_reason(&mut flash).unwrap().as_deref(), Some("watchdog"));
    }

    #[test]
    fn test_long_reason_truncated() {
        let (mut flash, store) = setup();
        let long = "r".repeat(100);
        store.store_reason(&mut flash, &long).unwrap();
        assert_eq!(store.read_reason(&mut flash).unwrap().unwrap().len(), REASON_MAX - 1);
        assert!(!store.store_reason(&mut flash, &long).unwrap());
    }

    #[test]
    fn test_perform_reset_stores_and_resets() {
        let layout = FlashLayout::default();
        let mut flash = MemFlash::new(layout.flash_size);
        let mut platform = ScriptedPlatform::new();
        perform_reset(&mut flash, &mut platform, &layout, "config changed");
        assert_eq!(platform.resets, 1);
        let store = RebootReason::new(&layout).unwrap();
        assert_eq!(store.read_reason(&mut flash).unwrap().as_deref(), Some("config changed"));
    }

    #[test]
    fn test_reset_happens_even_if_store_fails() {
        let layout = FlashLayout::default();
        let mut flash = MemFlash::new(layout.flash_size);
        let mut platform = ScriptedPlatform::new();
        flash.fail_next_read(1);
        perform_reset(&mut flash, &mut platform, &layout, "x");
        assert_eq!(platform.resets, 1);
    }
}
