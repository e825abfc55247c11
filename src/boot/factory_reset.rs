// Field-triggered factory reset: hold the reset pin through the whole window to restore the
// factory image into slot 0 and wipe the configuration.

use super::config::{BootConfig, BootConfigStore};
use super::platform::BootPlatform;
use super::{BootError, BootOptions};
use crate::flash::{Flash, SECTOR_SIZE};
use crate::layout::{FlashLayout, FACTORY_SLOT};
use log::{info, warn};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FactoryResetOutcome {
    /// Pin not configured, or released before the window ran out
    NotRequested,
    Performed,
}

/// Poll the reset pin once per interval for the configured window. Runs the reset and triggers
/// a hardware reset if the pin stays asserted on every poll.
pub fn check<F, P>(
    flash: &mut F,
    platform: &mut P,
    layout: &FlashLayout,
    options: &BootOptions,
) -> Result<FactoryResetOutcome, BootError>
where
    F: Flash + ?Sized,
    P: BootPlatform + ?Sized,
{
    let Some(pin) = options.factory_reset_pin else {
        return Ok(FactoryResetOutcome::NotRequested);
    };

    let interval_ms = options.poll_interval_ms.max(1);
    let intervals = options.factory_reset_window_s.saturating_mul(1000) / interval_ms;
    for poll in 0..=intervals {
        platform.feed_watchdog();
        if !pin.is_asserted(platform) {
            if poll > 0 {
                info!("Factory reset pin released after {}ms", poll.saturating_mul(interval_ms));
            }
            return Ok(FactoryResetOutcome::NotRequested);
        }
        if poll == 0 {
            info!("GPIO{} held, factory reset in {}s", pin.pin, options.factory_reset_window_s);
        }
        platform.delay_ms(interval_ms);
    }

    warn!("GPIO{} triggered reset to factory defaults", pin.pin);
    restore_factory(flash, layout)?;
    platform.delay_ms(options.post_reset_delay_ms);
    platform.system_reset();
    Ok(FactoryResetOutcome::Performed)
}

/// Erase the config sector, copy the factory slot over slot 0 and point the boot config at it.
///
/// Resetting the boot config goes beyond restoring the image: a stored current slot of 1, or
/// an enabled override pin, would otherwise survive the reset and steer the next boot away from
/// the restored slot 0.
pub fn restore_factory<F: Flash + ?Sized>(flash: &mut F, layout: &FlashLayout) -> Result<(), BootError> {
    let config = layout.config()?;
    flash.erase_range(config.base, config.len)?;
    info!("Configuration cleared");

    let from = layout.slot(FACTORY_SLOT)?;
    let to = layout.slot(0)?;
    let mut buffer = [0u8; SECTOR_SIZE as usize];
    let mut offset = 0;
    while offset < from.len && offset < to.len {
        flash.read(from.base + offset, &mut buffer)?;
        flash.erase_sector((to.base + offset) / SECTOR_SIZE)?;
        flash.write(to.base + offset, &buffer)?;
        offset += SECTOR_SIZE;
    }
    // factory slot is smaller; blank the tail of slot 0
    while offset < to.len {
        flash.erase_sector((to.base + offset) / SECTOR_SIZE)?;
        offset += SECTOR_SIZE;
    }
    info!("Factory image written into slot 0");

    BootConfigStore::new(layout).save(flash, &BootConfig::default_for(layout)?)?;
    Ok(())
}
