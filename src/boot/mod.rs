//! Boot selection.
//!
//! Runs once per power-on before any application code: optional factory reset, load (and if
//! needed repair) the boot config, pick a slot, validate it, fall back through the remaining
//! slots, persist the choice and hand the image to the trampoline.

pub mod config;
pub mod factory_reset;
pub mod platform;

use crate::flash::{Flash, FlashError};
use crate::image::{check_image, FlashInfo, ImageError, ImageHeader, IntegrityPolicy, ValidImage};
use crate::layout::{FlashLayout, LayoutError, Region, RegionKind, FACTORY_SLOT, MAX_SLOTS};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

pub use config::{BootConfig, BootConfigError, BootConfigStore, LoadOutcome};
pub use factory_reset::FactoryResetOutcome;
pub use platform::{BootPlatform, PinConfig, ScriptedPlatform, Trampoline};

/// Order in which slots are tried after the first candidate fails
pub const FALLBACK_ORDER: [u8; 3] = [1, 0, FACTORY_SLOT];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootOptions {
    /// Pin held to request a factory reset, None to disable
    pub factory_reset_pin: Option<PinConfig>,
    pub factory_reset_window_s: u32,
    pub poll_interval_ms: u32,
    /// Pin that boots the config's GPIO slot when the config enables it
    pub override_pin: PinConfig,
    /// Wait before resetting when no slot validates
    pub halt_delay_ms: u32,
    /// Wait between a factory reset and the hardware reset
    pub post_reset_delay_ms: u32,
    pub integrity: IntegrityPolicy,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            factory_reset_pin: Some(PinConfig::active_low(14)),
            factory_reset_window_s: 15,
            poll_interval_ms: 1000,
            override_pin: PinConfig::active_low(16),
            halt_delay_ms: 5000,
            post_reset_delay_ms: 2000,
            integrity: IntegrityPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootError {
    Flash(FlashError),
    Layout(LayoutError),
    Config(BootConfigError),
}

impl std::fmt::Display for BootError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootError::Flash(e) => write!(f, "flash error: {}", e),
            BootError::Layout(e) => write!(f, "layout error: {}", e),
            BootError::Config(e) => write!(f, "boot config error: {}", e),
        }
    }
}

impl std::error::Error for BootError {}

impl From<FlashError> for BootError {
    fn from(e: FlashError) -> Self {
        BootError::Flash(e)
    }
}

impl From<LayoutError> for BootError {
    fn from(e: LayoutError) -> Self {
        BootError::Layout(e)
    }
}

impl From<BootConfigError> for BootError {
    fn from(e: BootConfigError) -> Self {
        match e {
            BootConfigError::Flash(e) => BootError::Flash(e),
            BootConfigError::Layout(e) => BootError::Layout(e),
            other => BootError::Config(other),
        }
    }
}

/// Why the first slot tried was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CandidateSource {
    /// Override pin asserted with GPIO mode enabled
    Override,
    Persisted,
    /// Persisted index out of range, forced to slot 0
    InvalidIndex,
    /// Persisted index was the factory slot; it is only a last resort
    FactoryRedirect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attempt {
    pub slot: u8,
    /// None when the slot validated
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootTarget {
    pub slot: u8,
    pub image: ValidImage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BootOutcome {
    Boot(BootTarget),
    /// Factory reset ran; the platform has been reset
    FactoryReset,
    /// Nothing bootable; the platform has been reset after the halt delay
    Halted,
}

/// What happened during one boot attempt
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootReport {
    pub flash_info: Option<FlashInfo>,
    pub config_defaulted: bool,
    pub source: Option<CandidateSource>,
    pub attempts: heapless::Vec<Attempt, MAX_SLOTS>,
    pub config_rewritten: bool,
}

impl BootReport {
    pub fn tried_slots(&self) -> Vec<u8> {
        self.attempts.iter().map(|a| a.slot).collect()
    }
}

pub struct BootSelector<'a, F: Flash + ?Sized, P: BootPlatform + ?Sized> {
    flash: &'a mut F,
    platform: &'a mut P,
    layout: &'a FlashLayout,
    options: &'a BootOptions,
    report: BootReport,
}

impl<'a, F: Flash + ?Sized, P: BootPlatform + ?Sized> BootSelector<'a, F, P> {
    pub fn new(
        flash: &'a mut F,
        platform: &'a mut P,
        layout: &'a FlashLayout,
        options: &'a BootOptions,
    ) -> Self {
        Self { flash, platform, layout, options, report: BootReport::default() }
    }

    pub fn report(&self) -> &BootReport {
        &self.report
    }

    pub fn into_report(self) -> BootReport {
        self.report
    }

    pub fn run(&mut self) -> Result<BootOutcome, BootError> {
        let reset = factory_reset::check(self.flash, self.platform, self.layout, self.options)?;
        if reset == FactoryResetOutcome::Performed {
            return Ok(BootOutcome::FactoryReset);
        }

        self.log_flash_info();

        let store = BootConfigStore::new(self.layout);
        let (mut config, outcome) = store.load(self.flash)?;
        self.report.config_defaulted = outcome == LoadOutcome::Defaulted;

        let (mut slot, source) = self.pick_candidate(&config);
        self.report.source = Some(source);
        let override_boot = source == CandidateSource::Override;
        if override_boot {
            info!("Booting GPIO-selected slot {}", slot);
        }

        let mut tried: u8 = 0;
        let image = loop {
            tried |= slot_bit(slot);
            match self.validate(&config, slot) {
                Ok(image) => {
                    self.record(slot, None);
                    break Some(image);
                }
                Err(e) => {
                    warn!("Slot {} is bad: {}", slot, e);
                    self.record(slot, Some(e.to_string()));
                }
            }
            if override_boot {
                error!("GPIO boot failed");
                break None;
            }
            match next_slot(tried, config.count) {
                Some(next) => {
                    info!("Trying slot {}", next);
                    slot = next;
                }
                None => break None,
            }
        };

        let Some(image) = image else {
            self.halt();
            return Ok(BootOutcome::Halted);
        };

        if !override_boot && config.current_slot != slot {
            config.current_slot = slot;
            store.save(self.flash, &config)?;
            self.report.config_rewritten = true;
        }

        info!("Booting slot {} at 0x{:08x}", slot, image.entry);
        Ok(BootOutcome::Boot(BootTarget { slot, image }))
    }

    fn log_flash_info(&mut self) {
        let addr = self
            .layout
            .region(RegionKind::Bootloader)
            .map(|r| r.base)
            .unwrap_or(0);
        match ImageHeader::read_at(self.flash, addr) {
            Ok(header) => {
                let info = header.flash_info();
                info!("Flash: {}", info);
                self.report.flash_info = Some(info);
            }
            Err(e) => warn!("Could not read boot header: {}", e),
        }
    }

    fn pick_candidate(&mut self, config: &BootConfig) -> (u8, CandidateSource) {
        if config.gpio_mode() && self.options.override_pin.is_asserted(self.platform) {
            if config.gpio_slot < config.count {
                return (config.gpio_slot, CandidateSource::Override);
            }
            warn!("Invalid GPIO slot {} selected, defaulting to 0", config.gpio_slot);
            return (0, CandidateSource::InvalidIndex);
        }
        if config.current_slot >= config.count {
            warn!("Invalid slot {} selected, defaulting to 0", config.current_slot);
            return (0, CandidateSource::InvalidIndex);
        }
        if config.current_slot == FACTORY_SLOT {
            return (0, CandidateSource::FactoryRedirect);
        }
        (config.current_slot, CandidateSource::Persisted)
    }

    fn validate(&mut self, config: &BootConfig, slot: u8) -> Result<ValidImage, ImageError> {
        let region = self.slot_region(config, slot);
        check_image(self.flash, &region, self.options.integrity)
    }

    /// Slot address from the boot config, length from the layout, clamped to the device
    fn slot_region(&self, config: &BootConfig, slot: u8) -> Region {
        let base = config.slots.get(slot as usize).copied().unwrap_or(0);
        let room = self.layout.flash_size.saturating_sub(base);
        let len = match self.layout.slot(slot) {
            Ok(region) => region.len.min(room),
            Err(_) => room,
        };
        let kind = if slot == FACTORY_SLOT { RegionKind::Factory } else { RegionKind::Slot(slot) };
        Region::new(kind, base, len)
    }

    fn record(&mut self, slot: u8, error: Option<String>) {
        // at most one attempt per slot
        let _ = self.report.attempts.push(Attempt { slot, error });
    }

    fn halt(&mut self) {
        error!("No good ROM available, rebooting in {}s", self.options.halt_delay_ms / 1000);
        let mut remaining = self.options.halt_delay_ms;
        while remaining > 0 {
            let step = remaining.min(1000);
            self.platform.feed_watchdog();
            self.platform.delay_ms(step);
            remaining -= step;
        }
        self.platform.system_reset();
    }
}

/// Bit for `slot` in a tried bitmask, 0 for slots past the mask
fn slot_bit(slot: u8) -> u8 {
    1u8.checked_shl(slot as u32).unwrap_or(0)
}

/// First fallback slot not yet in the `tried` bitmask
pub fn next_slot(tried: u8, count: u8) -> Option<u8> {
    FALLBACK_ORDER
        .iter()
        .copied()
        .find(|&slot| slot < count && tried & slot_bit(slot) == 0)
}

/// Power-on entry: select an image and jump to it, or reset
pub fn boot_entry<F, P, T>(
    flash: &mut F,
    platform: &mut P,
    trampoline: &mut T,
    layout: &FlashLayout,
    options: &BootOptions,
) -> !
where
    F: Flash + ?Sized,
    P: BootPlatform + ?Sized,
    T: Trampoline + ?Sized,
{
    let outcome = BootSelector::new(flash, platform, layout, options).run();
    match outcome {
        Ok(BootOutcome::Boot(target)) => trampoline.enter(&target),
        Ok(_) => {}
        Err(e) => {
            error!("Boot failed: {}", e);
            platform.delay_ms(options.halt_delay_ms);
            platform.system_reset();
        }
    }
    // reset already requested; wait for it
    loop {
        platform.delay_ms(1000);
    }
}
