// Boot configuration record: which slots exist and which one boots next

use crate::flash::{Flash, FlashError, SECTOR_SIZE};
use crate::layout::{FlashLayout, LayoutError, FACTORY_SLOT, MAX_SLOTS};
use log::{info, warn};
use serde::Serialize;

pub const BOOT_CONFIG_MAGIC: u8 = 0xE1;
pub const BOOT_CONFIG_VERSION: u8 = 0x01;
pub const BOOT_CONFIG_LEN: usize = 25;

/// Mode bit: honour the override pin
pub const MODE_GPIO_ROM: u8 = 0x01;

const CHKSUM_INIT: u8 = 0xEF;
const CHKSUM_OFFSET: usize = BOOT_CONFIG_LEN - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BootConfig {
    pub magic: u8,
    pub version: u8,
    pub mode: u8,
    pub current_slot: u8,
    pub gpio_slot: u8,
    pub count: u8,
    pub reserved: [u8; 2],
    pub slots: [u32; MAX_SLOTS],
}

/// What `load` had to do to produce a usable record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Valid,
    /// Stored record failed magic/version/checksum and the default was written
    Defaulted,
}

impl BootConfig {
    /// Three registered slots, slot 0 current, factory slot on the override pin
    pub fn default_for(layout: &FlashLayout) -> Result<Self, LayoutError> {
        let mut slots = [0u32; MAX_SLOTS];
        for (i, slot) in slots.iter_mut().enumerate().take(3) {
            *slot = layout.slot(i as u8)?.base;
        }
        Ok(Self {
            magic: BOOT_CONFIG_MAGIC,
            version: BOOT_CONFIG_VERSION,
            mode: 0,
            current_slot: 0,
            gpio_slot: FACTORY_SLOT,
            count: 3,
            reserved: [0; 2],
            slots,
        })
    }

    pub fn gpio_mode(&self) -> bool {
        self.mode & MODE_GPIO_ROM != 0
    }

    pub fn to_bytes(&self) -> [u8; BOOT_CONFIG_LEN] {
        let mut out = [0u8; BOOT_CONFIG_LEN];
        out[0] = self.magic;
        out[1] = self.version;
        out[2] = self.mode;
        out[3] = self.current_slot;
        out[4] = self.gpio_slot;
        out[5] = self.count;
        out[6..8].copy_from_slice(&self.reserved);
        for (i, addr) in self.slots.iter().enumerate() {
            out[8 + i * 4..12 + i * 4].copy_from_slice(&addr.to_le_bytes());
        }
        out[CHKSUM_OFFSET] = checksum(&out[..CHKSUM_OFFSET]);
        out
    }

    /// Decode a stored record. None when magic, version or checksum is wrong, or when the
    /// slot count or either slot index falls outside the slot table.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < BOOT_CONFIG_LEN {
            return None;
        }
        if raw[0] != BOOT_CONFIG_MAGIC || raw[1] != BOOT_CONFIG_VERSION {
            return None;
        }
        if raw[CHKSUM_OFFSET] != checksum(&raw[..CHKSUM_OFFSET]) {
            return None;
        }
        let table = MAX_SLOTS as u8;
        if raw[5] > table || raw[3] >= table || raw[4] >= table {
            return None;
        }
        let mut slots = [0u32; MAX_SLOTS];
        for (i, slot) in slots.iter_mut().enumerate() {
            let at = 8 + i * 4;
            *slot = u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        }
        Some(Self {
            magic: raw[0],
            version: raw[1],
            mode: raw[2],
            current_slot: raw[3],
            gpio_slot: raw[4],
            count: raw[5],
            reserved: [raw[6], raw[7]],
            slots,
        })
    }
}

pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(CHKSUM_INIT, |acc, b| acc ^ b)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootConfigError {
    Flash(FlashError),
    Layout(LayoutError),
    /// Requested slot is not registered
    InvalidSlot(u8),
    /// No valid record stored
    NotFound,
}

impl std::fmt::Display for BootConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BootConfigError::Flash(e) => write!(f, "flash error: {}", e),
            BootConfigError::Layout(e) => write!(f, "layout error: {}", e),
            BootConfigError::InvalidSlot(slot) => write!(f, "invalid slot {}", slot),
            BootConfigError::NotFound => write!(f, "no valid boot config"),
        }
    }
}

impl std::error::Error for BootConfigError {}

impl From<FlashError> for BootConfigError {
    fn from(e: FlashError) -> Self {
        BootConfigError::Flash(e)
    }
}

impl From<LayoutError> for BootConfigError {
    fn from(e: LayoutError) -> Self {
        BootConfigError::Layout(e)
    }
}

/// Reads and writes the boot config sector
pub struct BootConfigStore<'a> {
    layout: &'a FlashLayout,
}

impl<'a> BootConfigStore<'a> {
    pub fn new(layout: &'a FlashLayout) -> Self {
        Self { layout }
    }

    fn addr(&self) -> Result<u32, BootConfigError> {
        Ok(self.layout.boot_config()?.base)
    }

    /// Raw read, no repair
    pub fn read<F: Flash + ?Sized>(&self, flash: &mut F) -> Result<Option<BootConfig>, BootConfigError> {
        let mut raw = [0u8; BOOT_CONFIG_LEN];
        flash.read(self.addr()?, &mut raw)?;
        Ok(BootConfig::from_bytes(&raw))
    }

    /// Read the record, replacing an invalid one with the default before returning it
    pub fn load<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
    ) -> Result<(BootConfig, LoadOutcome), BootConfigError> {
        if let Some(config) = self.read(flash)? {
            return Ok((config, LoadOutcome::Valid));
        }
        warn!("No valid boot config found, writing default");
        let config = BootConfig::default_for(self.layout)?;
        self.save(flash, &config)?;
        Ok((config, LoadOutcome::Defaulted))
    }

    /// Rewrite the sector, keeping whatever follows the record
    pub fn save<F: Flash + ?Sized>(&self, flash: &mut F, config: &BootConfig) -> Result<(), BootConfigError> {
        let addr = self.addr()?;
        let mut sector = vec![0u8; SECTOR_SIZE as usize];
        flash.read(addr, &mut sector)?;
        sector[..BOOT_CONFIG_LEN].copy_from_slice(&config.to_bytes());
        flash.erase_sector(addr / SECTOR_SIZE)?;
        flash.write(addr, &sector)?;
        Ok(())
    }

    pub fn current_slot<F: Flash + ?Sized>(&self, flash: &mut F) -> Result<u8, BootConfigError> {
        self.read(flash)?
            .map(|c| c.current_slot)
            .ok_or(BootConfigError::NotFound)
    }

    /// Point the next boot at `slot`
    pub fn set_current_slot<F: Flash + ?Sized>(&self, flash: &mut F, slot: u8) -> Result<(), BootConfigError> {
        let mut config = self.read(flash)?.ok_or(BootConfigError::NotFound)?;
        if slot >= config.count {
            return Err(BootConfigError::InvalidSlot(slot));
        }
        config.current_slot = slot;
        self.save(flash, &config)?;
        info!("Boot slot set to {}", slot);
        Ok(())
    }

    /// Enable or disable the override pin and choose the slot it boots
    pub fn set_gpio_mode<F: Flash + ?Sized>(
        &self,
        flash: &mut F,
        enabled: bool,
        slot: u8,
    ) -> Result<(), BootConfigError> {
        let mut config = self.read(flash)?.ok_or(BootConfigError::NotFound)?;
        if slot >= config.count {
            return Err(BootConfigError::InvalidSlot(slot));
        }
        if enabled {
            config.mode |= MODE_GPIO_ROM;
        } else {
            config.mode &= !MODE_GPIO_ROM;
        }
        config.gpio_slot = slot;
        self.save(flash, &config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;
    use proptest::prelude::*;

    fn setup() -> (MemFlash, FlashLayout) {
        (MemFlash::new(0x400000), FlashLayout::default())
    }

    #[test]
    fn test_default_record() {
        let layout = FlashLayout::default();
        let config = BootConfig::default_for(&layout).unwrap();
        assert_eq!(config.count, 3);
        assert_eq!(config.current_slot, 0);
        assert_eq!(config.gpio_slot, 2);
        assert_eq!(config.slots, [0x002000, 0x202000, 0x302000, 0]);
        assert!(!config.gpio_mode());
    }

    #[test]
    fn test_blank_flash_writes_default() {
        let (mut flash, layout) = setup();
        let store = BootConfigStore::new(&layout);
        let (config, outcome) = store.load(&mut flash).unwrap();
        assert_eq!(outcome, LoadOutcome::Defaulted);
        assert_eq!(store.read(&mut flash).unwrap(), Some(config));
        let (_, outcome) = store.load(&mut flash).unwrap();
        assert_eq!(outcome, LoadOutcome::Valid);
    }

    #[test]
    fn test_save_preserves_rest_of_sector() {
        let (mut flash, layout) = setup();
        flash.write(0x1000 + 0x800, &[0xAB; 4]).unwrap();
        let store = BootConfigStore::new(&layout);
        store.load(&mut flash).unwrap();
        assert_eq!(flash.read_vec(0x1800, 4).unwrap(), vec![0xAB; 4]);
    }

    #[test]
    fn test_set_current_slot_bounds() {
        let (mut flash, layout) = setup();
        let store = BootConfigStore::new(&layout);
        store.load(&mut flash).unwrap();
        store.set_current_slot(&mut flash, 1).unwrap();
        assert_eq!(store.current_slot(&mut flash).unwrap(), 1);
        assert_eq!(store.set_current_slot(&mut flash, 3), Err(BootConfigError::InvalidSlot(3)));
        assert_eq!(store.current_slot(&mut flash).unwrap(), 1);
    }

    #[test]
    fn test_set_current_slot_without_record() {
        let (mut flash, layout) = setup();
        let store = BootConfigStore::new(&layout);
        assert_eq!(store.set_current_slot(&mut flash, 0), Err(BootConfigError::NotFound));
    }

    #[test]
    fn test_gpio_mode_toggle() {
        let (mut flash, layout) = setup();
        let store = BootConfigStore::new(&layout);
        store.load(&mut flash).unwrap();
        store.set_gpio_mode(&mut flash, true, 2).unwrap();
        assert!(store.read(&mut flash).unwrap().unwrap().gpio_mode());
        store.set_gpio_mode(&mut flash, false, 2).unwrap();
        assert!(!store.read(&mut flash).unwrap().unwrap().gpio_mode());
    }

    #[test]
    fn test_slot_past_table_rejected() {
        let (mut flash, layout) = setup();
        let store = BootConfigStore::new(&layout);
        let mut config = BootConfig::default_for(&layout).unwrap();
        config.count = 20;
        config.current_slot = 9;
        store.save(&mut flash, &config).unwrap();
        assert_eq!(store.read(&mut flash).unwrap(), None);
        let (loaded, outcome) = store.load(&mut flash).unwrap();
        assert_eq!(outcome, LoadOutcome::Defaulted);
        assert_eq!(loaded.current_slot, 0);
        assert_eq!(loaded.count, 3);
    }

    #[test]
    fn test_erase_failure_propagates() {
        let (mut flash, layout) = setup();
        flash.fail_next_erase(1);
        let store = BootConfigStore::new(&layout);
        assert_eq!(
            store.load(&mut flash),
            Err(BootConfigError::Flash(FlashError::Device { code: 1 }))
        );
    }

    proptest! {
        #[test]
        fn prop_valid_records_load_unchanged(
            mode in 0u8..2,
            current in 0u8..3,
            gpio in 0u8..3,
            count in 1u8..=4,
            slots in any::<[u32; 4]>(),
        ) {
            let (mut flash, layout) = setup();
            let config = BootConfig {
                magic: BOOT_CONFIG_MAGIC,
                version: BOOT_CONFIG_VERSION,
                mode,
                current_slot: current,
                gpio_slot: gpio,
                count,
                reserved: [0; 2],
                slots,
            };
            let mut raw = config.to_bytes().to_vec();
            raw.resize(28, 0xFF);
            flash.write(0x1000, &raw).unwrap();
            let store = BootConfigStore::new(&layout);
            let (loaded, outcome) = store.load(&mut flash).unwrap();
            prop_assert_eq!(outcome, LoadOutcome::Valid);
            prop_assert_eq!(loaded, config);
            prop_assert_eq!(flash.erase_count(), 0);
        }

        #[test]
        fn prop_out_of_table_slots_load_default(
            current in 0u8..=255,
            gpio in 0u8..=255,
            count in 0u8..=255,
        ) {
            prop_assume!(count as usize > MAX_SLOTS || current as usize >= MAX_SLOTS || gpio as usize >= MAX_SLOTS);
            let (mut flash, layout) = setup();
            let mut config = BootConfig::default_for(&layout).unwrap();
            config.current_slot = current;
            config.gpio_slot = gpio;
            config.count = count;
            let mut raw = config.to_bytes().to_vec();
            raw.resize(28, 0xFF);
            flash.write(0x1000, &raw).unwrap();
            let store = BootConfigStore::new(&layout);
            let (loaded, outcome) = store.load(&mut flash).unwrap();
            prop_assert_eq!(outcome, LoadOutcome::Defaulted);
            prop_assert_eq!(loaded, BootConfig::default_for(&layout).unwrap());
        }

        #[test]
        fn prop_garbage_loads_default(raw in prop::collection::vec(any::<u8>(), 28)) {
            prop_assume!(BootConfig::from_bytes(&raw).is_none());
            let (mut flash, layout) = setup();
            flash.write(0x1000, &raw).unwrap();
            let store = BootConfigStore::new(&layout);
            let (loaded, outcome) = store.load(&mut flash).unwrap();
            let default = BootConfig::default_for(&layout).unwrap();
            prop_assert_eq!(outcome, LoadOutcome::Defaulted);
            prop_assert_eq!(loaded, default);
            prop_assert_eq!(store.read(&mut flash).unwrap(), Some(default));
        }
    }
}
