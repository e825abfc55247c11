//! Persistent device configuration.
//!
//! One record in one flash sector, always erased and rewritten whole. `load` never fails on bad
//! data: a record that fails verification is replaced by defaults (and persisted) so callers
//! always get something usable. Only flash errors surface as `Err`.

pub mod fields;
pub mod record;

use crate::flash::{rewrite_sector, Flash, FlashError};
use crate::layout::{FlashLayout, LayoutError, Region};
use log::{error, info, warn};

pub use fields::{Change, FieldError};
pub use record::{ConfigRecord, CONFIG_MAGIC, CONFIG_VERSION, LEGACY_LEN, RECORD_LEN};

use record::{checksum, stored_checksum, stored_magic, stored_version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultReason {
    BadMagic,
    BadVersion,
    BadChecksum,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    /// Checksum fine but some fields were out of range; fixed and rewritten
    Repaired(Vec<&'static str>),
    /// Older, shorter record; new fields cleared and rewritten
    Upgraded,
    /// Verification failed; defaults written
    Defaulted(DefaultReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Flash(FlashError),
    Layout(LayoutError),
    /// No record in memory yet, call `load` first
    NotLoaded,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Flash(e) => write!(f, "flash error: {}", e),
            ConfigError::Layout(e) => write!(f, "layout error: {}", e),
            ConfigError::NotLoaded => write!(f, "config not loaded"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<FlashError> for ConfigError {
    fn from(e: FlashError) -> Self {
        ConfigError::Flash(e)
    }
}

impl From<LayoutError> for ConfigError {
    fn from(e: LayoutError) -> Self {
        ConfigError::Layout(e)
    }
}

/// Owner of the in-memory configuration record
#[derive(Debug)]
pub struct ConfigStore {
    region: Region,
    record: Option<ConfigRecord>,
}

impl ConfigStore {
    pub fn init(layout: &FlashLayout) -> Result<Self, ConfigError> {
        Ok(Self { region: layout.config()?, record: None })
    }

    /// Forget the in-memory record
    pub fn reset(&mut self) {
        self.record = None;
    }

    pub fn record(&self) -> Option<&ConfigRecord> {
        self.record.as_ref()
    }

    pub(crate) fn record_mut(&mut self) -> Result<&mut ConfigRecord, ConfigError> {
        self.record.as_mut().ok_or(ConfigError::NotLoaded)
    }

    pub fn load<F: Flash + ?Sized>(&mut self, flash: &mut F) -> Result<LoadOutcome, ConfigError> {
        let mut raw = [0u8; RECORD_LEN];
        flash.read(self.region.base, &mut raw)?;

        if stored_magic(&raw) != CONFIG_MAGIC {
            return self.load_default(flash, DefaultReason::BadMagic);
        }
        let version = stored_version(&raw);
        if version == 0 || version > CONFIG_VERSION {
            return self.load_default(flash, DefaultReason::BadVersion);
        }

        let stored = stored_checksum(&raw);
        if stored == checksum(&raw, RECORD_LEN) {
            let (record, repairs) = ConfigRecord::from_bytes(&raw);
            self.record = Some(record);
            if repairs.is_empty() {
                info!("Loaded configuration");
                return Ok(LoadOutcome::Loaded);
            }
            for repair in &repairs {
                warn!("Config repair: {}", repair);
            }
            self.update(flash)?;
            return Ok(LoadOutcome::Repaired(repairs));
        }

        if stored == checksum(&raw, LEGACY_LEN) {
            warn!("IP info not in config, upgrading");
            raw[LEGACY_LEN..].fill(0);
            let (mut record, repairs) = ConfigRecord::from_bytes(&raw);
            for repair in &repairs {
                warn!("Config repair: {}", repair);
            }
            record.version = CONFIG_VERSION;
            self.record = Some(record);
            self.update(flash)?;
            return Ok(LoadOutcome::Upgraded);
        }

        self.load_default(flash, DefaultReason::BadChecksum)
    }

    fn load_default<F: Flash + ?Sized>(
        &mut self,
        flash: &mut F,
        reason: DefaultReason,
    ) -> Result<LoadOutcome, ConfigError> {
        warn!("Invalid config ({:?}), using defaults", reason);
        self.save(flash, &ConfigRecord::default())?;
        Ok(LoadOutcome::Defaulted(reason))
    }

    /// Persist `record` and make it the in-memory record
    pub fn save<F: Flash + ?Sized>(&mut self, flash: &mut F, record: &ConfigRecord) -> Result<(), ConfigError> {
        if let Err(e) = rewrite_sector(flash, self.region.base, &record.to_bytes()) {
            error!("Failed to save config: {}", e);
            return Err(e.into());
        }
        self.record = Some(record.clone());
        Ok(())
    }

    /// Recompute the checksum of the in-memory record and persist it
    pub fn update<F: Flash + ?Sized>(&mut self, flash: &mut F) -> Result<(), ConfigError> {
        let record = self.record.clone().ok_or(ConfigError::NotLoaded)?;
        self.save(flash, &record)
    }

    /// Replace the stored record with defaults
    pub fn wipe<F: Flash + ?Sized>(&mut self, flash: &mut F) -> Result<(), ConfigError> {
        info!("Wiping configuration");
        self.save(flash, &ConfigRecord::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::MemFlash;
    use proptest::prelude::*;
    use record::to_field;

    const BASE: usize = 0x200000;

    fn setup() -> (MemFlash, ConfigStore) {
        let layout = FlashLayout::default();
        (MemFlash::new(layout.flash_size), ConfigStore::init(&layout).unwrap())
    }

    fn sample() -> ConfigRecord {
        let mut record = ConfigRecord::default();
        record.ssid = to_field("otb-iot").unwrap();
        record.password = to_field("hunter22").unwrap();
        record.locations[1] = to_field("kitchen").unwrap();
        record.mqtt.server = to_field("192.168.0.5").unwrap();
        record
    }

    #[test]
    fn test_blank_flash_defaults_and_persists() {
        let (mut flash, mut store) = setup();
        assert_eq!(store.load(&mut flash).unwrap(), LoadOutcome::Defaulted(DefaultReason::BadMagic));
        assert_eq!(store.record(), Some(&ConfigRecord::default()));
        store.reset();
        assert_eq!(store.load(&mut flash).unwrap(), LoadOutcome::Loaded);
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let (mut flash, mut store) = setup();
        let record = sample();
        store.save(&mut flash, &record).unwrap();
        store.reset();
        assert_eq!(store.load(&mut flash).unwrap(), LoadOutcome::Loaded);
        assert_eq!(store.record(), Some(&record));
        assert_eq!(flash.read_vec(BASE as u32, RECORD_LEN).unwrap(), record.to_bytes());
    }

    #[test]
    fn test_corrupt_checksum_field_defaults() {
        let (mut flash, mut store) = setup();
        store.save(&mut flash, &sample()).unwrap();
        flash.bytes_mut()[BASE + 6] ^= 0x01;
        store.reset();
        assert_eq!(store.load(&mut flash).unwrap(), LoadOutcome::Defaulted(DefaultReason::BadChecksum));
        assert_eq!(store.record(), Some(&ConfigRecord::default()));
    }

    #[test]
    fn test_bad_version_defaults() {
        let (mut flash, mut store) = setup();
        store.save(&mut flash, &sample()).unwrap();
        flash.bytes_mut()[BASE + 4] = 9;
        store.reset();
        assert_eq!(store.load(&mut flash).unwrap(), LoadOutcome::Defaulted(DefaultReason::BadVersion));
    }

    #[test]
    fn test_torn_write_detected() {
        let (mut flash, mut store) = setup();
        store.save(&mut flash, &sample()).unwrap();
        // power lost between erase and rewrite
        flash.erase_sector((BASE / 0x1000) as u32).unwrap();
        store.reset();
        assert!(matches!(store.load(&mut flash).unwrap(), LoadOutcome::Defaulted(_)));
    }

    #[test]
    fn test_legacy_record_upgraded() {
        let (mut flash, mut store) = setup();
        let mut record = sample();
        let mut raw = record.to_bytes();
        // older firmware: checksum over the legacy prefix, trailing bytes never written
        raw.truncate(LEGACY_LEN);
        let sum = checksum(&raw, LEGACY_LEN);
        raw[6..8].copy_from_slice(&sum.to_le_bytes());
        flash.write(BASE as u32, &raw).unwrap();

        assert_eq!(store.load(&mut flash).unwrap(), LoadOutcome::Upgraded);
        record.ip = Default::default();
        assert_eq!(store.record(), Some(&record));
        store.reset();
        assert_eq!(store.load(&mut flash).unwrap(), LoadOutcome::Loaded);
    }

    #[test]
    fn test_repairs_are_persisted() {
        let (mut flash, mut store) = setup();
        let mut raw = sample().to_bytes();
        raw[885] = 0x40; // status led out of range
        let sum = checksum(&raw, RECORD_LEN);
        raw[6..8].copy_from_slice(&sum.to_le_bytes());
        flash.write(BASE as u32, &raw).unwrap();

        assert_eq!(
            store.load(&mut flash).unwrap(),
            LoadOutcome::Repaired(vec!["status led invalid"])
        );
        store.reset();
        assert_eq!(store.load(&mut flash).unwrap(), LoadOutcome::Loaded);
        assert_eq!(store.record(), Some(&sample()));
    }

    #[test]
    fn test_update_requires_load() {
        let (mut flash, mut store) = setup();
        assert_eq!(store.update(&mut flash), Err(ConfigError::NotLoaded));
    }

    #[test]
    fn test_flash_error_propagates() {
        let (mut flash, mut store) = setup();
        flash.fail_next_read(2);
        assert_eq!(store.load(&mut flash), Err(ConfigError::Flash(FlashError::Device { code: 2 })));
    }

    #[test]
    fn test_wipe_restores_defaults() {
        let (mut flash, mut store) = setup();
        store.save(&mut flash, &sample()).unwrap();
        store.wipe(&mut flash).unwrap();
        store.reset();
        store.load(&mut flash).unwrap();
        assert_eq!(store.record(), Some(&ConfigRecord::default()));
    }

    fn arb_record() -> impl Strategy<Value = ConfigRecord> {
        ("[a-z0-9]{0,32}", "[ -~]{0,63}", "[ -~]{0,31}", any::<bool>(), 0u8..=2, any::<i32>())
            .prop_map(|(ssid, password, loc, keep_ap, led, port)| {
                let mut record = ConfigRecord::default();
                record.ssid = to_field(&ssid).unwrap_or_default();
                record.password = to_field(&password).unwrap_or_default();
                record.locations[2] = to_field(&loc).unwrap_or_default();
                record.keep_ap_active = keep_ap;
                record.status_led = led;
                record.mqtt.port = port;
                record
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_save_load_round_trip(record in arb_record()) {
            let (mut flash, mut store) = setup();
            store.save(&mut flash, &record).unwrap();
            store.reset();
            prop_assert_eq!(store.load(&mut flash).unwrap(), LoadOutcome::Loaded);
            prop_assert_eq!(store.record().unwrap().to_bytes(), record.to_bytes());
        }

        #[test]
        fn prop_single_byte_corruption_defaults(
            record in arb_record(),
            offset in 0usize..RECORD_LEN,
            mask in 1u8..=255,
        ) {
            let (mut flash, mut store) = setup();
            store.save(&mut flash, &record).unwrap();
            flash.bytes_mut()[BASE + offset] ^= mask;
            store.reset();
            let outcome = store.load(&mut flash).unwrap();
            if offset < LEGACY_LEN {
                prop_assert!(matches!(outcome, LoadOutcome::Defaulted(_)), "{:?}", outcome);
            } else {
                // a zero tail makes both checksums agree, so a damaged tail reads as legacy
                prop_assert!(
                    matches!(outcome, LoadOutcome::Defaulted(_) | LoadOutcome::Upgraded),
                    "{:?}",
                    outcome
                );
            }
        }
    }
}
