//! Field-level access to the configuration record.
//!
//! Each setter validates its input, applies it to the in-memory record and persists the
//! result. If the save fails the in-memory record is put back the way it was.

use super::record::{to_field, ConfigRecord, ADS_MAX, DS18B20_MAX, STATUS_LED_WARN};
use super::{ConfigError, ConfigStore};
use crate::flash::Flash;
use log::{info, warn};
use std::fmt::Write as _;

pub const LOCATION_MAX: usize = 31;
pub const SSID_MAX: usize = 32;
pub const PASSWORD_MAX: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Changed,
    Unchanged,
}

impl Change {
    fn from_bool(changed: bool) -> Self {
        if changed {
            Change::Changed
        } else {
            Change::Unchanged
        }
    }

    /// Response text for a command that set `value`
    pub fn describe(self, value: impl std::fmt::Display) -> String {
        match self {
            Change::Changed => format!("amended to {}", value),
            Change::Unchanged => "no change".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    InvalidField,
    InvalidIndex,
    InvalidLocation,
    TooLong,
    InvalidCharacters,
    InvalidValue,
    Internal(ConfigError),
}

impl FieldError {
    /// Short response text reported back to whoever issued the command
    pub fn reason(&self) -> &'static str {
        match self {
            FieldError::InvalidField => "invalid field",
            FieldError::InvalidIndex => "invalid index",
            FieldError::InvalidLocation => "invalid location",
            FieldError::TooLong => "location string too long",
            FieldError::InvalidCharacters => "invalid characters",
            FieldError::InvalidValue => "invalid value",
            FieldError::Internal(_) => "internal error",
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldError::Internal(e) => write!(f, "internal error: {}", e),
            other => f.write_str(other.reason()),
        }
    }
}

impl std::error::Error for FieldError {}

impl From<ConfigError> for FieldError {
    fn from(e: ConfigError) -> Self {
        FieldError::Internal(e)
    }
}

fn is_printable(s: &str) -> bool {
    s.bytes().all(|b| (0x20..=0x7E).contains(&b))
}

fn check_location(value: &str) -> Result<(), FieldError> {
    if value.len() > LOCATION_MAX {
        return Err(FieldError::TooLong);
    }
    if !is_printable(value) {
        return Err(FieldError::InvalidCharacters);
    }
    Ok(())
}

fn is_ds18b20_id(id: &str) -> bool {
    id.len() == 15 && id.starts_with("28-") && id[3..].bytes().all(|b| b.is_ascii_hexdigit())
}

fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3 + bytes.len() / 16 * 7);
    for (row, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:04x}:", row * 16);
        for b in chunk {
            let _ = write!(out, " {:02x}", b);
        }
        out.push('\n');
    }
    out
}

fn parse_index(name: &str, prefix: &str, max: usize) -> Option<Result<usize, FieldError>> {
    let rest = name.strip_prefix(prefix)?;
    Some(match rest.parse::<usize>() {
        Ok(i) if i < max => Ok(i),
        _ => Err(FieldError::InvalidIndex),
    })
}

impl ConfigStore {
    /// Apply `apply` to the record and persist, restoring the old record if the save fails
    fn modify<F, A>(&mut self, flash: &mut F, apply: A) -> Result<Change, FieldError>
    where
        F: Flash + ?Sized,
        A: FnOnce(&mut ConfigRecord),
    {
        let record = self.record_mut()?;
        let before = record.clone();
        apply(record);
        if *record == before {
            return Ok(Change::Unchanged);
        }
        if let Err(e) = self.update(flash) {
            warn!("Reverting config change after failed save");
            if let Ok(record) = self.record_mut() {
                *record = before;
            }
            return Err(e.into());
        }
        Ok(Change::Changed)
    }

    /// Set station credentials. Without `commit` the change stays in memory only.
    pub fn set_station<F: Flash + ?Sized>(
        &mut self,
        flash: &mut F,
        ssid: &str,
        password: &str,
        commit: bool,
    ) -> Result<Change, FieldError> {
        let ssid_field = to_field::<SSID_MAX>(ssid).ok_or(FieldError::InvalidValue)?;
        let password_field = to_field::<PASSWORD_MAX>(password).ok_or(FieldError::InvalidValue)?;
        if ssid.contains('\0') || password.contains('\0') {
            return Err(FieldError::InvalidCharacters);
        }
        if !commit {
            let record = self.record_mut()?;
            let changed = record.ssid != ssid_field || record.password != password_field;
            record.ssid = ssid_field;
            record.password = password_field;
            return Ok(Change::from_bool(changed));
        }
        let change = self.modify(flash, |r| {
            r.ssid = ssid_field;
            r.password = password_field;
        })?;
        if change == Change::Changed {
            info!("Station credentials updated for SSID '{}'", ssid);
        }
        Ok(change)
    }

    pub fn set_keep_ap_active<F: Flash + ?Sized>(
        &mut self,
        flash: &mut F,
        active: bool,
    ) -> Result<Change, FieldError> {
        self.modify(flash, |r| r.keep_ap_active = active)
    }

    /// Set location `n`, counted from 1
    pub fn set_location<F: Flash + ?Sized>(
        &mut self,
        flash: &mut F,
        n: u8,
        value: &str,
    ) -> Result<Change, FieldError> {
        if !(1..=3).contains(&n) {
            return Err(FieldError::InvalidLocation);
        }
        check_location(value)?;
        let field = to_field(value).ok_or(FieldError::TooLong)?;
        self.modify(flash, |r| r.locations[n as usize - 1] = field)
    }

    /// Clear location `n`, or all three when `n` is 0
    pub fn clear_location<F: Flash + ?Sized>(&mut self, flash: &mut F, n: u8) -> Result<Change, FieldError> {
        match n {
            0 => self.modify(flash, |r| r.locations.iter_mut().for_each(|l| l.clear())),
            1..=3 => self.modify(flash, |r| r.locations[n as usize - 1].clear()),
            _ => Err(FieldError::InvalidLocation),
        }
    }

    pub fn set_status_led<F: Flash + ?Sized>(&mut self, flash: &mut F, value: u8) -> Result<Change, FieldError> {
        if value > STATUS_LED_WARN {
            return Err(FieldError::InvalidValue);
        }
        self.modify(flash, |r| r.status_led = value)
    }

    pub fn set_mqtt_server<F: Flash + ?Sized>(
        &mut self,
        flash: &mut F,
        host: &str,
        port: u16,
    ) -> Result<Change, FieldError> {
        if host.is_empty() || port == 0 || !is_printable(host) {
            return Err(FieldError::InvalidValue);
        }
        let server = to_field(host).ok_or(FieldError::InvalidValue)?;
        self.modify(flash, |r| {
            r.mqtt.server = server;
            r.mqtt.port = port as i32;
        })
    }

    /// Set temperature sensor `index`. The count grows to cover the entry.
    pub fn set_ds18b20<F: Flash + ?Sized>(
        &mut self,
        flash: &mut F,
        index: usize,
        id: &str,
        location: &str,
    ) -> Result<Change, FieldError> {
        if index >= DS18B20_MAX {
            return Err(FieldError::InvalidIndex);
        }
        if !is_ds18b20_id(id) {
            return Err(FieldError::InvalidValue);
        }
        check_location(location)?;
        let id = to_field(id).ok_or(FieldError::InvalidValue)?;
        let location = to_field(location).ok_or(FieldError::TooLong)?;
        self.modify(flash, |r| {
            r.ds18b20[index].id = id;
            r.ds18b20[index].location = location;
            r.ds18b20_count = r.ds18b20_count.max(index as u8 + 1);
        })
    }

    pub fn get_field(&self, name: &str) -> Result<String, FieldError> {
        let record = self.record().ok_or(FieldError::Internal(ConfigError::NotLoaded))?;
        match name {
            "keep_ap_active" => Ok(if record.keep_ap_active { "yes" } else { "no" }.to_string()),
            "loc1" | "loc2" | "loc3" => {
                let n = (name.as_bytes()[3] - b'1') as usize;
                Ok(record.locations[n].to_string())
            }
            "ds18b20s" => Ok(record.ds18b20_count.to_string()),
            "all" => Ok(hex_dump(&record.to_bytes())),
            _ => {
                if let Some(index) = parse_index(name, "ds18b20/", DS18B20_MAX) {
                    let entry = &record.ds18b20[index?];
                    return Ok(format!("{}:{}", entry.id, entry.location));
                }
                if let Some(index) = parse_index(name, "ads/", ADS_MAX) {
                    let ads = &record.ads[index?];
                    return Ok(format!(
                        "addr:0x{:02x} mux:{} gain:{} rate:{} cont:{} rms:{} period:{} samples:{} loc:{}",
                        ads.addr, ads.mux, ads.gain, ads.rate, ads.cont, ads.rms, ads.period, ads.samples,
                        ads.location
                    ));
                }
                Err(FieldError::InvalidField)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::record::RECORD_LEN;
    use crate::flash::{FlashError, MemFlash};
    use crate::layout::FlashLayout;

    fn loaded() -> (MemFlash, ConfigStore) {
        let layout = FlashLayout::default();
        let mut flash = MemFlash::new(layout.flash_size);
        let mut store = ConfigStore::init(&layout).unwrap();
        store.load(&mut flash).unwrap();
        (flash, store)
    }

    fn reload(flash: &mut MemFlash) -> ConfigStore {
        let mut store = ConfigStore::init(&FlashLayout::default()).unwrap();
        store.load(flash).unwrap();
        store
    }

    #[test]
    fn test_set_location_persists() {
        let (mut flash, mut store) = loaded();
        assert_eq!(store.set_location(&mut flash, 2, "garage").unwrap(), Change::Changed);
        assert_eq!(store.set_location(&mut flash, 2, "garage").unwrap(), Change::Unchanged);
        assert_eq!(reload(&mut flash).get_field("loc2").unwrap(), "garage");
    }

    #[test]
    fn test_set_location_rejections() {
        let (mut flash, mut store) = loaded();
        assert_eq!(store.set_location(&mut flash, 0, "x").unwrap_err().reason(), "invalid location");
        assert_eq!(store.set_location(&mut flash, 4, "x").unwrap_err().reason(), "invalid location");
        let long = "a".repeat(32);
        assert_eq!(
            store.set_location(&mut flash, 1, &long).unwrap_err().reason(),
            "location string too long"
        );
        assert_eq!(
            store.set_location(&mut flash, 1, "tab\there").unwrap_err().reason(),
            "invalid characters"
        );
        assert_eq!(store.set_location(&mut flash, 1, &"a".repeat(31)).unwrap(), Change::Changed);
    }

    #[test]
    fn test_clear_all_locations() {
        let (mut flash, mut store) = loaded();
        store.set_location(&mut flash, 1, "a").unwrap();
        store.set_location(&mut flash, 3, "c").unwrap();
        store.clear_location(&mut flash, 0).unwrap();
        let store = reload(&mut flash);
        for name in ["loc1", "loc2", "loc3"] {
            assert_eq!(store.get_field(name).unwrap(), "");
        }
    }

    #[test]
    fn test_status_led_responses() {
        let (mut flash, mut store) = loaded();
        assert_eq!(store.set_status_led(&mut flash, 2).unwrap().describe(2), "amended to 2");
        assert_eq!(store.set_status_led(&mut flash, 2).unwrap().describe(2), "no change");
        assert_eq!(store.set_status_led(&mut flash, 3), Err(FieldError::InvalidValue));
    }

    #[test]
    fn test_failed_save_reverts() {
        let (mut flash, mut store) = loaded();
        flash.fail_next_erase(5);
        let err = store.set_location(&mut flash, 1, "attic").unwrap_err();
        assert_eq!(err, FieldError::Internal(ConfigError::Flash(FlashError::Device { code: 5 })));
        assert_eq!(err.reason(), "internal error");
        assert_eq!(store.get_field("loc1").unwrap(), "");
    }

    #[test]
    fn test_station_without_commit_stays_in_memory() {
        let (mut flash, mut store) = loaded();
        let writes = flash.write_count();
        assert_eq!(store.set_station(&mut flash, "net", "secret99", false).unwrap(), Change::Changed);
        assert_eq!(flash.write_count(), writes);
        assert_eq!(store.record().unwrap().ssid.as_str(), "net");

        assert_eq!(store.set_station(&mut flash, "net", "secret99", true).unwrap(), Change::Unchanged);
        store.update(&mut flash).unwrap();
        assert_eq!(reload(&mut flash).record().unwrap().password.as_str(), "secret99");
    }

    #[test]
    fn test_station_length_limits() {
        let (mut flash, mut store) = loaded();
        let ssid = "s".repeat(33);
        assert_eq!(store.set_station(&mut flash, &ssid, "", true), Err(FieldError::InvalidValue));
        let password = "p".repeat(64);
        assert_eq!(store.set_station(&mut flash, "ok", &password, true), Err(FieldError::InvalidValue));
        assert!(store.set_station(&mut flash, &"s".repeat(32), &"p".repeat(63), true).is_ok());
    }

    #[test]
    fn test_ds18b20_fields() {
        let (mut flash, mut store) = loaded();
        assert_eq!(
            store.set_ds18b20(&mut flash, 2, "28-0000075a1c3d", "boiler").unwrap(),
            Change::Changed
        );
        assert_eq!(store.set_ds18b20(&mut flash, 0, "28-xyz", "x"), Err(FieldError::InvalidValue));
        assert_eq!(store.set_ds18b20(&mut flash, 8, "28-0000075a1c3d", "x"), Err(FieldError::InvalidIndex));

        let store = reload(&mut flash);
        assert_eq!(store.get_field("ds18b20s").unwrap(), "3");
        assert_eq!(store.get_field("ds18b20/2").unwrap(), "28-0000075a1c3d:boiler");
        assert_eq!(store.get_field("ds18b20/8"), Err(FieldError::InvalidIndex));
        assert_eq!(store.get_field("ds18b20/x"), Err(FieldError::InvalidIndex));
    }

    #[test]
    fn test_get_field_errors_and_dump() {
        let (mut flash, mut store) = loaded();
        store.set_keep_ap_active(&mut flash, true).unwrap();
        assert_eq!(store.get_field("keep_ap_active").unwrap(), "yes");
        assert_eq!(store.get_field("bogus").unwrap_err().reason(), "invalid field");
        assert_eq!(store.get_field("ads/4").unwrap_err().reason(), "invalid index");
        assert!(store.get_field("ads/0").unwrap().starts_with("addr:0x00"));

        let dump = store.get_field("all").unwrap();
        assert_eq!(dump.lines().count(), (RECORD_LEN + 15) / 16);
        assert!(dump.starts_with("0000: 63 c3 1e 3b"));
    }

    #[test]
    fn test_mqtt_server() {
        let (mut flash, mut store) = loaded();
        store.set_mqtt_server(&mut flash, "broker.local", 8883).unwrap();
        let store = reload(&mut flash);
        let mqtt = &store.record().unwrap().mqtt;
        assert_eq!((mqtt.server.as_str(), mqtt.port), ("broker.local", 8883));
    }
}
