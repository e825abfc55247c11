// Configuration record: typed fields plus the fixed little-endian layout stored in flash.
//
// Strings are NUL-terminated inside fixed-size fields. Pad bytes must be zero. Decoding repairs
// anything out of range the same way every time, so a repaired record encodes canonically.

use heapless::String;
use log::{info, warn};
use serde::{Deserialize, Serialize};

pub const CONFIG_MAGIC: u32 = 0x3B1E_C363;
pub const CONFIG_VERSION: u16 = 1;

pub const RECORD_LEN: usize = 948;
/// Records written before the ip block and httpd flag existed
pub const LEGACY_LEN: usize = 888;
pub const CHECKSUM_OFFSET: usize = 6;

pub const SSID_FIELD: usize = 33;
pub const PASSWORD_FIELD: usize = 64;
pub const LOCATION_FIELD: usize = 32;
pub const DS18B20_ID_FIELD: usize = 16;
pub const MQTT_FIELD: usize = 32;
pub const DOMAIN_FIELD: usize = 32;

pub const DS18B20_MAX: usize = 8;
pub const ADS_MAX: usize = 4;
pub const GPIO_PINS: usize = 17;

pub const MQTT_DEFAULT_PORT: i32 = 1883;

pub const STATUS_LED_NORMAL: u8 = 0;
pub const STATUS_LED_OFF: u8 = 1;
pub const STATUS_LED_WARN: u8 = 2;

/// Valid I2C addresses for an ADS1115-family converter (0 = unused)
pub const ADS_ADDRESSES: [u8; 4] = [0x48, 0x49, 0x4A, 0x4B];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ds18b20Entry {
    /// e.g. `28-02157166b0ff`, empty when unused
    pub id: String<15>,
    pub location: String<31>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    pub server: String<31>,
    pub port: i32,
    pub user: String<31>,
    pub pass: String<31>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: MQTT_DEFAULT_PORT,
            user: String::new(),
            pass: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdsConfig {
    pub location: String<31>,
    pub addr: u8,
    pub index: u8,
    pub mux: u8,
    pub gain: u8,
    pub rate: u8,
    pub cont: u8,
    pub rms: u8,
    pub period: u16,
    pub samples: u16,
}

impl AdsConfig {
    /// Unused entry at `index` with the converter's power-on settings
    pub fn unused(index: u8) -> Self {
        Self {
            location: String::new(),
            addr: 0,
            index,
            mux: 0b000,
            gain: 0b010,
            rate: 0b100,
            cont: 0,
            rms: 0,
            period: 0,
            samples: 0,
        }
    }

    fn is_valid(&self, index: usize) -> bool {
        (self.addr == 0 || ADS_ADDRESSES.contains(&self.addr))
            && self.index as usize == index
            && self.mux <= 7
            && self.gain <= 7
            && self.rate <= 7
            && self.cont <= 1
            && self.rms <= 1
            && self.period < 0xFFFF
            && self.samples < 1024
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpConfig {
    /// false = DHCP
    pub manual: bool,
    pub ipv4: [u8; 4],
    pub subnet: [u8; 4],
    pub gateway: [u8; 4],
    pub dns1: [u8; 4],
    pub dns2: [u8; 4],
    pub domain_name: String<31>,
}

impl IpConfig {
    /// Manual addressing needs a usable address and mask; DNS may be unset but not broadcast
    pub fn manual_is_valid(&self) -> bool {
        let all = |ip: &[u8; 4], v: u8| ip.iter().all(|b| *b == v);
        let mask = u32::from_be_bytes(self.subnet);
        let contiguous = mask != 0 && (!mask).wrapping_add(1) & !mask == 0;
        !all(&self.ipv4, 0)
            && !all(&self.ipv4, 0xFF)
            && contiguous
            && !all(&self.dns1, 0xFF)
            && !all(&self.dns2, 0xFF)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub version: u16,
    pub ssid: String<32>,
    pub keep_ap_active: bool,
    pub ds18b20_count: u8,
    pub password: String<63>,
    pub ds18b20: [Ds18b20Entry; DS18B20_MAX],
    pub locations: [String<31>; 3],
    pub mqtt: MqttConfig,
    pub ads_count: u8,
    pub ads: [AdsConfig; ADS_MAX],
    pub gpio_boot_state: [u8; GPIO_PINS],
    pub status_led: u8,
    pub ip: IpConfig,
    pub mqtt_httpd: bool,
}

impl Default for ConfigRecord {
    fn default() -> Self {
        // Station credentials come from wifi_config.h at build time (see build.rs)
        let wifi_ssid = env!("WIFI_SSID");
        let wifi_password = env!("WIFI_PASSWORD");

        info!(
            "Config default: SSID='{}', Password={}",
            wifi_ssid,
            if wifi_password.is_empty() { "<empty>" } else { "<set>" }
        );

        let (ssid, password) = match (to_field(wifi_ssid), to_field(wifi_password)) {
            (Some(ssid), Some(password)) => (ssid, password),
            _ => {
                warn!("Build-time WiFi credentials too long, ignoring");
                (String::new(), String::new())
            }
        };

        Self {
            version: CONFIG_VERSION,
            ssid,
            keep_ap_active: false,
            ds18b20_count: 0,
            password,
            ds18b20: Default::default(),
            locations: Default::default(),
            mqtt: MqttConfig::default(),
            ads_count: 0,
            ads: std::array::from_fn(|i| AdsConfig::unused(i as u8)),
            gpio_boot_state: [0; GPIO_PINS],
            status_led: STATUS_LED_NORMAL,
            ip: IpConfig::default(),
            mqtt_httpd: false,
        }
    }
}

/// Copy `s` into a bounded string, None if it does not fit
pub fn to_field<const N: usize>(s: &str) -> Option<String<N>> {
    let mut out = String::new();
    out.push_str(s).ok()?;
    Some(out)
}

/// Wrapping byte sum of `raw[..len]`, skipping the checksum field itself
pub fn checksum(raw: &[u8], len: usize) -> u16 {
    raw[..len.min(raw.len())]
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != CHECKSUM_OFFSET && *i != CHECKSUM_OFFSET + 1)
        .fold(0u16, |acc, (_, b)| acc.wrapping_add(*b as u16))
}

pub fn stored_checksum(raw: &[u8]) -> u16 {
    u16::from_le_bytes([raw[CHECKSUM_OFFSET], raw[CHECKSUM_OFFSET + 1]])
}

pub fn stored_magic(raw: &[u8]) -> u32 {
    u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
}

pub fn stored_version(raw: &[u8]) -> u16 {
    u16::from_le_bytes([raw[4], raw[5]])
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn pad(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    /// String plus zero fill to `field` bytes (always leaves room for the NUL)
    fn str(&mut self, s: &str, field: usize) {
        self.bytes(s.as_bytes());
        self.pad(field - s.len());
    }
}

struct Reader<'a> {
    raw: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        let out = &self.raw[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    fn u16(&mut self) -> u16 {
        let b = self.take(2);
        u16::from_le_bytes([b[0], b[1]])
    }

    fn i32(&mut self) -> i32 {
        let b = self.take(4);
        i32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    fn ip(&mut self) -> [u8; 4] {
        let b = self.take(4);
        [b[0], b[1], b[2], b[3]]
    }

    /// True when every pad byte is zero
    fn pad(&mut self, n: usize) -> bool {
        self.take(n).iter().all(|b| *b == 0)
    }

    /// NUL-terminated string in a `field`-byte slot. None if unterminated or not UTF-8.
    fn str<const N: usize>(&mut self, field: usize) -> Option<String<N>> {
        let raw = self.take(field);
        let end = raw.iter().position(|b| *b == 0)?;
        let text = std::str::from_utf8(&raw[..end]).ok()?;
        to_field(text)
    }

    fn str_or_clear<const N: usize>(
        &mut self,
        field: usize,
        repairs: &mut Vec<&'static str>,
        what: &'static str,
    ) -> String<N> {
        self.str(field).unwrap_or_else(|| {
            repairs.push(what);
            String::new()
        })
    }
}

impl ConfigRecord {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer { buf: Vec::with_capacity(RECORD_LEN) };
        w.bytes(&CONFIG_MAGIC.to_le_bytes());
        w.u16(self.version);
        w.u16(0);
        w.str(&self.ssid, SSID_FIELD);
        w.u8(self.keep_ap_active as u8);
        w.u8(self.ds18b20_count);
        w.pad(1);
        w.str(&self.password, PASSWORD_FIELD);
        for entry in &self.ds18b20 {
            w.str(&entry.id, DS18B20_ID_FIELD);
            w.str(&entry.location, LOCATION_FIELD);
        }
        for loc in &self.locations {
            w.str(loc, LOCATION_FIELD);
        }
        w.str(&self.mqtt.server, MQTT_FIELD);
        w.bytes(&self.mqtt.port.to_le_bytes());
        w.str(&self.mqtt.user, MQTT_FIELD);
        w.str(&self.mqtt.pass, MQTT_FIELD);
        w.u8(self.ads_count);
        w.pad(3);
        for ads in &self.ads {
            w.str(&ads.location, LOCATION_FIELD);
            w.bytes(&[ads.addr, ads.index, ads.mux, ads.gain, ads.rate, ads.cont, ads.rms, 0]);
            w.u16(ads.period);
            w.u16(ads.samples);
        }
        w.bytes(&self.gpio_boot_state);
        w.u8(self.status_led);
        w.pad(2);
        w.u8(self.ip.manual as u8);
        w.pad(3);
        for addr in [&self.ip.ipv4, &self.ip.subnet, &self.ip.gateway, &self.ip.dns1, &self.ip.dns2] {
            w.bytes(addr);
        }
        w.str(&self.ip.domain_name, DOMAIN_FIELD);
        w.u8(self.mqtt_httpd as u8);
        w.pad(3);

        let sum = checksum(&w.buf, RECORD_LEN);
        w.buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&sum.to_le_bytes());
        w.buf
    }

    /// Decode a record whose header and checksum were already verified. Returns the record and
    /// the list of repairs applied to out-of-range fields.
    pub fn from_bytes(raw: &[u8; RECORD_LEN]) -> (Self, Vec<&'static str>) {
        let mut repairs = Vec::new();
        let mut r = Reader { raw, pos: 4 };
        let version = r.u16();
        let _checksum = r.u16();

        let ssid = r.str::<32>(SSID_FIELD);
        let keep_ap = r.u8();
        let mut ds18b20_count = r.u8();
        if !r.pad(1) {
            repairs.push("pad1 not zero");
        }
        let password = r.str::<63>(PASSWORD_FIELD);
        let (ssid, password) = match (ssid, password) {
            (Some(ssid), Some(password)) => (ssid, password),
            // clear both so a half-written credential pair is never used
            _ => {
                repairs.push("ssid or password not terminated");
                (String::new(), String::new())
            }
        };
        if keep_ap > 1 {
            repairs.push("keep_ap_active invalid");
        }

        let mut ds18b20: [Ds18b20Entry; DS18B20_MAX] = Default::default();
        for entry in ds18b20.iter_mut() {
            let id = r.str::<15>(DS18B20_ID_FIELD);
            let location = r.str::<31>(LOCATION_FIELD);
            match (id, location) {
                (Some(id), Some(location)) if id.is_empty() || id.len() == 15 => {
                    *entry = Ds18b20Entry { id, location };
                }
                _ => repairs.push("ds18b20 id or location invalid"),
            }
        }
        if ds18b20_count as usize > DS18B20_MAX {
            repairs.push("ds18b20 count invalid");
            ds18b20_count = 0;
            ds18b20 = Default::default();
        }

        let loc1 = r.str::<31>(LOCATION_FIELD);
        let loc2 = r.str::<31>(LOCATION_FIELD);
        let loc3 = r.str::<31>(LOCATION_FIELD);
        let locations = match (loc1, loc2, loc3) {
            (Some(a), Some(b), Some(c)) => [a, b, c],
            _ => {
                repairs.push("location invalid");
                Default::default()
            }
        };

        let server = r.str_or_clear(MQTT_FIELD, &mut repairs, "mqtt server invalid");
        let port = r.i32();
        let user = r.str_or_clear(MQTT_FIELD, &mut repairs, "mqtt user invalid");
        let pass = r.str_or_clear(MQTT_FIELD, &mut repairs, "mqtt pass invalid");
        let mqtt = MqttConfig { server, port, user, pass };

        let mut ads_count = r.u8();
        if !r.pad(3) {
            repairs.push("pad2 not zero");
        }
        let mut ads: [AdsConfig; ADS_MAX] = std::array::from_fn(|i| AdsConfig::unused(i as u8));
        let mut ads_ok = [true; ADS_MAX];
        for (i, entry) in ads.iter_mut().enumerate() {
            let location = r.str::<31>(LOCATION_FIELD);
            let b = r.take(8);
            let period = r.u16();
            let samples = r.u16();
            let parsed = AdsConfig {
                location: location.clone().unwrap_or_default(),
                addr: b[0],
                index: b[1],
                mux: b[2],
                gain: b[3],
                rate: b[4],
                cont: b[5],
                rms: b[6],
                period,
                samples,
            };
            ads_ok[i] = location.is_some() && b[7] == 0 && parsed.is_valid(i);
            *entry = parsed;
        }
        let in_use = ads.iter().filter(|a| a.addr != 0).count();
        if ads_count as usize > ADS_MAX || in_use != ads_count as usize {
            repairs.push("ads count invalid");
            ads_count = 0;
            ads = std::array::from_fn(|i| AdsConfig::unused(i as u8));
        } else {
            for (i, entry) in ads.iter_mut().enumerate() {
                if !ads_ok[i] {
                    repairs.push("ads entry invalid");
                    *entry = AdsConfig::unused(i as u8);
                }
            }
        }

        let mut gpio_boot_state = [0u8; GPIO_PINS];
        gpio_boot_state.copy_from_slice(r.take(GPIO_PINS));
        for state in gpio_boot_state.iter_mut() {
            if *state > 1 {
                repairs.push("gpio boot state invalid");
                *state = 0;
            }
        }
        let mut status_led = r.u8();
        if status_led > STATUS_LED_WARN {
            repairs.push("status led invalid");
            status_led = STATUS_LED_NORMAL;
        }
        if !r.pad(2) {
            repairs.push("pad3 not zero");
        }

        let manual = r.u8();
        let ip_pad_ok = r.pad(3);
        let ip = IpConfig {
            manual: manual == 1,
            ipv4: r.ip(),
            subnet: r.ip(),
            gateway: r.ip(),
            dns1: r.ip(),
            dns2: r.ip(),
            domain_name: String::new(),
        };
        let domain = r.str::<31>(DOMAIN_FIELD);
        let ip = match domain {
            Some(domain_name)
                if manual <= 1 && ip_pad_ok && (!ip.manual || ip.manual_is_valid()) =>
            {
                IpConfig { domain_name, ..ip }
            }
            _ => {
                repairs.push("ip configuration invalid");
                IpConfig::default()
            }
        };

        let httpd = r.u8();
        if httpd > 1 {
            repairs.push("mqtt httpd invalid");
        }
        if !r.pad(3) {
            repairs.push("pad4 not zero");
        }

        let record = Self {
            version,
            ssid,
            keep_ap_active: keep_ap == 1,
            ds18b20_count,
            password,
            ds18b20,
            locations,
            mqtt,
            ads_count,
            ads,
            gpio_boot_state,
            status_led,
            ip,
            mqtt_httpd: httpd == 1,
        };
        (record, repairs)
    }
}
