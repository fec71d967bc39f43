//! Device identity and the generic characteristic model.
//!
//! Every family codec translates its own wire layout into these types. Each
//! group in [`DeviceCharacteristics`] is independently optional: `None` means
//! "not read yet" or "not supported by this family", never zero.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Controller family, which selects the codec and wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFamily {
    /// Authenticated family with fixed attribute ids and little-endian fields.
    Bdc,
    /// Family that encodes characteristic id and node address into the attribute id.
    Zsc010,
    /// DALI-D4i family with memory-bank diagnostics.
    D4i,
}

impl DeviceFamily {
    /// Longest dim-step list the family can store.
    pub fn max_dim_steps(&self) -> usize {
        match self {
            DeviceFamily::Bdc | DeviceFamily::Zsc010 => 5,
            DeviceFamily::D4i => 8,
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFamily::Bdc => write!(f, "BDC"),
            DeviceFamily::Zsc010 => write!(f, "ZSC010"),
            DeviceFamily::D4i => write!(f, "D4i"),
        }
    }
}

impl std::str::FromStr for DeviceFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bdc" => Ok(DeviceFamily::Bdc),
            "zsc010" => Ok(DeviceFamily::Zsc010),
            "d4i" => Ok(DeviceFamily::D4i),
            other => Err(format!("unknown device family '{other}'")),
        }
    }
}

/// Identity record produced by the scanner. Never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: Uuid,
    /// Radio address, `AA:BB:CC:DD:EE:FF`.
    pub address: String,
    pub family: DeviceFamily,
    pub services: Vec<Uuid>,
    pub advertised_health: Option<u16>,
    pub advertised_state: Option<u16>,
    pub rssi: Option<i16>,
}

impl Device {
    pub fn new(id: Uuid, address: impl Into<String>, family: DeviceFamily) -> Self {
        Self {
            id,
            address: address.into(),
            family,
            services: Vec::new(),
            advertised_health: None,
            advertised_state: None,
            rssi: None,
        }
    }

    /// Radio address as six bytes, most significant first.
    pub fn address_bytes(&self) -> Option<[u8; 6]> {
        let mut out = [0u8; 6];
        let mut parts = self.address.split(':');
        for byte in out.iter_mut() {
            *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(out)
    }
}

/// Lamp operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperatingMode {
    Off,
    On,
    Dimming,
    Astro,
    Unknown(u8),
}

impl From<u8> for OperatingMode {
    fn from(v: u8) -> Self {
        match v {
            0 => OperatingMode::Off,
            1 => OperatingMode::On,
            2 => OperatingMode::Dimming,
            3 => OperatingMode::Astro,
            other => OperatingMode::Unknown(other),
        }
    }
}

impl From<OperatingMode> for u8 {
    fn from(m: OperatingMode) -> Self {
        match m {
            OperatingMode::Off => 0,
            OperatingMode::On => 1,
            OperatingMode::Dimming => 2,
            OperatingMode::Astro => 3,
            OperatingMode::Unknown(v) => v,
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Off => write!(f, "off"),
            OperatingMode::On => write!(f, "on"),
            OperatingMode::Dimming => write!(f, "dimming"),
            OperatingMode::Astro => write!(f, "astro"),
            OperatingMode::Unknown(v) => write!(f, "unknown({v})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct General {
    pub mode: OperatingMode,
}

/// One entry of a nightly dimming profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimStep {
    pub hour: u8,
    pub minute: u8,
    /// Light level in percent.
    pub level: u8,
}

impl DimStep {
    pub fn new(hour: u8, minute: u8, level: u8) -> Self {
        Self {
            hour,
            minute,
            level,
        }
    }
}

/// Calendar date carried by a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

/// Versioned dimming schedule (ZSC010 only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub version: u8,
    pub start: ScheduleDate,
    /// Weekday mask, bit 0 = Monday .. bit 6 = Sunday.
    pub recurrence: u8,
    pub steps: Vec<DimStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dim {
    pub preset: Option<u8>,
    pub steps: Vec<DimStep>,
    pub level: Option<u8>,
    pub schedule: Option<ScheduleEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dali {
    /// Constant light output enabled.
    pub clo: bool,
    pub power_level: Option<u16>,
    pub available_power_levels: Vec<u16>,
    pub fixture_name: Option<String>,
    pub fade_time: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Time {
    /// Seconds since the Unix epoch.
    pub utc: u32,
    pub timezone_minutes: i16,
    pub midnight_offset_minutes: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gps {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Family-specific status bitfield.
    pub status: u32,
    pub health: Option<u16>,
    pub state: Option<u16>,
    pub firmware_version: Option<String>,
    pub library_version: Option<String>,
}

/// Decoded memory-bank field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BankValue {
    Unsigned(u64),
    Signed(i8),
    Bool(bool),
    Text(String),
}

impl fmt::Display for BankValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BankValue::Unsigned(v) => write!(f, "{v}"),
            BankValue::Signed(v) => write!(f, "{v}"),
            BankValue::Bool(v) => write!(f, "{v}"),
            BankValue::Text(v) => write!(f, "{v}"),
        }
    }
}

/// Field offset -> value for one bank.
pub type DaliBank = BTreeMap<u8, BankValue>;
/// Bank id -> bank contents.
pub type DaliBanks = BTreeMap<u8, DaliBank>;

/// Aggregate of everything read from a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCharacteristics {
    pub general: Option<General>,
    pub dim: Option<Dim>,
    pub dali: Option<Dali>,
    pub time: Option<Time>,
    pub gps: Option<Gps>,
    pub diagnostics: Option<Diagnostics>,
    pub dali_banks: Option<DaliBanks>,
}

impl DeviceCharacteristics {
    pub fn is_empty(&self) -> bool {
        self.general.is_none()
            && self.dim.is_none()
            && self.dali.is_none()
            && self.time.is_none()
            && self.gps.is_none()
            && self.diagnostics.is_none()
            && self.dali_banks.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_bytes() {
        let device = Device::new(Uuid::nil(), "C4:7F:51:0A:1B:2C", DeviceFamily::Zsc010);
        assert_eq!(
            device.address_bytes(),
            Some([0xC4, 0x7F, 0x51, 0x0A, 0x1B, 0x2C])
        );

        let bad = Device::new(Uuid::nil(), "C4:7F:51", DeviceFamily::Zsc010);
        assert_eq!(bad.address_bytes(), None);
    }

    #[test]
    fn test_mode_conversion() {
        assert_eq!(OperatingMode::from(3), OperatingMode::Astro);
        assert_eq!(u8::from(OperatingMode::Unknown(9)), 9);
    }

    #[test]
    fn test_family_parse() {
        assert_eq!("ZSC010".parse::<DeviceFamily>(), Ok(DeviceFamily::Zsc010));
        assert!("xyz".parse::<DeviceFamily>().is_err());
    }

    #[test]
    fn test_empty_characteristics() {
        let mut chars = DeviceCharacteristics::default();
        assert!(chars.is_empty());
        chars.time = Some(Time {
            utc: 0,
            timezone_minutes: 60,
            midnight_offset_minutes: 0,
        });
        assert!(!chars.is_empty());
    }
}
