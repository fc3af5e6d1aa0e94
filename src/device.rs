//! Device identity and the static description of what each device exposes.

use core::fmt::Write;

use embassy_time::Duration;
use heapless::{String, Vec};

use crate::config::ConfigError;

/// Capacity of a sensor identifier (also the storage namespace on nodes).
pub const MAX_SENSOR_ID_LEN: usize = 15;
/// Capacity of device names, manufacturers and models.
pub const MAX_NAME_LEN: usize = 32;

pub type SensorId = String<MAX_SENSOR_ID_LEN>;

/// Lowercase hex of the link address, no separators.
pub type DeviceId = String<12>;

/// 6-byte radio link address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkAddress(pub [u8; 6]);

impl LinkAddress {
    /// Parses `aa:bb:cc:dd:ee:ff` or `aabbccddeeff`, in either case.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let mut bytes = [0u8; 6];
        let mut digits = s.bytes().filter(|b| *b != b':');
        for byte in bytes.iter_mut() {
            let hi = digits.next().and_then(hex_value);
            let lo = digits.next().and_then(hex_value);
            match (hi, lo) {
                (Some(hi), Some(lo)) => *byte = hi << 4 | lo,
                _ => return Err(ConfigError::InvalidAddress),
            }
        }
        if digits.next().is_some() {
            return Err(ConfigError::InvalidAddress);
        }
        Ok(Self(bytes))
    }

    pub fn device_id(&self) -> DeviceId {
        let mut id = DeviceId::new();
        for b in self.0 {
            // 6 bytes always fit in 12 hex digits.
            let _ = write!(id, "{:02x}", b);
        }
        id
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// 16-byte radio link key (primary or per-peer).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LinkKey(pub [u8; 16]);

impl LinkKey {
    /// Keys are configured as 16-character strings.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let bytes: [u8; 16] = s
            .as_bytes()
            .try_into()
            .map_err(|_| ConfigError::InvalidKey)?;
        Ok(Self(bytes))
    }
}

impl core::fmt::Debug for LinkKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("LinkKey(..)")
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for LinkKey {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "LinkKey(..)")
    }
}

/// The measured quantities the hub knows how to describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Property {
    Temperature,
    Humidity,
    Pressure,
}

impl Property {
    pub fn from_name(name: &str) -> Result<Self, ConfigError> {
        match name {
            "temperature" => Ok(Property::Temperature),
            "humidity" => Ok(Property::Humidity),
            "pressure" => Ok(Property::Pressure),
            _ => Err(ConfigError::UnknownProperty),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Property::Temperature => "temperature",
            Property::Humidity => "humidity",
            Property::Pressure => "pressure",
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            Property::Temperature => "°C",
            Property::Humidity => "%",
            Property::Pressure => "bar",
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Property::Temperature => "mdi:thermometer",
            Property::Humidity => "mdi:water-percent",
            Property::Pressure => "mdi:speedometer",
        }
    }
}

/// One sensor on a device and the properties the hub forwards for it.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub sensor_id: SensorId,
    pub properties: Vec<Property, { crate::MAX_PROPERTIES }>,
}

/// A sensor node as known to the hub. Built once from configuration.
#[derive(Debug, Clone)]
pub struct Device {
    pub address: LinkAddress,
    pub id: DeviceId,
    pub name: String<MAX_NAME_LEN>,
    pub manufacturer: String<MAX_NAME_LEN>,
    pub model: String<MAX_NAME_LEN>,
    /// Advertised keepalive with a 50% margin.
    pub liveness_timeout: Duration,
    pub link_key: Option<LinkKey>,
    pub components: Vec<Component, { crate::MAX_SENSORS }>,
    /// Report the signal strength when it is at or below this many dBm.
    pub signal_threshold: Option<i16>,
}

impl Device {
    /// Liveness timeout for a node that reports every `keepalive_secs`.
    pub fn liveness_timeout_for(keepalive_secs: u32) -> Duration {
        Duration::from_millis(keepalive_secs as u64 * 1500)
    }

    /// The declared property named `property` of sensor `sensor_id`, if any.
    pub fn exposed(&self, sensor_id: &str, property: &str) -> Option<Property> {
        self.components
            .iter()
            .find(|c| c.sensor_id == sensor_id)?
            .properties
            .iter()
            .copied()
            .find(|p| p.as_str() == property)
    }

    /// Iterates every declared `(sensor_id, property)` pair.
    pub fn entities(&self) -> impl Iterator<Item = (&str, Property)> {
        self.components.iter().flat_map(|c| {
            c.properties
                .iter()
                .map(move |p| (c.sensor_id.as_str(), *p))
        })
    }

    /// Whether a reading at `rssi` should be reported alongside the data.
    pub fn reports_signal(&self, rssi: i16) -> bool {
        self.signal_threshold.is_some_and(|threshold| rssi <= threshold)
    }
}
