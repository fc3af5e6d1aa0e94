//! # Configuration
//!
//! Hub and node configuration is a JSON document deserialized with
//! `serde-json-core` into fixed-capacity types. Deserialization only checks
//! shape; the accessors on each type validate values (addresses, keys,
//! property names) into the typed runtime values the rest of the crate uses.
//! Any error here is fatal at startup.

use embassy_net::{IpAddress, IpEndpoint, Ipv4Address};
use embassy_time::Duration;
use heapless::{LinearMap, String, Vec};
use serde::{Deserialize, Deserializer};

use crate::device::{Component, Device, LinkAddress, LinkKey, MAX_NAME_LEN, Property, SensorId};
use crate::sensors::bmp280::Bmp280Mode;
use crate::{MAX_DEVICES, MAX_PROPERTIES, MAX_SENSORS};

/// Capacity of the topic prefix. It doubles as the MQTT client id.
pub const MAX_PREFIX_LEN: usize = 32;

pub type PropertyName = String<16>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// The document is not valid JSON, misses a field or overflows a capacity.
    Malformed,
    /// A property other than temperature, humidity or pressure.
    UnknownProperty,
    InvalidAddress,
    /// Link keys are exactly 16 bytes.
    InvalidKey,
    /// The broker address is not an IPv4 address.
    InvalidServer,
    /// A sensor option is out of range for its driver.
    InvalidSensorOption,
}

fn from_json<'a, T: Deserialize<'a>>(json: &'a [u8]) -> Result<T, ConfigError> {
    match serde_json_core::from_slice::<T>(json) {
        Ok((value, _)) => Ok(value),
        Err(_) => {
            error!("config: document does not have the expected shape");
            Err(ConfigError::Malformed)
        }
    }
}

fn optional_key(key: &Option<String<32>>) -> Result<Option<LinkKey>, ConfigError> {
    match key {
        Some(key) if !key.is_empty() => LinkKey::parse(key).map(Some),
        _ => Ok(None),
    }
}

/// Durations are configured as (possibly fractional) seconds.
fn seconds<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let secs = f32::deserialize(deserializer)?;
    if secs < 0.0 {
        return Err(serde::de::Error::custom("negative duration"));
    }
    Ok(Duration::from_millis((secs * 1000.0) as u64))
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u16 {
    60
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub server: String<64>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String<{ crate::client::MAX_USERNAME_LEN }>>,
    #[serde(default)]
    pub password: Option<String<{ crate::client::MAX_PASSWORD_LEN }>>,
    /// Seconds between pings. Also the cadence of the device liveness sweep.
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,
}

impl MqttConfig {
    pub fn endpoint(&self) -> Result<IpEndpoint, ConfigError> {
        let address: Ipv4Address = self
            .server
            .parse()
            .map_err(|_| ConfigError::InvalidServer)?;
        Ok(IpEndpoint::new(IpAddress::Ipv4(address), self.port))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive as u64)
    }
}

/// One sensor node as described in the hub configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub address: String<24>,
    #[serde(default)]
    pub local_master_key: Option<String<32>>,
    #[serde(default)]
    pub manufacturer: String<MAX_NAME_LEN>,
    #[serde(default)]
    pub model: String<MAX_NAME_LEN>,
    pub name: String<MAX_NAME_LEN>,
    /// Seconds between two transmissions of the node.
    pub keepalive: u32,
    pub components: LinearMap<SensorId, Vec<PropertyName, MAX_PROPERTIES>, MAX_SENSORS>,
    #[serde(default)]
    pub send_signal_strength_threshold: Option<i16>,
}

impl DeviceConfig {
    pub fn to_device(&self) -> Result<Device, ConfigError> {
        let address = LinkAddress::parse(&self.address)?;
        let mut components = Vec::new();
        for (sensor_id, names) in self.components.iter() {
            let mut properties = Vec::new();
            for name in names {
                // Capacities match, so the push cannot fail.
                let _ = properties.push(Property::from_name(name)?);
            }
            let _ = components.push(Component {
                sensor_id: sensor_id.clone(),
                properties,
            });
        }
        Ok(Device {
            address,
            id: address.device_id(),
            name: self.name.clone(),
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            liveness_timeout: Device::liveness_timeout_for(self.keepalive),
            link_key: optional_key(&self.local_master_key)?,
            components,
            signal_threshold: self.send_signal_strength_threshold,
        })
    }
}

/// Hub configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    pub topic_prefix: String<MAX_PREFIX_LEN>,
    #[serde(default)]
    pub primary_master_key: Option<String<32>>,
    pub mqtt: MqttConfig,
    pub devices: Vec<DeviceConfig, MAX_DEVICES>,
}

impl HubConfig {
    pub fn from_json(json: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = from_json(json)?;
        if config.mqtt.keepalive == 0 {
            return Err(ConfigError::Malformed);
        }
        // Surface every value error now rather than on first use.
        config.mqtt.endpoint()?;
        config.primary_key()?;
        config.devices()?;
        Ok(config)
    }

    pub fn primary_key(&self) -> Result<Option<LinkKey>, ConfigError> {
        optional_key(&self.primary_master_key)
    }

    pub fn devices(&self) -> Result<Vec<Device, MAX_DEVICES>, ConfigError> {
        let mut devices = Vec::new();
        for config in &self.devices {
            let _ = devices.push(config.to_device()?);
        }
        Ok(devices)
    }
}

/// Thresholds deciding whether a property is worth transmitting.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SendConfig {
    /// Send when the value moved at least this much since the last send.
    #[serde(rename = "diff")]
    pub diff_threshold: f64,
    /// Send when nothing was sent for this long.
    #[serde(rename = "time", deserialize_with = "seconds")]
    pub time_threshold: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorKind {
    #[serde(rename = "AHT20")]
    Aht20,
    #[serde(rename = "BMP280")]
    Bmp280,
    #[serde(rename = "MS5803")]
    Ms5803,
}

/// One sensor attached to a node.
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    pub id: SensorId,
    #[serde(rename = "type")]
    pub kind: SensorKind,
    /// I2C address; each driver has its own default.
    #[serde(default)]
    pub address: Option<u8>,
    /// BMP280 oversampling preset.
    #[serde(default)]
    pub mode: Option<Bmp280Mode>,
    /// MS5803 oversampling ratios.
    #[serde(default)]
    pub pressure_resolution: Option<u16>,
    #[serde(default)]
    pub temperature_resolution: Option<u16>,
    #[serde(default)]
    pub send_configs: LinearMap<PropertyName, SendConfig, MAX_PROPERTIES>,
}

impl SensorConfig {
    pub fn send_configs(&self) -> Result<LinearMap<Property, SendConfig, MAX_PROPERTIES>, ConfigError> {
        let mut configs = LinearMap::new();
        for (name, config) in self.send_configs.iter() {
            let _ = configs.insert(Property::from_name(name)?, *config);
        }
        Ok(configs)
    }
}

/// Sensor node configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Power down between cycles instead of sleeping in place.
    #[serde(default)]
    pub deepsleep: bool,
    #[serde(deserialize_with = "seconds")]
    pub interval: Duration,
    pub hub_address: String<24>,
    #[serde(default)]
    pub primary_master_key: Option<String<32>>,
    #[serde(default)]
    pub local_master_key: Option<String<32>>,
    pub sensors: Vec<SensorConfig, MAX_SENSORS>,
}

impl NodeConfig {
    pub fn from_json(json: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = from_json(json)?;
        config.hub_address()?;
        config.primary_key()?;
        config.local_key()?;
        for sensor in &config.sensors {
            sensor.send_configs()?;
        }
        Ok(config)
    }

    pub fn hub_address(&self) -> Result<LinkAddress, ConfigError> {
        LinkAddress::parse(&self.hub_address)
    }

    pub fn primary_key(&self) -> Result<Option<LinkKey>, ConfigError> {
        optional_key(&self.primary_master_key)
    }

    pub fn local_key(&self) -> Result<Option<LinkKey>, ConfigError> {
        optional_key(&self.local_master_key)
    }
}
