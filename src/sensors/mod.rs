//! # Sensors
//!
//! I²C sensor drivers for the node, as one closed [`Sensor`] enum. Drivers
//! own no bus: the node passes its bus, delay and store into every call, so
//! several sensors can share one I²C peripheral.
//!
//! Calibration coefficients of the pressure sensors are read from the chip
//! once and cached in the key-value store under `(sensor_id, "calibration")`
//! so later wake-ups skip the bus transfer.

pub mod aht20;
pub mod bmp280;
pub mod ms5803;

use core::fmt::Write;

use embedded_hal::i2c::ErrorKind;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use heapless::{LinearMap, String};

use crate::MAX_PROPERTIES;
use crate::config::{ConfigError, SensorConfig, SensorKind};
use crate::device::{Property, SensorId};
use crate::storage::KeyValueStore;

pub use aht20::Aht20;
pub use bmp280::{Bmp280, Bmp280Mode};
pub use ms5803::Ms5803;

/// One measurement of one sensor.
pub type Reading = LinearMap<Property, f64, MAX_PROPERTIES>;

const CALIBRATION_KEY: &str = "calibration";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    /// An I²C transfer failed.
    Bus,
    /// The chip did not finish a conversion in time.
    NotReady,
    /// The chip returned a value that cannot be a measurement.
    InvalidReading,
}

/// Maps a failed transfer to [`SensorError::Bus`]. A missing acknowledge
/// usually means the chip is absent or unpowered.
pub(crate) fn bus_error<E: embedded_hal::i2c::Error>(error: E) -> SensorError {
    match error.kind() {
        ErrorKind::NoAcknowledge(_) => warn!("i2c: no acknowledge"),
        kind => debug!("i2c: {}", kind),
    }
    SensorError::Bus
}

/// Rounds to `decimals` places using the exact decimal expansion of `value`.
pub fn round_to(value: f64, decimals: usize) -> f64 {
    let mut text = String::<48>::new();
    if write!(text, "{:.*}", decimals, value).is_err() {
        return value;
    }
    text.parse().unwrap_or(value)
}

/// Loads cached calibration coefficients. Anything unreadable counts as
/// not cached.
fn load_calibration<S: KeyValueStore, const N: usize>(store: &mut S, sensor_id: &str) -> Option<[i32; N]> {
    let mut buf = [0u8; crate::storage::MAX_VALUE_LEN];
    let len = match store.read(sensor_id, CALIBRATION_KEY, &mut buf) {
        Ok(Some(len)) => len,
        Ok(None) => return None,
        Err(_) => {
            warn!("sensor {}: calibration cache unreadable", sensor_id);
            return None;
        }
    };
    let text = core::str::from_utf8(&buf[..len]).ok()?;
    let mut coefficients = [0i32; N];
    let mut fields = text.trim().split(',');
    for slot in coefficients.iter_mut() {
        *slot = fields.next()?.trim().parse().ok()?;
    }
    if fields.next().is_some() {
        return None;
    }
    Some(coefficients)
}

fn store_calibration<S: KeyValueStore>(store: &mut S, sensor_id: &str, coefficients: &[i32]) {
    let mut text = String::<{ crate::storage::MAX_VALUE_LEN }>::new();
    for (i, c) in coefficients.iter().enumerate() {
        let sep = if i == 0 { "" } else { "," };
        if write!(text, "{}{}", sep, c).is_err() {
            return;
        }
    }
    if store
        .write(sensor_id, CALIBRATION_KEY, text.as_bytes())
        .is_err()
    {
        warn!("sensor {}: cannot cache calibration", sensor_id);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Driver {
    Aht20(Aht20),
    Bmp280(Bmp280),
    Ms5803(Ms5803),
}

/// A configured sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Sensor {
    id: SensorId,
    driver: Driver,
}

impl Sensor {
    pub fn from_config(config: &SensorConfig) -> Result<Self, ConfigError> {
        let driver = match config.kind {
            SensorKind::Aht20 => Driver::Aht20(Aht20::new(config.address.unwrap_or(aht20::DEFAULT_ADDRESS))),
            SensorKind::Bmp280 => Driver::Bmp280(Bmp280::new(
                config.address.unwrap_or(bmp280::DEFAULT_ADDRESS),
                config.mode.unwrap_or_default(),
            )),
            SensorKind::Ms5803 => Driver::Ms5803(Ms5803::new(
                config.address.unwrap_or(ms5803::DEFAULT_ADDRESS),
                config.pressure_resolution.unwrap_or(ms5803::DEFAULT_PRESSURE_RESOLUTION),
                config.temperature_resolution.unwrap_or(ms5803::DEFAULT_TEMPERATURE_RESOLUTION),
            )?),
        };
        Ok(Self {
            id: config.id.clone(),
            driver,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Brings the chip into a measurable state. `power_on` is true after a
    /// power-on reset, when chip registers have to be set up again.
    pub async fn prepare<I, D, S>(
        &mut self,
        i2c: &mut I,
        delay: &mut D,
        store: &mut S,
        power_on: bool,
    ) -> Result<(), SensorError>
    where
        I: I2c,
        D: DelayNs,
        S: KeyValueStore,
    {
        match &mut self.driver {
            Driver::Aht20(chip) if power_on => chip.initialize(i2c, delay).await,
            Driver::Aht20(_) => Ok(()),
            Driver::Bmp280(chip) => {
                if power_on {
                    chip.initialize(i2c).await?;
                }
                chip.calibrate(i2c, store, &self.id).await
            }
            Driver::Ms5803(chip) => chip.calibrate(i2c, store, &self.id).await,
        }
    }

    pub async fn read<I, D>(&mut self, i2c: &mut I, delay: &mut D) -> Result<Reading, SensorError>
    where
        I: I2c,
        D: DelayNs,
    {
        let reading = match &mut self.driver {
            Driver::Aht20(chip) => chip.measure(i2c, delay).await,
            Driver::Bmp280(chip) => chip.measure(i2c, delay).await,
            Driver::Ms5803(chip) => chip.measure(i2c, delay).await,
        };
        if reading.is_err() {
            error!("sensor {}: measurement failed", self.id.as_str());
        }
        reading
    }
}

/// Reading with two properties.
fn reading(first: (Property, f64), second: (Property, f64)) -> Reading {
    let mut reading = Reading::new();
    // Two entries always fit.
    let _ = reading.insert(first.0, first.1);
    let _ = reading.insert(second.0, second.1);
    reading
}
