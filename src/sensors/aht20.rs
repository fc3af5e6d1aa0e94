//! AHT20 humidity and temperature sensor.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

use super::{Reading, SensorError, bus_error, reading, round_to};
use crate::device::Property;

pub const DEFAULT_ADDRESS: u8 = 0x38;

const CMD_STATUS: u8 = 0x71;
const CMD_INIT: [u8; 3] = [0xBE, 0x08, 0x00];
const CMD_MEASURE: [u8; 3] = [0xAC, 0x33, 0x00];

const STATUS_BUSY: u8 = 0x80;
const STATUS_CALIBRATED: u8 = 0x08;

const SETUP_MS: u32 = 100;
const INIT_MS: u32 = 10;
const MEASURE_MS: u32 = 80;
const POLL_MS: u32 = 10;
const MAX_POLLS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aht20 {
    address: u8,
}

impl Aht20 {
    pub const fn new(address: u8) -> Self {
        Self { address }
    }

    async fn status<I: I2c>(&self, i2c: &mut I) -> Result<u8, SensorError> {
        let mut status = [0u8; 1];
        i2c.write(self.address, &[CMD_STATUS])
            .await
            .map_err(bus_error)?;
        i2c.read(self.address, &mut status)
            .await
            .map_err(bus_error)?;
        Ok(status[0])
    }

    /// Loads the factory calibration unless the chip reports it loaded.
    pub async fn initialize<I: I2c, D: DelayNs>(&mut self, i2c: &mut I, delay: &mut D) -> Result<(), SensorError> {
        delay.delay_ms(SETUP_MS).await;
        if self.status(i2c).await? & STATUS_CALIBRATED == 0 {
            debug!("aht20: loading calibration");
            i2c.write(self.address, &CMD_INIT)
                .await
                .map_err(bus_error)?;
            delay.delay_ms(INIT_MS).await;
        }
        Ok(())
    }

    /// Humidity in % and temperature in °C.
    pub async fn measure<I: I2c, D: DelayNs>(&mut self, i2c: &mut I, delay: &mut D) -> Result<Reading, SensorError> {
        i2c.write(self.address, &CMD_MEASURE)
            .await
            .map_err(bus_error)?;
        delay.delay_ms(MEASURE_MS).await;

        let mut polls = 0;
        while self.status(i2c).await? & STATUS_BUSY != 0 {
            polls += 1;
            if polls == MAX_POLLS {
                return Err(SensorError::NotReady);
            }
            delay.delay_ms(POLL_MS).await;
        }

        let mut data = [0u8; 6];
        i2c.read(self.address, &mut data)
            .await
            .map_err(bus_error)?;
        let (humidity, temperature) = decode(&data);
        Ok(reading(
            (Property::Humidity, humidity),
            (Property::Temperature, temperature),
        ))
    }
}

/// 20-bit humidity and temperature packed after the status byte.
fn decode(data: &[u8; 6]) -> (f64, f64) {
    let h = (data[1] as u32) << 12 | (data[2] as u32) << 4 | (data[3] as u32) >> 4;
    let t = ((data[3] & 0x0F) as u32) << 16 | (data[4] as u32) << 8 | data[5] as u32;
    let full_scale = (1u32 << 20) as f64;
    (
        round_to(h as f64 / full_scale * 100.0, 0),
        round_to(t as f64 / full_scale * 200.0 - 50.0, 1),
    )
}
