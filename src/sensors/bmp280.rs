//! BMP280 pressure and temperature sensor, in forced mode.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use serde::Deserialize;

use super::{Reading, SensorError, bus_error, load_calibration, reading, round_to, store_calibration};
use crate::device::Property;
use crate::storage::KeyValueStore;

pub const DEFAULT_ADDRESS: u8 = 0x77;

const REG_CALIBRATION: u8 = 0x88;
const REG_CTRL_MEAS: u8 = 0xF4;
const REG_CONFIG: u8 = 0xF5;
const REG_DATA: u8 = 0xF7;

/// No standby, no IIR filter.
const CONFIG: u8 = 0x00;

/// `dig_T1..dig_T3, dig_P1..dig_P9`.
type Calibration = [i32; 12];

/// Oversampling preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "kebab-case")]
pub enum Bmp280Mode {
    #[default]
    UltraLowPower,
    LowPower,
    StandardResolution,
    HighResolution,
    UltraHighResolution,
}

impl Bmp280Mode {
    /// `ctrl_meas` value: temperature and pressure oversampling, forced mode.
    fn ctrl_meas(self) -> u8 {
        match self {
            Bmp280Mode::UltraLowPower => 0x25,
            Bmp280Mode::LowPower => 0x29,
            Bmp280Mode::StandardResolution => 0x2D,
            Bmp280Mode::HighResolution => 0x31,
            Bmp280Mode::UltraHighResolution => 0x55,
        }
    }

    /// Maximum conversion time in microseconds.
    fn conversion_us(self) -> u32 {
        match self {
            Bmp280Mode::UltraLowPower => 6_400,
            Bmp280Mode::LowPower => 8_700,
            Bmp280Mode::StandardResolution => 13_300,
            Bmp280Mode::HighResolution => 22_500,
            Bmp280Mode::UltraHighResolution => 43_200,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bmp280 {
    address: u8,
    mode: Bmp280Mode,
    calibration: Option<Calibration>,
}

impl Bmp280 {
    pub const fn new(address: u8, mode: Bmp280Mode) -> Self {
        Self {
            address,
            mode,
            calibration: None,
        }
    }

    pub async fn initialize<I: I2c>(&mut self, i2c: &mut I) -> Result<(), SensorError> {
        i2c.write(self.address, &[REG_CONFIG, CONFIG])
            .await
            .map_err(bus_error)
    }

    /// Loads the calibration from the store, or from the chip on a cache miss.
    pub async fn calibrate<I: I2c, S: KeyValueStore>(
        &mut self,
        i2c: &mut I,
        store: &mut S,
        sensor_id: &str,
    ) -> Result<(), SensorError> {
        if let Some(calibration) = load_calibration(store, sensor_id) {
            self.calibration = Some(calibration);
            return Ok(());
        }
        let mut raw = [0u8; 24];
        i2c.write_read(self.address, &[REG_CALIBRATION], &mut raw)
            .await
            .map_err(bus_error)?;
        let calibration = parse_calibration(&raw);
        store_calibration(store, sensor_id, &calibration);
        self.calibration = Some(calibration);
        Ok(())
    }

    /// Pressure in bar and temperature in °C.
    pub async fn measure<I: I2c, D: DelayNs>(&mut self, i2c: &mut I, delay: &mut D) -> Result<Reading, SensorError> {
        let calibration = self.calibration.ok_or(SensorError::InvalidReading)?;
        i2c.write(self.address, &[REG_CTRL_MEAS, self.mode.ctrl_meas()])
            .await
            .map_err(bus_error)?;
        delay.delay_us(self.mode.conversion_us()).await;

        let mut data = [0u8; 6];
        i2c.write_read(self.address, &[REG_DATA], &mut data)
            .await
            .map_err(bus_error)?;
        let adc_p = ((data[0] as u32) << 16 | (data[1] as u32) << 8 | data[2] as u32) >> 4;
        let adc_t = ((data[3] as u32) << 16 | (data[4] as u32) << 8 | data[5] as u32) >> 4;
        if adc_p == 0 || adc_t == 0 {
            return Err(SensorError::InvalidReading);
        }
        let (pressure, temperature) = compensate(adc_t, adc_p, &calibration)?;
        Ok(reading(
            (Property::Pressure, pressure),
            (Property::Temperature, temperature),
        ))
    }
}

/// Little endian: `dig_T1` and `dig_P1` unsigned, the rest signed.
fn parse_calibration(raw: &[u8; 24]) -> Calibration {
    let mut calibration = [0i32; 12];
    for (i, slot) in calibration.iter_mut().enumerate() {
        let bytes = [raw[2 * i], raw[2 * i + 1]];
        *slot = if i == 0 || i == 3 {
            u16::from_le_bytes(bytes) as i32
        } else {
            i16::from_le_bytes(bytes) as i32
        };
    }
    calibration
}

/// Floating point compensation from the datasheet. Returns bar and °C.
fn compensate(adc_t: u32, adc_p: u32, c: &Calibration) -> Result<(f64, f64), SensorError> {
    let [t1, t2, t3, p1, p2, p3, p4, p5, p6, p7, p8, p9] = c.map(|v| v as f64);
    let (adc_t, adc_p) = (adc_t as f64, adc_p as f64);

    let var1 = (adc_t / 16384.0 - t1 / 1024.0) * t2;
    let d = adc_t / 131072.0 - t1 / 8192.0;
    let var2 = d * d * t3;
    let t_fine = var1 + var2;
    let temperature = t_fine / 5120.0;

    let mut var1 = t_fine / 2.0 - 64000.0;
    let mut var2 = var1 * var1 * p6 / 32768.0;
    var2 += var1 * p5 * 2.0;
    var2 = var2 / 4.0 + p4 * 65536.0;
    var1 = (p3 * (var1 * var1) / 524288.0 + p2 * var1) / 524288.0;
    var1 = (1.0 + var1 / 32768.0) * p1;
    if var1 == 0.0 {
        return Err(SensorError::InvalidReading);
    }
    let mut pressure = (1048576.0 - adc_p - var2 / 4096.0) * 6250.0 / var1;
    var1 = p9 * (pressure * pressure) / 2147483648.0;
    var2 = pressure * p8 / 32768.0;
    pressure += (var1 + var2 + p7) / 16.0;

    Ok((round_to(pressure / 100000.0, 4), round_to(temperature, 1)))
}
