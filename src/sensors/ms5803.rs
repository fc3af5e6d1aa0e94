//! MS5803 waterproof pressure and temperature sensor.

use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;

use super::{Reading, SensorError, bus_error, load_calibration, reading, round_to, store_calibration};
use crate::config::ConfigError;
use crate::device::Property;
use crate::storage::KeyValueStore;

pub const DEFAULT_ADDRESS: u8 = 0x76;
pub const DEFAULT_PRESSURE_RESOLUTION: u16 = 1024;
pub const DEFAULT_TEMPERATURE_RESOLUTION: u16 = 256;

const OVERSAMPLING: [u16; 5] = [256, 512, 1024, 2048, 4096];
// Datasheet maxima are too short in practice; the chip reports busy or 0.
const CONVERSION_MS: [u32; 5] = [4, 6, 7, 10, 15];

const CMD_CONVERT_PRESSURE: u8 = 0x40;
const CMD_CONVERT_TEMPERATURE: u8 = 0x50;
const CMD_READ_ADC: u8 = 0x00;
const CMD_READ_PROM: u8 = 0xA2;

/// `C1..C6` from the PROM.
type Calibration = [i32; 6];

#[derive(Debug, Clone, PartialEq)]
pub struct Ms5803 {
    address: u8,
    pressure_osr: usize,
    temperature_osr: usize,
    calibration: Option<Calibration>,
}

fn osr_index(resolution: u16) -> Result<usize, ConfigError> {
    OVERSAMPLING
        .iter()
        .position(|r| *r == resolution)
        .ok_or(ConfigError::InvalidSensorOption)
}

impl Ms5803 {
    /// Resolutions are oversampling ratios: 256, 512, 1024, 2048 or 4096.
    pub fn new(address: u8, pressure_resolution: u16, temperature_resolution: u16) -> Result<Self, ConfigError> {
        Ok(Self {
            address,
            pressure_osr: osr_index(pressure_resolution)?,
            temperature_osr: osr_index(temperature_resolution)?,
            calibration: None,
        })
    }

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
        let mut calibration = [0i32; 6];
        for (i, slot) in calibration.iter_mut().enumerate() {
            let mut word = [0u8; 2];
            i2c.write(self.address, &[CMD_READ_PROM + 2 * i as u8])
                .await
                .map_err(bus_error)?;
            i2c.read(self.address, &mut word)
                .await
                .map_err(bus_error)?;
            *slot = u16::from_be_bytes(word) as i32;
        }
        store_calibration(store, sensor_id, &calibration);
        self.calibration = Some(calibration);
        Ok(())
    }

    async fn convert<I: I2c, D: DelayNs>(
        &self,
        i2c: &mut I,
        delay: &mut D,
        command: u8,
        osr: usize,
    ) -> Result<u32, SensorError> {
        i2c.write(self.address, &[command + 2 * osr as u8])
            .await
            .map_err(bus_error)?;
        delay.delay_ms(CONVERSION_MS[osr]).await;
        i2c.write(self.address, &[CMD_READ_ADC])
            .await
            .map_err(bus_error)?;
        let mut adc = [0u8; 3];
        i2c.read(self.address, &mut adc)
            .await
            .map_err(bus_error)?;
        Ok(u32::from_be_bytes([0, adc[0], adc[1], adc[2]]))
    }

    /// Pressure in bar and temperature in °C.
    pub async fn measure<I: I2c, D: DelayNs>(&mut self, i2c: &mut I, delay: &mut D) -> Result<Reading, SensorError> {
        let calibration = self.calibration.ok_or(SensorError::InvalidReading)?;
        let d1 = self
            .convert(i2c, delay, CMD_CONVERT_PRESSURE, self.pressure_osr)
            .await?;
        let d2 = self
            .convert(i2c, delay, CMD_CONVERT_TEMPERATURE, self.temperature_osr)
            .await?;
        if d1 == 0 || d2 == 0 {
            return Err(SensorError::InvalidReading);
        }
        let (pressure, temperature) = compensate(d1, d2, &calibration);
        Ok(reading(
            (Property::Pressure, pressure),
            (Property::Temperature, temperature),
        ))
    }
}

/// Integer compensation with the second order terms. Returns bar and °C.
fn compensate(d1: u32, d2: u32, c: &Calibration) -> (f64, f64) {
    let [c1, c2, c3, c4, c5, c6] = c.map(|v| v as i64);
    let (d1, d2) = (d1 as i64, d2 as i64);

    let dt = d2 - c5 * (1 << 8);
    let mut temp = 2000 + (dt * c6).div_euclid(1 << 23);
    let mut off = c2 * (1 << 16) + (c4 * dt).div_euclid(1 << 7);
    let mut sens = c1 * (1 << 15) + (c3 * dt).div_euclid(1 << 8);

    let (t2, off2, sens2) = if temp < 2000 {
        let low = (temp - 2000) * (temp - 2000);
        let mut off2 = (3 * low).div_euclid(2);
        let mut sens2 = (5 * low).div_euclid(8);
        if temp < -1500 {
            let very_low = (temp + 1500) * (temp + 1500);
            off2 += 7 * very_low;
            sens2 += 4 * very_low;
        }
        ((3 * dt * dt).div_euclid(1 << 33), off2, sens2)
    } else {
        let high = (temp - 2000) * (temp - 2000);
        ((7 * dt * dt).div_euclid(1 << 37), high.div_euclid(16), 0)
    };
    temp -= t2;
    off -= off2;
    sens -= sens2;

    let pressure = ((d1 * sens).div_euclid(1 << 21) - off).div_euclid(1 << 15);
    (
        round_to(pressure as f64 / 10000.0, 4),
        round_to(temp as f64 / 100.0, 1),
    )
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::storage::MemoryStore;
    use crate::testing::{FakeDelay, ManualClock, MockI2c};

    const COEFFICIENTS: Calibration = [46546, 42845, 29751, 29457, 32745, 29059];

    #[test]
    fn reference_values() {
        assert_eq!(compensate(4311550, 8387300, &COEFFICIENTS), (1.0005, 20.1));
    }

    #[test]
    fn cold_water_uses_second_order_terms() {
        assert_eq!(compensate(4311550, 7800000, &COEFFICIENTS), (0.9874, -1.4));
    }

    #[test]
    fn resolution_must_be_an_oversampling_ratio() {
        assert_eq!(Ms5803::new(DEFAULT_ADDRESS, 1000, 256), Err(ConfigError::InvalidSensorOption));
    }

    #[test]
    fn reads_prom_once() {
        let bus = MockI2c::new();
        let mut store = MemoryStore::<4>::new();
        for word in [[0xb5, 0xd2], [0xa7, 0x5d], [0x74, 0x37], [0x73, 0x11], [0x7f, 0xe9], [0x71, 0x83]] {
            bus.respond(&word);
        }
        let mut chip = Ms5803::new(DEFAULT_ADDRESS, 1024, 256).unwrap();

        block_on(chip.calibrate(&mut bus.clone(), &mut store, "ms")).unwrap();
        block_on(chip.calibrate(&mut bus.clone(), &mut store, "ms")).unwrap();

        assert_eq!(chip.calibration, Some(COEFFICIENTS));
        let commands: std::vec::Vec<u8> = bus.writes().iter().map(|(_, w)| w[0]).collect();
        assert_eq!(commands, [0xA2, 0xA4, 0xA6, 0xA8, 0xAA, 0xAC]);
    }

    #[test]
    fn measures_pressure_then_temperature() {
        let bus = MockI2c::new();
        let mut delay = FakeDelay::new(&ManualClock::new());
        let mut chip = Ms5803::new(DEFAULT_ADDRESS, 4096, 256).unwrap();
        chip.calibration = Some(COEFFICIENTS);
        bus.respond(&[0x41, 0xc9, 0xfe]);
        bus.respond(&[0x7f, 0xfa, 0xe4]);

        let reading = block_on(chip.measure(&mut bus.clone(), &mut delay)).unwrap();

        assert_eq!(reading.get(&Property::Pressure), Some(&1.0005));
        assert_eq!(reading.get(&Property::Temperature), Some(&20.1));
        let commands: std::vec::Vec<u8> = bus.writes().iter().map(|(_, w)| w[0]).collect();
        assert_eq!(commands, [0x48, 0x00, 0x50, 0x00]);
        assert_eq!(delay.calls(), [15, 4]);
    }
}
