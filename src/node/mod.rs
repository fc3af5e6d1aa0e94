//! # Sensor Node
//!
//! A node measures all of its sensors once per cycle, drops what the
//! [`SendPolicy`] holds back and sends the rest to the hub as one JSON
//! frame, `{"<sensor_id>": {"<property>": value}}`. A frame is sent every
//! cycle even when everything was held back, because the hub uses it as a
//! keepalive. The value cache is only updated after the radio confirmed the
//! send.
//!
//! In deep-sleep mode [`SensorNode::run`] returns after one cycle and the
//! board powers down for the returned duration. The clock handed to the
//! node must keep counting across deep sleep (an RTC-backed clock) for the
//! time thresholds to work.

pub mod cache;
pub mod policy;

use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use heapless::{LinearMap, Vec};

use crate::clock::Clock;
use crate::config::{ConfigError, NodeConfig};
use crate::device::{LinkAddress, LinkKey};
use crate::error::{Error, ProtocolViolation};
use crate::radio::{RadioDriver, RadioLink};
use crate::sensors::{Reading, Sensor};
use crate::storage::KeyValueStore;
use crate::{MAX_FRAME_LEN, MAX_PROPERTIES, MAX_SENSORS};

pub use cache::{CacheEntry, ValueCache};
pub use policy::{SendConfigs, SendPolicy, should_send};

type Frame<'a> = LinearMap<&'a str, LinearMap<&'static str, f64, MAX_PROPERTIES>, MAX_SENSORS>;

struct NodeSensor {
    sensor: Sensor,
    send_configs: SendConfigs,
}

pub struct SensorNode<R, I, D, S, K>
where
    R: RadioDriver,
    I: I2c,
    D: DelayNs,
    S: KeyValueStore,
    K: Clock,
{
    radio: RadioLink<R>,
    bus: I,
    delay: D,
    policy: SendPolicy<S>,
    clock: K,
    hub: LinkAddress,
    primary_key: Option<LinkKey>,
    local_key: Option<LinkKey>,
    sensors: Vec<NodeSensor, MAX_SENSORS>,
    deepsleep: bool,
    interval: Duration,
}

impl<R, I, D, S, K> SensorNode<R, I, D, S, K>
where
    R: RadioDriver,
    I: I2c,
    D: DelayNs,
    S: KeyValueStore,
    K: Clock,
{
    pub fn new(config: &NodeConfig, radio: R, bus: I, delay: D, store: S, clock: K) -> Result<Self, ConfigError> {
        let mut sensors = Vec::new();
        for sensor in &config.sensors {
            let _ = sensors.push(NodeSensor {
                sensor: Sensor::from_config(sensor)?,
                send_configs: sensor.send_configs()?,
            });
        }
        Ok(Self {
            radio: RadioLink::new(radio),
            bus,
            delay,
            policy: SendPolicy::new(store),
            clock,
            hub: config.hub_address()?,
            primary_key: config.primary_key()?,
            local_key: config.local_key()?,
            sensors,
            deepsleep: config.deepsleep,
            interval: config.interval,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Pause after a failed run.
    pub fn backoff(&self) -> Duration {
        self.interval / 10
    }

    /// Prepares the sensors and brings up the radio with the hub as the
    /// only peer. `power_on` re-initializes chip registers.
    pub async fn start(&mut self, power_on: bool) -> Result<(), Error> {
        for node_sensor in self.sensors.iter_mut() {
            node_sensor
                .sensor
                .prepare(&mut self.bus, &mut self.delay, self.policy.store_mut(), power_on)
                .await?;
        }
        self.radio.start(self.primary_key.as_ref())?;
        self.radio.register_peer(self.hub, self.local_key.as_ref())?;
        Ok(())
    }

    /// Measures, filters and sends one frame. Returns whether the hub
    /// acknowledged it.
    pub async fn run_cycle(&mut self) -> Result<bool, Error> {
        let mut selected: Vec<Reading, MAX_SENSORS> = Vec::new();
        for node_sensor in self.sensors.iter_mut() {
            let reading = node_sensor.sensor.read(&mut self.bus, &mut self.delay).await?;
            let _ = selected.push(reading);
        }

        let now = self.clock.now();
        for (node_sensor, reading) in self.sensors.iter().zip(selected.iter_mut()) {
            *reading = self.policy.filter(
                node_sensor.sensor.id(),
                reading,
                &node_sensor.send_configs,
                now,
            );
        }

        let mut frame = Frame::new();
        for (node_sensor, reading) in self.sensors.iter().zip(selected.iter()) {
            if reading.is_empty() {
                continue;
            }
            let mut values: LinearMap<&str, f64, MAX_PROPERTIES> = LinearMap::new();
            for (property, value) in reading.iter() {
                let _ = values.insert(property.as_str(), *value);
            }
            let _ = frame.insert(node_sensor.sensor.id(), values);
        }
        let mut buf = [0u8; MAX_FRAME_LEN];
        let len = serde_json_core::to_slice(&frame, &mut buf).map_err(|_| {
            error!("node: measurement frame exceeds {} bytes", MAX_FRAME_LEN);
            ProtocolViolation::FrameTooLarge
        })?;

        if !self.radio.send(self.hub, &buf[..len]).await {
            return Ok(false);
        }
        for (node_sensor, reading) in self.sensors.iter().zip(selected.iter()) {
            self.policy.commit(
                node_sensor.sensor.id(),
                reading,
                &node_sensor.send_configs,
                now,
            );
        }
        Ok(true)
    }

    /// Starts the node and runs cycles. Returns how long to sleep before the
    /// next run: the interval after a deep-sleep cycle, a tenth of it after
    /// a failure. Continuous mode only returns on failure.
    pub async fn run(&mut self, power_on: bool) -> Duration {
        let result = self.run_cycles(power_on).await;
        self.radio.stop();
        match result {
            Ok(()) => self.interval,
            Err(error) => {
                error!("node: run failed: {:?}", error);
                self.backoff()
            }
        }
    }

    async fn run_cycles(&mut self, power_on: bool) -> Result<(), Error> {
        self.start(power_on).await?;
        loop {
            if !self.run_cycle().await? {
                warn!("node: hub did not acknowledge the frame");
            }
            if self.deepsleep {
                return Ok(());
            }
            let ms = self.interval.as_millis().min(u32::MAX as u64) as u32;
            self.delay.delay_ms(ms).await;
        }
    }

    /// Continuous mode without deep sleep: restarts the run after every
    /// failure.
    pub async fn supervise(&mut self, power_on: bool) -> ! {
        let mut power_on = power_on;
        loop {
            let pause = self.run(power_on).await;
            power_on = false;
            let ms = pause.as_millis().min(u32::MAX as u64) as u32;
            self.delay.delay_ms(ms).await;
        }
    }
}
