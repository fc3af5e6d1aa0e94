//! # Hub
//!
//! The hub bridges the radio mesh to the MQTT broker. One cooperative loop
//! waits on three things at once: a queued radio frame, a readable broker
//! connection and the keepalive deadline handed out by
//! [`BrokerSession::ping_tick`]. Each iteration drains whatever is ready,
//! broker first, then runs the keepalive tick, so liveness sweeps always see
//! the freshest receive times.
//!
//! Fatal errors unwind [`Hub::run`]. [`Hub::supervise`] tears everything
//! down, waits a cooldown and starts a fresh run; no state carries over.
//!
//! ```ignore
//! let config = HubConfig::from_json(CONFIG_JSON)?;
//! let devices = config.devices()?;
//! let transport = TcpTransport::new(socket, config.mqtt.endpoint()?, Duration::from_secs(5));
//! let mut hub = Hub::new(&config, &devices, esp_now, transport, SystemClock, Delay)?;
//! hub.supervise().await
//! ```

pub mod discovery;
pub mod registry;
pub mod session;

use core::convert::Infallible;
use core::fmt::Write;

use embassy_futures::select::{Either3, select3};
use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;
use heapless::{String, Vec};
use serde::de::{DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::clock::Clock;
use crate::config::{ConfigError, HubConfig};
use crate::device::{Device, LinkKey};
use crate::error::{Error, ProtocolViolation};
use crate::radio::{RadioDriver, RadioFrame, RadioLink};
use crate::transport::MqttTransport;
use crate::{MAX_PROPERTIES, MAX_SENSORS};

pub use registry::DeviceRegistry;
pub use session::{BrokerSession, Durability, SessionState};

const STATE_BUFFER_LEN: usize = 512;
const MAX_STATE_ENTRIES: usize = MAX_SENSORS * MAX_PROPERTIES + 1;

/// Value of a flattened state entry.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Number(f64),
    Text(String<16>),
}

impl Serialize for StateValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StateValue::Number(n) => serializer.serialize_f64(*n),
            StateValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

/// State document published for a device: `{"<sensor>_<property>": value}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceState {
    entries: Vec<(String<32>, StateValue), MAX_STATE_ENTRIES>,
}

impl DeviceState {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Sets `key`, replacing an earlier value of the same key.
    fn set(&mut self, key: String<32>, value: StateValue) -> Result<(), (String<32>, StateValue)> {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => {
                entry.1 = value;
                Ok(())
            }
            None => self.entries.push((key, value)),
        }
    }
}

impl Serialize for DeviceState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key.as_str(), value)?;
        }
        map.end()
    }
}

/// Walks a measurement document `{"<sensor>": {"<property>": value}}` and
/// keeps the declared pairs. Everything else is skipped unparsed.
struct FrameVisitor<'d> {
    device: &'d Device,
    state: &'d mut DeviceState,
}

impl<'de> Visitor<'de> for FrameVisitor<'_> {
    type Value = ();

    fn expecting(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("a measurement document")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        let state = self.state;
        while let Some(sensor_id) = map.next_key::<&'de str>()? {
            if self.device.components.iter().any(|c| c.sensor_id == sensor_id) {
                map.next_value_seed(SensorValues {
                    device: self.device,
                    sensor_id,
                    state: &mut *state,
                })?;
            } else {
                trace!("hub: dropping undeclared sensor {}", sensor_id);
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(())
    }
}

/// Values of one declared sensor. Anything but an object is ignored.
struct SensorValues<'d, 'de> {
    device: &'d Device,
    sensor_id: &'de str,
    state: &'d mut DeviceState,
}

impl<'de> DeserializeSeed<'de> for SensorValues<'_, 'de> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_ignored_any(self)
    }
}

impl<'de> Visitor<'de> for SensorValues<'_, 'de> {
    type Value = ();

    fn expecting(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("sensor values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        while let Some(property) = map.next_key::<&'de str>()? {
            if self.device.exposed(self.sensor_id, property).is_none() {
                trace!("hub: dropping undeclared {}_{}", self.sensor_id, property);
                map.next_value::<IgnoredAny>()?;
                continue;
            }
            let value: f64 = map.next_value()?;
            let mut key = String::<32>::new();
            write!(key, "{}_{}", self.sensor_id, property)
                .map_err(|_| <A::Error as serde::de::Error>::custom("key too long"))?;
            self.state
                .set(key, StateValue::Number(value))
                .map_err(|_| <A::Error as serde::de::Error>::custom("too many values"))?;
        }
        Ok(())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
        while seq.next_element::<IgnoredAny>()?.is_some() {}
        Ok(())
    }

    fn visit_str<E: serde::de::Error>(self, _: &str) -> Result<(), E> {
        Ok(())
    }

    fn visit_unit<E: serde::de::Error>(self) -> Result<(), E> {
        Ok(())
    }
}

/// Flattens a node frame into the device state, keeping only the declared
/// `(sensor, property)` pairs. Appends `_signal` when the link is weak.
///
/// Only a frame that is not a JSON object, or a declared property whose
/// value is not a number, is malformed.
pub fn build_state(
    device: &Device,
    data: &[u8],
    rssi: Option<i16>,
) -> Result<DeviceState, ProtocolViolation> {
    let mut state = DeviceState::default();
    let mut deserializer = serde_json_core::de::Deserializer::new(data, None);
    (&mut deserializer)
        .deserialize_map(FrameVisitor {
            device,
            state: &mut state,
        })
        .and_then(|()| deserializer.end())
        .map_err(|_| {
            warn!("hub: malformed frame from {}", device.id.as_str());
            ProtocolViolation::MalformedFrame
        })?;

    if let Some(rssi) = rssi
        && device.reports_signal(rssi)
    {
        let mut text = String::<16>::new();
        let _ = write!(text, "{}dBm", rssi);
        let _ = state.set(String::try_from("_signal").unwrap_or_default(), StateValue::Text(text));
    }
    Ok(state)
}

pub struct Hub<'a, R, T, K, D>
where
    R: RadioDriver,
    T: MqttTransport,
    K: Clock,
    D: DelayNs + Clone,
{
    radio: RadioLink<R>,
    session: BrokerSession<'a, T, K, D>,
    devices: &'a [Device],
    primary_key: Option<LinkKey>,
    wait: D,
    next_timeout: Duration,
}

impl<'a, R, T, K, D> Hub<'a, R, T, K, D>
where
    R: RadioDriver,
    T: MqttTransport,
    K: Clock,
    D: DelayNs + Clone,
{
    pub fn new(
        config: &HubConfig,
        devices: &'a [Device],
        radio: R,
        transport: T,
        clock: K,
        delay: D,
    ) -> Result<Self, ConfigError> {
        let session = BrokerSession::new(transport, config, devices, clock, delay.clone());
        Ok(Self {
            radio: RadioLink::new(radio),
            next_timeout: session.keepalive(),
            session,
            devices,
            primary_key: config.primary_key()?,
            wait: delay,
        })
    }

    pub fn session(&self) -> &BrokerSession<'a, T, K, D> {
        &self.session
    }

    pub fn radio(&self) -> &RadioLink<R> {
        &self.radio
    }

    /// Connects, publishes discovery and brings up the radio with every
    /// configured device as a peer.
    pub async fn start(&mut self) -> Result<(), Error> {
        self.session.start().await?;
        self.session.send_discovery().await?;

        self.radio.start(self.primary_key.as_ref())?;
        for device in self.devices {
            self.radio
                .register_peer(device.address, device.link_key.as_ref())?;
        }
        self.next_timeout = self.session.keepalive();
        info!("hub: waiting for messages");
        Ok(())
    }

    /// One loop iteration.
    pub async fn step(&mut self) -> Result<(), Error> {
        let timeout_ms = self.next_timeout.as_millis().min(u32::MAX as u64) as u32;
        let ready = select3(
            self.radio.wait_readable(),
            self.session.wait_readable(),
            self.wait.delay_ms(timeout_ms),
        )
        .await;
        if let Either3::First(result) = ready {
            result?;
        }

        if self.session.is_readable() {
            self.session.on_readable().await?;
        }
        while let Some(frame) = self.radio.try_receive()? {
            self.forward(frame).await?;
        }

        self.next_timeout = self.session.ping_tick().await;
        Ok(())
    }

    async fn forward(&mut self, frame: RadioFrame) -> Result<(), Error> {
        let devices = self.devices;
        let Some(device) = devices.iter().find(|d| d.address == frame.sender) else {
            return Ok(());
        };
        let rssi = self.radio.signal_strength(&frame.sender);
        let state = build_state(device, &frame.data, rssi)?;

        let mut payload = [0u8; STATE_BUFFER_LEN];
        let len = if state.is_empty() {
            0
        } else {
            serde_json_core::to_slice(&state, &mut payload)
                .map_err(|_| ProtocolViolation::FrameTooLarge)?
        };
        self.session.record_receive(&device.id, &payload[..len]).await;
        Ok(())
    }

    /// Runs until a fatal error.
    pub async fn run(&mut self) -> Result<Infallible, Error> {
        self.start().await?;
        loop {
            self.step().await?;
        }
    }

    /// Leaves the broker and powers the radio down.
    pub async fn shutdown(&mut self) {
        self.session.close().await;
        self.radio.stop();
    }

    /// Pause between a failed run and the next one.
    pub fn cooldown(&self) -> Duration {
        self.session.keepalive() / 10
    }

    /// One supervised run: runs until a fatal error, tears down and waits
    /// the cooldown. Returns the error that ended the run.
    pub async fn run_once(&mut self) -> Error {
        let Err(error) = self.run().await;
        error!("hub: run failed: {:?}", error);
        self.shutdown().await;
        let cooldown_ms = self.cooldown().as_millis().min(u32::MAX as u64) as u32;
        self.wait.delay_ms(cooldown_ms).await;
        error
    }

    /// Restarts the run forever.
    pub async fn supervise(&mut self) -> ! {
        loop {
            self.run_once().await;
        }
    }
}
