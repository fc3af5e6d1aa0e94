//! # Broker Session
//!
//! Owns the MQTT connection of the hub and everything that has to survive
//! broker restarts: the retained availability messages, discovery, the
//! keepalive ping clock and the device liveness sweep that rides on it.
//!
//! Transport failures never leave this module as errors. They are answered
//! with reconnects, bounded or not depending on the caller. Only a broker
//! that speaks garbage ends the run.

use embassy_time::{Duration, Instant};
use embedded_hal_async::delay::DelayNs;
use heapless::String;

use crate::client::{MqttClient, MqttOptions, Will};
use crate::clock::Clock;
use crate::config::{HubConfig, MAX_PREFIX_LEN};
use crate::device::Device;
use crate::error::{Error, MqttError, ProtocolError, ProtocolViolation};
use crate::hub::discovery::{self, HUB_ID, Topic};
use crate::hub::registry::DeviceRegistry;
use crate::transport::MqttTransport;

/// Packet buffer size; a discovery document plus its topic must fit.
pub const MQTT_BUFFER_LEN: usize = 1280;
const DISCOVERY_BUFFER_LEN: usize = 1024;

/// Longest sleep between two reconnect attempts, in seconds.
pub const MAX_BACKOFF_SECS: u32 = 30;

const ONLINE: &[u8] = b"online";
const OFFLINE: &[u8] = b"offline";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

/// How hard [`BrokerSession::publish`] tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Durability {
    /// One immediate reconnect and resend, then give up.
    BestEffort,
    /// Reconnect with backoff until the message is out.
    Persistent,
}

/// Sleep before reconnect attempt `attempt` (0-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(attempt.min(MAX_BACKOFF_SECS) as u64)
}

fn elapsed(now: Instant, since: Instant) -> Duration {
    now.checked_duration_since(since)
        .unwrap_or(Duration::from_ticks(0))
}

pub struct BrokerSession<'a, T, K, D>
where
    T: MqttTransport,
    K: Clock,
    D: DelayNs,
{
    client: MqttClient<T, MQTT_BUFFER_LEN>,
    prefix: String<MAX_PREFIX_LEN>,
    hub_status: Topic,
    devices: &'a [Device],
    registry: DeviceRegistry,
    state: SessionState,
    keepalive: Duration,
    last_ping: Instant,
    last_activity: Instant,
    clock: K,
    delay: D,
}

impl<'a, T, K, D> BrokerSession<'a, T, K, D>
where
    T: MqttTransport,
    K: Clock,
    D: DelayNs,
{
    pub fn new(transport: T, config: &HubConfig, devices: &'a [Device], clock: K, delay: D) -> Self {
        let hub_status = discovery::status_topic(&config.topic_prefix, HUB_ID);
        let mut options = MqttOptions::new(config.topic_prefix.clone())
            .with_keep_alive(config.mqtt.keepalive())
            .with_will(Will {
                topic: hub_status.clone(),
                message: OFFLINE,
                retain: true,
            });
        if let Some(user) = &config.mqtt.user {
            let password = config.mqtt.password.clone().unwrap_or_default();
            options = options.with_credentials(user.clone(), password);
        }
        let now = clock.now();
        Self {
            client: MqttClient::new(transport, options),
            prefix: config.topic_prefix.clone(),
            hub_status,
            devices,
            registry: DeviceRegistry::new(devices),
            state: SessionState::Disconnected,
            keepalive: config.mqtt.keepalive(),
            last_ping: now,
            last_activity: now,
            clock,
            delay,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn keepalive(&self) -> Duration {
        self.keepalive
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Starts a fresh run: forgets liveness and discovery, then connects
    /// with a clean session. A broker that is down now ends the run.
    pub async fn start(&mut self) -> Result<(), Error> {
        self.registry.reset();
        self.client.close();
        self.connect(true).await.map_err(|_| {
            error!("mqtt: cannot reach broker");
            Error::Transport
        })
    }

    async fn connect(&mut self, clean_session: bool) -> Result<(), MqttError<T::Error>> {
        self.state = SessionState::Connecting;
        let result = match self.client.connect(clean_session).await {
            Ok(()) => self.client.publish(&self.hub_status, ONLINE, true).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                let now = self.clock.now();
                self.last_ping = now;
                self.last_activity = now;
                self.state = SessionState::Connected;
                info!("mqtt: connected");
                Ok(())
            }
            Err(e) => {
                self.client.close();
                self.state = SessionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Reconnects, sleeping [`backoff_delay`] before every attempt but the
    /// first. Gives up after `max_attempts` when given.
    pub async fn reconnect(&mut self, max_attempts: Option<u32>) -> bool {
        self.client.close();
        self.state = SessionState::Disconnected;
        let mut attempt = 0;
        while max_attempts.is_none_or(|max| attempt < max) {
            let backoff = backoff_delay(attempt);
            if backoff.as_ticks() > 0 {
                self.delay.delay_ms(backoff.as_millis() as u32).await;
            }
            if self.connect(false).await.is_ok() {
                return true;
            }
            warn!("mqtt: reconnect attempt {} failed", attempt);
            attempt += 1;
        }
        false
    }

    /// Publishes with the given retry policy. Returns whether the message
    /// reached the broker.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
        durability: Durability,
    ) -> bool {
        let mut retried = false;
        loop {
            match self.client.publish(topic, payload, retain).await {
                Ok(()) => return true,
                Err(e) if !e.is_recoverable() => {
                    error!("mqtt: cannot encode message for {}", topic);
                    return false;
                }
                Err(_) => warn!("mqtt: publish to {} failed", topic),
            }
            match durability {
                Durability::Persistent => {
                    self.reconnect(None).await;
                }
                Durability::BestEffort if retried => return false,
                Durability::BestEffort => {
                    retried = true;
                    if !self.reconnect(Some(1)).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Runs the keepalive clock and returns how long the caller may wait
    /// before calling again.
    ///
    /// When a ping is due, a broker that stayed silent for longer than the
    /// keepalive is reconnected first. After pinging, every device that
    /// went silent for longer than its timeout is published offline.
    pub async fn ping_tick(&mut self) -> Duration {
        let now = self.clock.now();
        let since_ping = elapsed(now, self.last_ping);
        if since_ping < self.keepalive {
            return self.keepalive - since_ping;
        }

        if elapsed(now, self.last_activity) > self.keepalive {
            warn!("mqtt: broker silent for a whole keepalive, reconnecting");
            self.reconnect(None).await;
        }
        match self.client.ping().await {
            Ok(()) => self.last_ping = self.clock.now(),
            Err(_) => {
                warn!("mqtt: ping failed");
                self.reconnect(None).await;
            }
        }

        for id in self.registry.sweep_stale(self.clock.now()) {
            info!("hub: device {} went offline", id.as_str());
            let topic = discovery::status_topic(&self.prefix, &id);
            self.publish(&topic, OFFLINE, true, Durability::BestEffort)
                .await;
        }
        self.keepalive
    }

    /// Consumes one packet from the broker.
    pub async fn on_readable(&mut self) -> Result<(), Error> {
        match self.client.poll().await {
            Ok(event) => {
                trace!("mqtt: received {:?}", event);
                self.last_activity = self.clock.now();
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                warn!("mqtt: connection lost");
                self.reconnect(None).await;
                Ok(())
            }
            Err(MqttError::Protocol(p)) => {
                error!("mqtt: broker violated the protocol: {:?}", p);
                Err(ProtocolViolation::Mqtt(p).into())
            }
            Err(_) => Err(ProtocolViolation::Mqtt(ProtocolError::PayloadTooLarge).into()),
        }
    }

    /// Publishes the discovery document of every entity not yet announced
    /// in this run, then each newly announced device's initial `offline`.
    pub async fn send_discovery(&mut self) -> Result<(), Error> {
        let devices = self.devices;
        let mut document = [0u8; DISCOVERY_BUFFER_LEN];
        for device in devices {
            for (index, (sensor_id, property)) in device.entities().enumerate() {
                if !self.registry.mark_discovered(&device.id, index) {
                    continue;
                }
                let topic = discovery::discovery_topic(&self.prefix, &device.id, sensor_id, property);
                let len = discovery::write_document(
                    &self.prefix,
                    device,
                    sensor_id,
                    property,
                    &mut document,
                )?;
                self.publish(&topic, &document[..len], true, Durability::Persistent)
                    .await;
            }
            if self.registry.mark_announced(&device.id) {
                let topic = discovery::status_topic(&self.prefix, &device.id);
                self.publish(&topic, OFFLINE, true, Durability::Persistent)
                    .await;
            }
        }
        Ok(())
    }

    /// Records a frame from `device_id`, announcing the device online when
    /// it was offline, and forwards `payload` unless it is empty.
    pub async fn record_receive(&mut self, device_id: &str, payload: &[u8]) {
        if self.registry.mark_seen(device_id, self.clock.now()) {
            info!("hub: device {} is online", device_id);
            let topic = discovery::status_topic(&self.prefix, device_id);
            self.publish(&topic, ONLINE, true, Durability::BestEffort)
                .await;
        }
        if !payload.is_empty() {
            let topic = discovery::state_topic(&self.prefix, device_id);
            self.publish(&topic, payload, false, Durability::BestEffort)
                .await;
        }
    }

    /// Announces the hub offline and leaves the broker.
    pub async fn close(&mut self) {
        if self.state == SessionState::Connected {
            let _ = self.client.publish(&self.hub_status, OFFLINE, true).await;
        }
        self.client.disconnect().await;
        self.state = SessionState::Disconnected;
    }

    /// Pending while disconnected.
    pub async fn wait_readable(&mut self) {
        self.client.wait_readable().await
    }

    pub fn is_readable(&self) -> bool {
        self.client.is_readable()
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;
    use heapless::Vec;

    use super::*;
    use crate::MAX_DEVICES;
    use crate::testing::{FakeDelay, ManualClock, MockBroker};

    const CONFIG: &str = r#"{
        "topic_prefix": "mesh",
        "mqtt": {"server": "10.0.0.1", "user": "hub", "password": "pw", "keepalive": 30},
        "devices": [{
            "address": "00:00:00:00:00:01",
            "name": "Cellar",
            "keepalive": 10,
            "components": {"bme": ["temperature", "pressure"]}
        }]
    }"#;
    const DEVICE: &str = "000000000001";

    struct Fixture {
        config: HubConfig,
        devices: Vec<Device, MAX_DEVICES>,
        broker: MockBroker,
        clock: ManualClock,
        delay: FakeDelay,
    }

    impl Fixture {
        fn new() -> Self {
            let config = HubConfig::from_json(CONFIG.as_bytes()).unwrap();
            let devices = config.devices().unwrap();
            let clock = ManualClock::new();
            let delay = FakeDelay::new(&clock);
            Self {
                config,
                devices,
                broker: MockBroker::new(),
                clock,
                delay,
            }
        }

        fn session(&self) -> BrokerSession<'_, crate::testing::MockTransport, ManualClock, FakeDelay> {
            BrokerSession::new(
                self.broker.transport(),
                &self.config,
                &self.devices,
                self.clock.clone(),
                self.delay.clone(),
            )
        }
    }

    #[test]
    fn backoff_sequence() {
        let secs: std::vec::Vec<u64> = (0..5).map(|i| backoff_delay(i).as_secs()).collect();
        assert_eq!(secs, [0, 1, 2, 3, 4]);
        assert_eq!(backoff_delay(45), Duration::from_secs(30));
    }

    #[test]
    fn start_announces_hub() {
        let f = Fixture::new();
        let mut session = f.session();

        block_on(session.start()).unwrap();

        assert_eq!(session.state(), SessionState::Connected);
        let connect = &f.broker.connects()[0];
        assert!(connect.clean_session);
        assert_eq!(connect.client_id, "mesh");
        assert_eq!(connect.username.as_deref(), Some("hub"));
        assert_eq!(connect.will_topic.as_deref(), Some("mesh/status/hub"));
        assert!(connect.will_retain);
        assert_eq!(f.broker.publishes()[0].topic, "mesh/status/hub");
        assert_eq!(f.broker.publishes()[0].payload, "online");
        assert!(f.broker.publishes()[0].retain);
    }

    #[test]
    fn start_fails_when_broker_down() {
        let f = Fixture::new();
        let mut session = f.session();
        f.broker.fail_next_opens(1);

        assert_eq!(block_on(session.start()), Err(Error::Transport));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn reconnect_backs_off() {
        let f = Fixture::new();
        let mut session = f.session();
        block_on(session.start()).unwrap();
        f.broker.fail_next_opens(3);

        assert!(block_on(session.reconnect(None)));

        assert_eq!(f.delay.calls(), [1000, 2000, 3000]);
        let connects = f.broker.connects();
        assert_eq!(connects.len(), 2);
        assert!(!connects[1].clean_session);
    }

    #[test]
    fn bounded_reconnect_gives_up() {
        let f = Fixture::new();
        let mut session = f.session();
        f.broker.fail_next_opens(5);

        assert!(!block_on(session.reconnect(Some(2))));
        assert_eq!(f.delay.calls(), [1000]);
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn best_effort_publish_retries_once() {
        let f = Fixture::new();
        let mut session = f.session();
        block_on(session.start()).unwrap();

        f.broker.fail_next_publishes(1);
        assert!(block_on(session.publish("mesh/get/x", b"{}", false, Durability::BestEffort)));
        assert_eq!(f.broker.publishes_to("mesh/get/x").len(), 1);

        f.broker.fail_next_publishes(1);
        f.broker.fail_next_opens(1);
        assert!(!block_on(session.publish("mesh/get/x", b"{}", false, Durability::BestEffort)));
        assert_eq!(f.broker.publishes_to("mesh/get/x").len(), 1);
        assert!(f.delay.calls().is_empty());
    }

    #[test]
    fn persistent_publish_keeps_trying() {
        let f = Fixture::new();
        let mut session = f.session();
        block_on(session.start()).unwrap();
        f.broker.fail_next_publishes(1);
        f.broker.fail_next_opens(2);

        assert!(block_on(session.publish("mesh/x", b"1", true, Durability::Persistent)));

        assert_eq!(f.delay.calls(), [1000, 2000]);
        assert_eq!(f.broker.publishes_to("mesh/x").len(), 1);
    }

    #[test]
    fn ping_tick_waits_for_keepalive() {
        let f = Fixture::new();
        let mut session = f.session();
        block_on(session.start()).unwrap();

        f.clock.advance(Duration::from_secs(10));
        assert_eq!(block_on(session.ping_tick()), Duration::from_secs(20));
        assert_eq!(f.broker.pings(), 0);

        f.clock.advance(Duration::from_secs(20));
        assert_eq!(block_on(session.ping_tick()), Duration::from_secs(30));
        assert_eq!(f.broker.pings(), 1);
        assert_eq!(f.broker.connects().len(), 1);
    }

    #[test]
    fn silent_broker_is_reconnected() {
        let f = Fixture::new();
        let mut session = f.session();
        block_on(session.start()).unwrap();
        f.broker.answer_pings(false);

        f.clock.advance(Duration::from_secs(30));
        block_on(session.ping_tick());
        assert_eq!(f.broker.connects().len(), 1);

        f.clock.advance(Duration::from_secs(31));
        block_on(session.ping_tick());
        assert_eq!(f.broker.connects().len(), 2);
        assert_eq!(f.broker.pings(), 2);
    }

    #[test]
    fn pong_counts_as_activity() {
        let f = Fixture::new();
        let mut session = f.session();
        block_on(session.start()).unwrap();

        f.clock.advance(Duration::from_secs(30));
        block_on(session.ping_tick());
        assert!(session.is_readable());
        block_on(session.on_readable()).unwrap();

        f.clock.advance(Duration::from_secs(30));
        block_on(session.ping_tick());
        assert_eq!(f.broker.connects().len(), 1);
        assert_eq!(f.broker.pings(), 2);
    }

    #[test]
    fn failed_ping_reconnects() {
        let f = Fixture::new();
        let mut session = f.session();
        block_on(session.start()).unwrap();
        f.broker.fail_next_pings(1);

        f.clock.advance(Duration::from_secs(30));
        assert_eq!(block_on(session.ping_tick()), Duration::from_secs(30));
        assert_eq!(f.broker.connects().len(), 2);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn garbage_from_broker_is_fatal() {
        let f = Fixture::new();
        let mut session = f.session();
        block_on(session.start()).unwrap();
        f.broker.inject(&[0x90, 0x00]);

        assert_eq!(
            block_on(session.on_readable()),
            Err(Error::Protocol(ProtocolViolation::Mqtt(
                ProtocolError::InvalidPacketType(9)
            )))
        );
    }

    #[test]
    fn hang_up_reconnects() {
        let f = Fixture::new();
        let mut session = f.session();
        block_on(session.start()).unwrap();
        f.broker.hang_up();

        block_on(session.on_readable()).unwrap();
        assert_eq!(f.broker.connects().len(), 2);
    }

    #[test]
    fn discovery_is_published_once() {
        let f = Fixture::new();
        let mut session = f.session();
        block_on(session.start()).unwrap();

        block_on(session.send_discovery()).unwrap();
        block_on(session.send_discovery()).unwrap();

        let configs: std::vec::Vec<_> = f
            .broker
            .publishes()
            .into_iter()
            .filter(|p| p.topic.ends_with("/config"))
            .collect();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].topic, "mesh/sensor/000000000001/bme-temperature/config");
        assert_eq!(configs[1].topic, "mesh/sensor/000000000001/bme-pressure/config");
        assert!(configs.iter().all(|p| p.retain));

        let status = f.broker.publishes_to("mesh/status/000000000001");
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].payload, "offline");
    }

    #[test]
    fn receive_announces_online_once() {
        let f = Fixture::new();
        let mut session = f.session();
        block_on(session.start()).unwrap();

        block_on(session.record_receive(DEVICE, b"{\"bme_temperature\":21.5}"));
        block_on(session.record_receive(DEVICE, b""));

        let status = f.broker.publishes_to("mesh/status/000000000001");
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].payload, "online");
        assert!(status[0].retain);
        let state = f.broker.publishes_to("mesh/get/000000000001");
        assert_eq!(state.len(), 1);
        assert!(!state[0].retain);
    }

    #[test]
    fn stale_device_goes_offline_once() {
        let f = Fixture::new();
        let mut session = f.session();
        block_on(session.start()).unwrap();
        block_on(session.record_receive(DEVICE, b""));

        for _ in 0..4 {
            f.clock.advance(Duration::from_secs(30));
            block_on(session.ping_tick());
            if session.is_readable() {
                block_on(session.on_readable()).unwrap();
            }
        }

        let status = f.broker.publishes_to("mesh/status/000000000001");
        let payloads: std::vec::Vec<_> = status.iter().map(|p| p.payload.as_str()).collect();
        assert_eq!(payloads, ["online", "offline"]);
        assert!(!session.registry().is_online(DEVICE));
    }

    #[test]
    fn close_leaves_cleanly() {
        let f = Fixture::new();
        let mut session = f.session();
        block_on(session.start()).unwrap();

        block_on(session.close());

        let last = f.broker.publishes().pop().unwrap();
        assert_eq!((last.topic.as_str(), last.payload.as_str()), ("mesh/status/hub", "offline"));
        assert_eq!(f.broker.disconnects(), 1);
        assert_eq!(session.state(), SessionState::Disconnected);
    }
}
