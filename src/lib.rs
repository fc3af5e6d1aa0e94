//! # Radio Sensor Mesh
//!
//! `myrtio-sensor-mesh` is the `no_std` core of a battery-powered wireless
//! sensor mesh built on the [Embassy](https://embassy.dev/) async ecosystem.
//!
//! Sensor nodes measure periodically and send their values over a short-range
//! point-to-point radio (ESP-NOW style: 6-byte link addresses, frames of at
//! most 250 bytes, optional per-peer link keys) to a single hub. The hub
//! republishes them to an MQTT broker with Home Assistant discovery, tracks
//! which devices are alive and rides out broker, radio and link failures on
//! its own.
//!
//! ## Core Features
//!
//! - **`no_std` & `no_alloc`:** every buffer is a fixed-capacity `heapless`
//!   type sized by the constants below.
//! - **Fully Async:** one cooperative loop per device, `async fn` in traits.
//! - **MQTT 3.1.1:** a small client with last will, retained QoS 0 publishes
//!   and keepalive pings over any [`transport::MqttTransport`].
//! - **Hardware at the seams:** the radio ([`radio::RadioDriver`]), the I²C
//!   bus (`embedded-hal-async`), non-volatile storage
//!   ([`storage::KeyValueStore`]) and time ([`clock::Clock`], `DelayNs`) are
//!   traits, so the logic runs against mocks in tests.
//!
//! ## Architecture
//!
//! ### Hub
//!
//! [`hub::Hub`] multiplexes the radio, the broker connection and the
//! keepalive deadline. [`hub::BrokerSession`] owns the broker connection,
//! availability topics and discovery; [`hub::DeviceRegistry`] tracks
//! liveness.
//!
//! ```ignore
//! let config = HubConfig::from_json(HUB_JSON)?;
//! let devices = config.devices()?;
//! let mut hub = Hub::new(&config, &devices, esp_now, transport, SystemClock, Delay)?;
//! hub.supervise().await
//! ```
//!
//! ### Sensor node
//!
//! [`node::SensorNode`] reads its [`sensors::Sensor`]s, filters the values
//! through the [`node::SendPolicy`] and sends one frame per cycle.
//!
//! ```ignore
//! let config = NodeConfig::from_json(NODE_JSON)?;
//! let mut node = SensorNode::new(&config, esp_now, i2c, Delay, nvs, rtc)?;
//! let pause = node.run(reset_reason == PowerOn).await;
//! deep_sleep(pause);
//! ```

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod fmt;

pub mod client;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod hub;
pub mod node;
pub mod packet;
pub mod radio;
pub mod sensors;
pub mod storage;
pub mod transport;
pub mod util;

#[cfg(test)]
mod testing;

/// Devices a hub can serve.
pub const MAX_DEVICES: usize = 16;
/// Sensors per device.
pub const MAX_SENSORS: usize = 4;
/// Properties per sensor.
pub const MAX_PROPERTIES: usize = 8;
/// Longest MQTT topic.
pub const MAX_TOPIC_LEN: usize = 128;
/// Largest radio frame payload.
pub const MAX_FRAME_LEN: usize = 250;

// Re-export key types for easier access at the crate root.
pub use client::{MqttClient, MqttEvent, MqttOptions};
pub use clock::{Clock, SystemClock};
pub use config::{HubConfig, NodeConfig};
pub use error::Error;
pub use hub::Hub;
pub use node::SensorNode;
pub use transport::TcpTransport;
