//! Broker topic layout and Home Assistant discovery documents.

use core::fmt::Write;

use heapless::String;
use serde::Serialize;

use crate::MAX_TOPIC_LEN;
use crate::device::{Device, Property};
use crate::error::ProtocolViolation;

pub type Topic = String<MAX_TOPIC_LEN>;

/// Id used in the hub's own status topic.
pub const HUB_ID: &str = "hub";

// Prefix, device id and sensor id capacities keep every topic below
// MAX_TOPIC_LEN, so the writes below cannot overflow.

/// `{prefix}/status/{id}`: retained `online` / `offline`.
pub fn status_topic(prefix: &str, id: &str) -> Topic {
    let mut topic = Topic::new();
    let _ = write!(topic, "{}/status/{}", prefix, id);
    topic
}

/// `{prefix}/get/{device_id}`: state documents.
pub fn state_topic(prefix: &str, device_id: &str) -> Topic {
    let mut topic = Topic::new();
    let _ = write!(topic, "{}/get/{}", prefix, device_id);
    topic
}

/// `{prefix}/sensor/{device_id}/{sensor_id}-{property}/config`
pub fn discovery_topic(prefix: &str, device_id: &str, sensor_id: &str, property: Property) -> Topic {
    let mut topic = Topic::new();
    let _ = write!(
        topic,
        "{}/sensor/{}/{}-{}/config",
        prefix,
        device_id,
        sensor_id,
        property.as_str()
    );
    topic
}

#[derive(Serialize)]
struct Availability<'a> {
    topic: &'a str,
}

#[derive(Serialize)]
struct DeviceBlock<'a> {
    identifiers: [&'a str; 1],
    manufacturer: &'a str,
    model: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
struct Document<'a> {
    state_topic: &'a str,
    value_template: &'a str,
    state_class: &'static str,
    device: DeviceBlock<'a>,
    availability: [Availability<'a>; 2],
    availability_mode: &'static str,
    unique_id: &'a str,
    name: &'a str,
    unit_of_measurement: &'static str,
    device_class: &'static str,
    icon: &'static str,
}

/// Writes the discovery document of one `(sensor, property)` entity of
/// `device` into `buf` and returns its length.
pub fn write_document(
    prefix: &str,
    device: &Device,
    sensor_id: &str,
    property: Property,
    buf: &mut [u8],
) -> Result<usize, ProtocolViolation> {
    let mut identifier = String::<64>::new();
    let mut template = String::<64>::new();
    let mut unique_id = String::<96>::new();
    let mut name = String::<48>::new();
    let (p, id, prop) = (prefix, device.id.as_str(), property.as_str());
    write!(identifier, "{}-{}", p, id)
        .and_then(|_| write!(template, "{{{{ value_json.{}_{} }}}}", sensor_id, prop))
        .and_then(|_| write!(unique_id, "{}-{}-{}-{}", p, id, sensor_id, prop))
        .and_then(|_| write!(name, "{} {}", sensor_id, prop))
        .map_err(|_| ProtocolViolation::FrameTooLarge)?;

    let state_topic = state_topic(prefix, id);
    let device_status = status_topic(prefix, id);
    let hub_status = status_topic(prefix, HUB_ID);
    let document = Document {
        state_topic: &state_topic,
        value_template: &template,
        state_class: "measurement",
        device: DeviceBlock {
            identifiers: [identifier.as_str()],
            manufacturer: &device.manufacturer,
            model: &device.model,
            name: &device.name,
        },
        availability: [
            Availability {
                topic: &device_status,
            },
            Availability { topic: &hub_status },
        ],
        availability_mode: "all",
        unique_id: &unique_id,
        name: &name,
        unit_of_measurement: property.unit(),
        device_class: prop,
        icon: property.icon(),
    };
    serde_json_core::to_slice(&document, buf).map_err(|_| ProtocolViolation::FrameTooLarge)
}
