//! # MQTT Packet Structures and Serialization
//!
//! MQTT 3.1.1 control packets used by the broker session, with the traits for
//! encoding them into and decoding them from a byte buffer.
//!
//! Encoders reserve four bytes for the remaining length, write the variable
//! header and payload, then compact the packet once the real length is known.

use crate::error::{CodecError, MqttError, ProtocolError};
use crate::util::{self, read_binary, read_u16, read_utf8_string, write_binary, write_utf8_string};

/// Represents the Quality of Service (QoS) levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    fn from_bits(bits: u8) -> Result<Self, CodecError> {
        match bits {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(MqttError::Protocol(ProtocolError::MalformedPacket)),
        }
    }
}

/// A trait for packets that can be encoded into a byte buffer.
pub trait EncodePacket {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError>;
}

/// A trait for packets that can be decoded from a byte buffer.
pub trait DecodePacket<'a>: Sized {
    fn decode(buf: &'a [u8]) -> Result<Self, CodecError>;
}

/// An enumeration of the MQTT control packets this crate speaks.
#[derive(Debug)]
pub enum MqttPacket<'a> {
    Connect(Connect<'a>),
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PingReq,
    PingResp,
    Disconnect,
}

/// Decodes one complete packet (fixed header included).
pub fn decode(buf: &[u8]) -> Result<Option<MqttPacket<'_>>, CodecError> {
    let Some(first) = buf.first() else {
        return Ok(None);
    };

    let packet_type = first >> 4;
    let packet = match packet_type {
        1 => MqttPacket::Connect(Connect::decode(buf)?),
        2 => MqttPacket::ConnAck(ConnAck::decode(buf)?),
        3 => MqttPacket::Publish(Publish::decode(buf)?),
        12 => MqttPacket::PingReq,
        13 => MqttPacket::PingResp,
        14 => MqttPacket::Disconnect,
        _ => {
            return Err(MqttError::Protocol(ProtocolError::InvalidPacketType(
                packet_type,
            )));
        }
    };

    Ok(Some(packet))
}

/// Space reserved after the fixed header byte for the remaining length.
const LEN_RESERVE: usize = 4;

/// Writes the fixed header and the remaining length in front of the content
/// that was written at `1 + LEN_RESERVE..end`, and compacts the packet.
fn finish(buf: &mut [u8], header: u8, end: usize) -> Result<usize, CodecError> {
    let content_start = 1 + LEN_RESERVE;
    let remaining_len = end - content_start;
    buf[0] = header;
    let len_bytes = util::write_variable_byte_integer_len(&mut buf[1..], remaining_len)?;
    let header_len = 1 + len_bytes;
    buf.copy_within(content_start..end, header_len);
    Ok(header_len + remaining_len)
}

/// Checks there is room for the reserved fixed header.
fn reserve(buf: &[u8]) -> Result<usize, CodecError> {
    if buf.len() < 1 + LEN_RESERVE {
        return Err(MqttError::BufferTooSmall);
    }
    Ok(1 + LEN_RESERVE)
}

/// Reads the remaining length and returns `(content_start, packet_end)`.
fn content_bounds(buf: &[u8]) -> Result<(usize, usize), CodecError> {
    let mut cursor = 1;
    let remaining_len = util::read_variable_byte_integer(&mut cursor, buf)?;
    let end = cursor + remaining_len;
    if end > buf.len() {
        return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
    }
    Ok((cursor, end))
}

fn byte_at(buf: &[u8], at: usize) -> Result<u8, CodecError> {
    buf.get(at)
        .copied()
        .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))
}

// --- CONNECT Packet ---

/// Message the broker publishes on our behalf when the connection drops uncleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastWill<'a> {
    pub topic: &'a str,
    pub message: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug)]
pub struct Connect<'a> {
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: &'a str,
    pub will: Option<LastWill<'a>>,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

impl<'a> Connect<'a> {
    pub fn new(client_id: &'a str, keep_alive: u16, clean_session: bool) -> Self {
        Self {
            client_id,
            keep_alive,
            clean_session,
            will: None,
            username: None,
            password: None,
        }
    }
}

const FLAG_CLEAN_SESSION: u8 = 0x02;
const FLAG_WILL: u8 = 0x04;
const FLAG_WILL_RETAIN: u8 = 0x20;
const FLAG_PASSWORD: u8 = 0x40;
const FLAG_USERNAME: u8 = 0x80;

impl EncodePacket for Connect<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let mut cursor = reserve(buf)?;
        // Protocol name and level 4 (MQTT 3.1.1).
        cursor += write_utf8_string(&mut buf[cursor..], "MQTT")?;

        let mut flags = 0;
        if self.clean_session {
            flags |= FLAG_CLEAN_SESSION;
        }
        if let Some(will) = &self.will {
            flags |= FLAG_WILL | ((will.qos as u8) << 3);
            if will.retain {
                flags |= FLAG_WILL_RETAIN;
            }
        }
        if self.username.is_some() {
            flags |= FLAG_USERNAME;
        }
        if self.password.is_some() {
            flags |= FLAG_PASSWORD;
        }
        let keep_alive = self.keep_alive.to_be_bytes();
        util::write_bytes(&mut cursor, buf, &[4, flags, keep_alive[0], keep_alive[1]])?;

        cursor += write_utf8_string(&mut buf[cursor..], self.client_id)?;
        if let Some(will) = &self.will {
            cursor += write_utf8_string(&mut buf[cursor..], will.topic)?;
            cursor += write_binary(&mut buf[cursor..], will.message)?;
        }
        if let Some(username) = self.username {
            cursor += write_utf8_string(&mut buf[cursor..], username)?;
        }
        if let Some(password) = self.password {
            cursor += write_binary(&mut buf[cursor..], password)?;
        }
        finish(buf, 0x10, cursor)
    }
}

impl<'a> DecodePacket<'a> for Connect<'a> {
    fn decode(buf: &'a [u8]) -> Result<Self, CodecError> {
        let (mut cursor, _) = content_bounds(buf)?;
        if read_utf8_string(&mut cursor, buf)? != "MQTT" {
            return Err(MqttError::Protocol(ProtocolError::InvalidResponse));
        }
        // Protocol level.
        cursor += 1;
        let flags = byte_at(buf, cursor)?;
        cursor += 1;
        let keep_alive = read_u16(&mut cursor, buf)?;
        let client_id = read_utf8_string(&mut cursor, buf)?;

        let will = if flags & FLAG_WILL != 0 {
            let topic = read_utf8_string(&mut cursor, buf)?;
            let message = read_binary(&mut cursor, buf)?;
            Some(LastWill {
                topic,
                message,
                qos: QoS::from_bits((flags >> 3) & 0x03)?,
                retain: flags & FLAG_WILL_RETAIN != 0,
            })
        } else {
            None
        };
        let username = if flags & FLAG_USERNAME != 0 {
            Some(read_utf8_string(&mut cursor, buf)?)
        } else {
            None
        };
        let password = if flags & FLAG_PASSWORD != 0 {
            Some(read_binary(&mut cursor, buf)?)
        } else {
            None
        };

        Ok(Self {
            clean_session: flags & FLAG_CLEAN_SESSION != 0,
            keep_alive,
            client_id,
            will,
            username,
            password,
        })
    }
}

// --- CONNACK Packet ---
#[derive(Debug)]
pub struct ConnAck {
    pub session_present: bool,
    pub reason_code: u8,
}

impl DecodePacket<'_> for ConnAck {
    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let (cursor, end) = content_bounds(buf)?;
        if end - cursor != 2 {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }
        Ok(Self {
            session_present: (byte_at(buf, cursor)? & 0x01) != 0,
            reason_code: byte_at(buf, cursor + 1)?,
        })
    }
}

// --- PUBLISH Packet ---
#[derive(Debug)]
pub struct Publish<'a> {
    pub topic: &'a str,
    pub qos: QoS,
    pub retain: bool,
    pub payload: &'a [u8],
    pub packet_id: Option<u16>,
}

impl<'a> DecodePacket<'a> for Publish<'a> {
    fn decode(buf: &'a [u8]) -> Result<Self, CodecError> {
        let flags = byte_at(buf, 0)? & 0x0F;
        let qos = QoS::from_bits((flags >> 1) & 0x03)?;
        let (mut cursor, end) = content_bounds(buf)?;

        let topic = read_utf8_string(&mut cursor, buf)?;
        let packet_id = if qos != QoS::AtMostOnce {
            Some(read_u16(&mut cursor, buf)?)
        } else {
            None
        };
        let payload = buf
            .get(cursor..end)
            .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?;

        Ok(Publish {
            topic,
            qos,
            retain: flags & 0x01 != 0,
            payload,
            packet_id,
        })
    }
}

impl EncodePacket for Publish<'_> {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let mut cursor = reserve(buf)?;

        cursor += write_utf8_string(&mut buf[cursor..], self.topic)?;

        // Packet ID (only for QoS > 0)
        if self.qos != QoS::AtMostOnce
            && let Some(id) = self.packet_id
        {
            util::write_bytes(&mut cursor, buf, &id.to_be_bytes())?;
        }
        util::write_bytes(&mut cursor, buf, self.payload)?;

        let mut header = 0x30 | ((self.qos as u8) << 1);
        if self.retain {
            header |= 0x01;
        }
        finish(buf, header, cursor)
    }
}

// --- PINGREQ Packet ---
#[derive(Debug)]
pub struct PingReq;

impl EncodePacket for PingReq {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        if buf.len() < 2 {
            return Err(MqttError::BufferTooSmall);
        }
        buf[0] = 0xC0;
        buf[1] = 0x00;
        Ok(2)
    }
}

// --- DISCONNECT Packet ---
#[derive(Debug)]
pub struct Disconnect;

impl EncodePacket for Disconnect {
    fn encode(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        if buf.len() < 2 {
            return Err(MqttError::BufferTooSmall);
        }
        buf[0] = 0xE0;
        buf[1] = 0x00;
        Ok(2)
    }
}
