//! # Error Types
//!
//! Errors are split by how far they travel. `MqttError` stays inside the broker
//! session, which answers it with reconnects. `StorageError` is downgraded to
//! "no record" by its callers. [`Error`] is what unwinds a hub or node run and
//! ends up in the supervisor.

use crate::config::ConfigError;
use crate::sensors::SensorError;

/// The error enum for the MQTT client.
///
/// It is generic over the transport error type `T`, allowing it to wrap
/// specific errors from the underlying network transport.
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttError<T> {
    /// An error occurred in the underlying transport layer.
    Transport(T),
    /// A protocol-level error occurred, indicating a violation of the MQTT protocol.
    Protocol(ProtocolError),
    /// The connection was refused by the broker. The enclosed code provides the reason.
    ConnectionRefused(ConnectReasonCode),
    /// The client is not currently connected to the broker.
    NotConnected,
    /// The buffer provided for an operation was too small.
    BufferTooSmall,
}

impl<T> MqttError<T> {
    /// Re-types an error produced by transport-free packet code.
    pub fn from_codec(err: CodecError) -> Self {
        match err {
            MqttError::Transport(never) => match never {},
            MqttError::Protocol(p) => MqttError::Protocol(p),
            MqttError::ConnectionRefused(c) => MqttError::ConnectionRefused(c),
            MqttError::NotConnected => MqttError::NotConnected,
            MqttError::BufferTooSmall => MqttError::BufferTooSmall,
        }
    }

    /// Whether the failure is local to the current connection and a reconnect
    /// can fix it.
    pub fn is_recoverable(&self) -> bool {
        match self {
            MqttError::Protocol(ProtocolError::ConnectionClosed) => true,
            MqttError::Protocol(_) | MqttError::BufferTooSmall => false,
            _ => true,
        }
    }
}

/// Packet encoding and decoding never touch a transport.
pub type CodecError = MqttError<core::convert::Infallible>;

/// Represents the reason codes for a connection refusal (`CONNACK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReasonCode {
    /// The connection was accepted.
    Success,
    /// The broker does not support the requested MQTT protocol version.
    UnacceptableProtocolVersion,
    /// The client identifier is not valid.
    IdentifierRejected,
    /// The broker is unavailable.
    ServerUnavailable,
    /// The username or password is not valid.
    BadUserNameOrPassword,
    /// The client is not authorized to connect.
    NotAuthorized,
    /// An unknown or unspecified error occurred.
    Other(u8),
}

impl From<u8> for ConnectReasonCode {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Success,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => Self::Other(val),
        }
    }
}

/// Enumerates specific MQTT protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// An invalid packet type was received.
    InvalidPacketType(u8),
    /// The server sent an invalid or unexpected response.
    InvalidResponse,
    /// The connection was closed by the broker.
    ConnectionClosed,
    /// A packet was received that was not correctly formed.
    MalformedPacket,
    /// The payload of a message exceeds the maximum allowable size.
    PayloadTooLarge,
    /// A string was not valid UTF-8.
    InvalidUtf8String,
}

/// Conditions that end the current run because retrying cannot fix them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolViolation {
    /// The broker sent bytes that do not parse as MQTT.
    Mqtt(ProtocolError),
    /// A radio frame from an allow-listed peer is not a measurement document.
    MalformedFrame,
    /// An outgoing frame or payload does not fit its fixed buffer.
    FrameTooLarge,
}

/// Errors that terminate a hub or sensor node run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The radio reported a hardware-level failure and must be re-initialized.
    Radio,
    /// The broker could not be reached within a bounded retry policy.
    Transport,
    /// See [`ProtocolViolation`].
    Protocol(ProtocolViolation),
    /// See [`ConfigError`].
    Configuration(ConfigError),
    /// A sensor failed to produce a measurement.
    Sensor(SensorError),
}

impl From<ProtocolViolation> for Error {
    fn from(err: ProtocolViolation) -> Self {
        Error::Protocol(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Configuration(err)
    }
}

impl From<SensorError> for Error {
    fn from(err: SensorError) -> Self {
        Error::Sensor(err)
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Radio => write!(f, "radio failure"),
            Error::Transport => write!(f, "broker unreachable"),
            Error::Protocol(v) => write!(f, "protocol violation: {:?}", v),
            Error::Configuration(e) => write!(f, "invalid configuration: {:?}", e),
            Error::Sensor(e) => write!(f, "sensor failure: {:?}", e),
        }
    }
}
