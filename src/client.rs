//! # MQTT Client
//!
//! A small MQTT 3.1.1 client that owns its transport and two fixed buffers.
//! It only speaks what the hub needs: CONNECT with a last will, QoS 0
//! PUBLISH, PINGREQ and DISCONNECT. Incoming packets are read one at a time
//! through [`MqttClient::poll`].

use embassy_time::Duration;
use heapless::String;

use crate::error::{ConnectReasonCode, MqttError, ProtocolError};
use crate::packet::{
    self, Connect, Disconnect, EncodePacket, LastWill, MqttPacket, PingReq, Publish, QoS,
};
use crate::transport::MqttTransport;
use crate::util;

/// Capacity of a client identifier.
pub const MAX_CLIENT_ID_LEN: usize = 32;
/// Capacity of a broker user name.
pub const MAX_USERNAME_LEN: usize = 64;
/// Capacity of a broker password.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Last will registered with the broker on every connect.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String<{ crate::MAX_TOPIC_LEN }>,
    pub message: &'static [u8],
    pub retain: bool,
}

/// Connection options for [`MqttClient`].
#[derive(Debug, Clone)]
pub struct MqttOptions {
    client_id: String<MAX_CLIENT_ID_LEN>,
    keep_alive: Duration,
    username: Option<String<MAX_USERNAME_LEN>>,
    password: Option<String<MAX_PASSWORD_LEN>>,
    will: Option<Will>,
}

impl MqttOptions {
    pub fn new(client_id: String<MAX_CLIENT_ID_LEN>) -> Self {
        Self {
            client_id,
            keep_alive: Duration::from_secs(60),
            username: None,
            password: None,
            will: None,
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_credentials(
        mut self,
        username: String<MAX_USERNAME_LEN>,
        password: String<MAX_PASSWORD_LEN>,
    ) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }

    pub fn with_will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

/// What [`MqttClient::poll`] read from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttEvent {
    PingResp,
    /// A message on a topic we never subscribed to. Its content is dropped.
    Publish,
    /// Any other well-formed packet.
    Other,
}

pub struct MqttClient<T, const BUF_SIZE: usize>
where
    T: MqttTransport,
{
    transport: T,
    options: MqttOptions,
    connected: bool,
    tx_buffer: [u8; BUF_SIZE],
    rx_buffer: [u8; BUF_SIZE],
}

impl<T, const BUF_SIZE: usize> MqttClient<T, BUF_SIZE>
where
    T: MqttTransport,
{
    pub fn new(transport: T, options: MqttOptions) -> Self {
        Self {
            transport,
            options,
            connected: false,
            tx_buffer: [0; BUF_SIZE],
            rx_buffer: [0; BUF_SIZE],
        }
    }

    pub fn options(&self) -> &MqttOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Opens the transport and performs the CONNECT/CONNACK handshake.
    pub async fn connect(&mut self, clean_session: bool) -> Result<(), MqttError<T::Error>> {
        self.connected = false;
        self.transport.open().await.map_err(MqttError::Transport)?;

        let keep_alive = self.options.keep_alive.as_secs().min(u16::MAX as u64) as u16;
        let mut connect = Connect::new(&self.options.client_id, keep_alive, clean_session);
        connect.will = self.options.will.as_ref().map(|will| LastWill {
            topic: will.topic.as_str(),
            message: will.message,
            qos: QoS::AtMostOnce,
            retain: will.retain,
        });
        connect.username = self.options.username.as_deref();
        connect.password = self.options.password.as_ref().map(|p| p.as_bytes());

        let len = connect
            .encode(&mut self.tx_buffer)
            .map_err(MqttError::from_codec)?;
        self.transport
            .send(&self.tx_buffer[..len])
            .await
            .map_err(MqttError::Transport)?;

        let len = self.read_packet().await?;
        match packet::decode(&self.rx_buffer[..len]).map_err(MqttError::from_codec)? {
            Some(MqttPacket::ConnAck(ack)) if ack.reason_code == 0 => {
                debug!("mqtt: connected as {}", self.options.client_id.as_str());
                self.connected = true;
                Ok(())
            }
            Some(MqttPacket::ConnAck(ack)) => {
                warn!("mqtt: connection refused with code {}", ack.reason_code);
                self.transport.close();
                Err(MqttError::ConnectionRefused(ConnectReasonCode::from(
                    ack.reason_code,
                )))
            }
            _ => {
                self.transport.close();
                Err(MqttError::Protocol(ProtocolError::InvalidResponse))
            }
        }
    }

    /// Publishes `payload` with QoS 0.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), MqttError<T::Error>> {
        if !self.connected {
            return Err(MqttError::NotConnected);
        }
        let publish = Publish {
            topic,
            qos: QoS::AtMostOnce,
            retain,
            payload,
            packet_id: None,
        };
        let len = publish
            .encode(&mut self.tx_buffer)
            .map_err(MqttError::from_codec)?;
        trace!("mqtt: publish {} ({} bytes)", topic, payload.len());
        self.send(len).await
    }

    /// Sends PINGREQ. The PINGRESP is picked up later by [`Self::poll`].
    pub async fn ping(&mut self) -> Result<(), MqttError<T::Error>> {
        if !self.connected {
            return Err(MqttError::NotConnected);
        }
        let len = PingReq
            .encode(&mut self.tx_buffer)
            .map_err(MqttError::from_codec)?;
        self.send(len).await
    }

    /// Sends DISCONNECT when connected, then closes the transport.
    pub async fn disconnect(&mut self) {
        if self.connected
            && let Ok(len) = Disconnect.encode(&mut self.tx_buffer)
        {
            let _ = self.transport.send(&self.tx_buffer[..len]).await;
        }
        self.close();
    }

    /// Drops the connection without telling the broker.
    pub fn close(&mut self) {
        self.connected = false;
        self.transport.close();
    }

    /// Pending forever while disconnected.
    pub async fn wait_readable(&mut self) {
        if !self.connected {
            core::future::pending::<()>().await;
        }
        self.transport.wait_readable().await
    }

    pub fn is_readable(&self) -> bool {
        self.connected && self.transport.is_readable()
    }

    /// Reads and decodes exactly one packet from the broker.
    pub async fn poll(&mut self) -> Result<MqttEvent, MqttError<T::Error>> {
        if !self.connected {
            return Err(MqttError::NotConnected);
        }
        let len = self.read_packet().await?;
        let event = match packet::decode(&self.rx_buffer[..len]).map_err(MqttError::from_codec)? {
            Some(MqttPacket::PingResp) => MqttEvent::PingResp,
            Some(MqttPacket::Publish(publish)) => {
                debug!("mqtt: ignoring message on {}", publish.topic);
                MqttEvent::Publish
            }
            _ => MqttEvent::Other,
        };
        Ok(event)
    }

    async fn send(&mut self, len: usize) -> Result<(), MqttError<T::Error>> {
        if let Err(e) = self.transport.send(&self.tx_buffer[..len]).await {
            self.connected = false;
            return Err(MqttError::Transport(e));
        }
        Ok(())
    }

    /// Reads one whole packet into the receive buffer and returns its length.
    async fn read_packet(&mut self) -> Result<usize, MqttError<T::Error>> {
        self.read_exact(0, 1).await?;

        // Remaining length: up to four bytes, each with a continuation bit.
        let mut header_len = 1;
        loop {
            if header_len > 4 {
                return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
            }
            self.read_exact(header_len, header_len + 1).await?;
            header_len += 1;
            if self.rx_buffer[header_len - 1] & 0x80 == 0 {
                break;
            }
        }

        let mut cursor = 1;
        let remaining = util::read_variable_byte_integer(&mut cursor, &self.rx_buffer[..header_len])
            .map_err(MqttError::from_codec)?;
        let total = header_len + remaining;
        if total > BUF_SIZE {
            return Err(MqttError::Protocol(ProtocolError::PayloadTooLarge));
        }
        self.read_exact(header_len, total).await?;
        Ok(total)
    }

    async fn read_exact(&mut self, from: usize, to: usize) -> Result<(), MqttError<T::Error>> {
        if to > BUF_SIZE {
            return Err(MqttError::BufferTooSmall);
        }
        let mut pos = from;
        while pos < to {
            match self.transport.recv(&mut self.rx_buffer[pos..to]).await {
                Ok(0) => {
                    self.connected = false;
                    return Err(MqttError::Protocol(ProtocolError::ConnectionClosed));
                }
                Ok(n) => pos += n,
                Err(e) => {
                    self.connected = false;
                    return Err(MqttError::Transport(e));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::testing::MockBroker;

    fn options() -> MqttOptions {
        let will = Will {
            topic: String::try_from("mesh/status/hub").unwrap(),
            message: b"offline",
            retain: true,
        };
        MqttOptions::new(String::try_from("hub").unwrap())
            .with_keep_alive(Duration::from_secs(30))
            .with_will(will)
    }

    #[test]
    fn connect_registers_last_will() {
        let broker = MockBroker::new();
        let mut client = MqttClient::<_, 256>::new(broker.transport(), options());

        block_on(client.connect(true)).unwrap();

        assert!(client.is_connected());
        let connects = broker.connects();
        assert_eq!(connects.len(), 1);
        assert_eq!(connects[0].keep_alive, 30);
        assert!(connects[0].clean_session);
        assert_eq!(connects[0].will_topic.as_deref(), Some("mesh/status/hub"));
        assert!(connects[0].will_retain);
    }

    #[test]
    fn refused_connect_reports_reason() {
        let broker = MockBroker::new();
        broker.refuse_with(5);
        let mut client = MqttClient::<_, 256>::new(broker.transport(), options());

        let result = block_on(client.connect(false));

        assert!(matches!(
            result,
            Err(MqttError::ConnectionRefused(ConnectReasonCode::NotAuthorized))
        ));
        assert!(!client.is_connected());
    }

    #[test]
    fn publish_requires_connection() {
        let broker = MockBroker::new();
        let mut client = MqttClient::<_, 256>::new(broker.transport(), options());

        let result = block_on(client.publish("mesh/get/x", b"{}", false));

        assert!(matches!(result, Err(MqttError::NotConnected)));
        assert!(broker.publishes().is_empty());
    }

    #[test]
    fn ping_is_answered() {
        let broker = MockBroker::new();
        let mut client = MqttClient::<_, 256>::new(broker.transport(), options());
        block_on(client.connect(true)).unwrap();

        block_on(client.ping()).unwrap();

        assert!(client.is_readable());
        assert_eq!(block_on(client.poll()).unwrap(), MqttEvent::PingResp);
        assert!(!client.is_readable());
    }

    #[test]
    fn failed_send_drops_connection() {
        let broker = MockBroker::new();
        let mut client = MqttClient::<_, 256>::new(broker.transport(), options());
        block_on(client.connect(true)).unwrap();
        broker.fail_next_publishes(1);

        assert!(block_on(client.publish("t", b"x", false)).is_err());
        assert!(!client.is_connected());
    }
}
