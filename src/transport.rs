//! # MQTT Transport Abstraction
//!
//! This module defines the `MqttTransport` trait, which abstracts the stream
//! the broker session talks over, plus a TCP implementation on `embassy-net`.
//!
//! Besides plain send/receive the session needs to reopen the stream after a
//! failure and to wait for readability without consuming bytes, because the
//! hub multiplexes the broker with the radio.

use embassy_net::IpEndpoint;
use embassy_net::tcp::{ConnectError, Error as TcpError, TcpSocket};
use embassy_time::{Duration, Timer};
use embedded_io_async::Write;

/// A trait representing a reconnectable transport for MQTT packets.
#[allow(async_fn_in_trait)]
pub trait MqttTransport {
    /// The error type returned by the transport.
    type Error: core::fmt::Debug;

    /// (Re)opens the stream to the broker, dropping any previous connection.
    async fn open(&mut self) -> Result<(), Self::Error>;

    /// Closes the stream. Safe to call when already closed.
    fn close(&mut self);

    /// Sends a buffer of data over the transport.
    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    /// Receives data from the transport into a buffer.
    ///
    /// Returns the number of bytes read.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    /// Resolves once `recv` would not block, including when the peer hung up.
    async fn wait_readable(&mut self);

    /// Non-blocking readability check.
    fn is_readable(&self) -> bool;
}

/// Errors of [`TcpTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TcpTransportError {
    /// The TCP handshake failed.
    Connect(ConnectError),
    /// Reading or writing the socket failed.
    Io(TcpError),
    /// The peer closed the connection.
    Closed,
    /// No data arrived within the read timeout.
    Timeout,
}

/// TCP transport implementation using `embassy-net`.
pub struct TcpTransport<'a> {
    socket: TcpSocket<'a>,
    remote: IpEndpoint,
    timeout: Duration,
}

impl<'a> TcpTransport<'a> {
    /// Creates a new `TcpTransport` for the broker at `remote`.
    ///
    /// `timeout` bounds every read issued by the MQTT client.
    pub fn new(socket: TcpSocket<'a>, remote: IpEndpoint, timeout: Duration) -> Self {
        Self {
            socket,
            remote,
            timeout,
        }
    }

    /// A helper function to perform a read with a timeout.
    async fn read_with_timeout(&mut self, buf: &mut [u8]) -> Result<usize, TcpTransportError> {
        // Use `select` to race the read operation against a timer.
        let read_fut = self.socket.read(buf);
        let timer = Timer::after(self.timeout);

        match futures::future::select(core::pin::pin!(read_fut), core::pin::pin!(timer)).await {
            futures::future::Either::Left((Ok(0), _)) => {
                // If the peer closes the connection, read returns 0.
                debug!("tcp: connection closed by peer");
                Err(TcpTransportError::Closed)
            }
            futures::future::Either::Left((Ok(n), _)) => {
                trace!("tcp: read {} bytes", n);
                Ok(n)
            }
            futures::future::Either::Left((Err(e), _)) => Err(TcpTransportError::Io(e)),
            futures::future::Either::Right(((), _)) => Err(TcpTransportError::Timeout),
        }
    }
}

impl MqttTransport for TcpTransport<'_> {
    type Error = TcpTransportError;

    async fn open(&mut self) -> Result<(), Self::Error> {
        self.socket.abort();
        let _ = self.socket.flush().await;
        self.socket
            .connect(self.remote)
            .await
            .map_err(TcpTransportError::Connect)
    }

    fn close(&mut self) {
        self.socket.close();
        self.socket.abort();
    }

    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        trace!("tcp: write {} bytes", buf.len());
        self.socket
            .write_all(buf)
            .await
            .map_err(TcpTransportError::Io)?;

        // Flush to ensure data is actually sent to the network
        self.socket.flush().await.map_err(TcpTransportError::Io)
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        self.read_with_timeout(buf).await
    }

    async fn wait_readable(&mut self) {
        // Also resolves once the peer closed the stream, so the session notices.
        self.socket.wait_read_ready().await
    }

    fn is_readable(&self) -> bool {
        self.socket.can_recv() || !self.socket.may_recv()
    }
}
