//! # Radio Link
//!
//! Point-to-point radio (ESP-NOW style) between sensor nodes and the hub.
//! [`RadioDriver`] is the seam to the hardware binding; [`RadioLink`] adds the
//! peer allow-list and the signal-strength table on top of it.
//!
//! Admission is "sender is a registered peer". A link key only switches on
//! encryption for that peer.

use embassy_futures::select::{Either, select};
use embassy_time::Duration;
use embedded_hal_async::delay::DelayNs;
use heapless::{LinearMap, Vec};

use crate::device::{LinkAddress, LinkKey};
use crate::error::Error;
use crate::{MAX_DEVICES, MAX_FRAME_LEN};

/// Metadata of a frame the driver copied into the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FrameInfo {
    pub sender: LinkAddress,
    pub len: usize,
    /// Received signal strength in dBm, when the hardware reports it.
    pub rssi: Option<i16>,
}

/// Hardware binding of the radio.
#[allow(async_fn_in_trait)]
pub trait RadioDriver {
    type Error: core::fmt::Debug;

    fn activate(&mut self) -> Result<(), Self::Error>;

    fn deactivate(&mut self);

    fn set_primary_key(&mut self, key: &LinkKey) -> Result<(), Self::Error>;

    /// Registers a peer, encrypting traffic with it when `key` is given.
    fn add_peer(&mut self, address: LinkAddress, key: Option<&LinkKey>) -> Result<(), Self::Error>;

    /// Resolves once a frame is queued or the hardware reported an error.
    async fn wait_readable(&mut self) -> Result<(), Self::Error>;

    /// Pops one queued frame without blocking.
    fn try_receive(&mut self, buf: &mut [u8]) -> Result<Option<FrameInfo>, Self::Error>;

    /// Sends one frame and reports whether the peer acknowledged it.
    async fn send(&mut self, address: LinkAddress, data: &[u8]) -> Result<(), Self::Error>;
}

/// A frame from an allow-listed peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioFrame {
    pub sender: LinkAddress,
    pub data: Vec<u8, MAX_FRAME_LEN>,
}

pub struct RadioLink<R: RadioDriver> {
    driver: R,
    peers: Vec<LinkAddress, MAX_DEVICES>,
    signal: LinearMap<LinkAddress, i16, MAX_DEVICES>,
}

impl<R: RadioDriver> RadioLink<R> {
    pub fn new(driver: R) -> Self {
        Self {
            driver,
            peers: Vec::new(),
            signal: LinearMap::new(),
        }
    }

    /// Power-cycles the radio and forgets every peer.
    pub fn start(&mut self, primary_key: Option<&LinkKey>) -> Result<(), Error> {
        self.peers.clear();
        self.signal.clear();
        self.driver.deactivate();
        self.driver.activate().map_err(|_| {
            error!("radio: activation failed");
            Error::Radio
        })?;
        if let Some(key) = primary_key {
            self.driver.set_primary_key(key).map_err(|_| {
                error!("radio: cannot set primary key");
                Error::Radio
            })?;
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.driver.deactivate();
    }

    pub fn register_peer(&mut self, address: LinkAddress, key: Option<&LinkKey>) -> Result<(), Error> {
        if self.peers.contains(&address) {
            return Ok(());
        }
        self.driver.add_peer(address, key).map_err(|_| {
            error!("radio: cannot add peer");
            Error::Radio
        })?;
        self.peers.push(address).map_err(|_| Error::Radio)
    }

    pub fn is_allowed(&self, address: &LinkAddress) -> bool {
        self.peers.contains(address)
    }

    /// Last signal strength seen from `address`, in dBm.
    pub fn signal_strength(&self, address: &LinkAddress) -> Option<i16> {
        self.signal.get(address).copied()
    }

    pub async fn wait_readable(&mut self) -> Result<(), Error> {
        self.driver.wait_readable().await.map_err(|_| {
            error!("radio: receive failed");
            Error::Radio
        })
    }

    /// Next queued frame from an allow-listed peer. Frames from anyone else
    /// are dropped on the way.
    pub fn try_receive(&mut self) -> Result<Option<RadioFrame>, Error> {
        let mut buf = [0u8; MAX_FRAME_LEN];
        loop {
            let info = self.driver.try_receive(&mut buf).map_err(|_| {
                error!("radio: receive failed");
                Error::Radio
            })?;
            let Some(info) = info else {
                return Ok(None);
            };
            if !self.is_allowed(&info.sender) {
                debug!("radio: dropping frame from unknown peer");
                continue;
            }
            if let Some(rssi) = info.rssi {
                // The sender is a registered peer, so it has a slot.
                let _ = self.signal.insert(info.sender, rssi);
            }
            let len = info.len.min(MAX_FRAME_LEN);
            let data = Vec::from_slice(&buf[..len]).map_err(|_| Error::Radio)?;
            return Ok(Some(RadioFrame {
                sender: info.sender,
                data,
            }));
        }
    }

    /// Waits up to `timeout` for a frame from an allow-listed peer.
    pub async fn receive<D: DelayNs>(
        &mut self,
        delay: &mut D,
        timeout: Duration,
    ) -> Result<Option<RadioFrame>, Error> {
        if let Some(frame) = self.try_receive()? {
            return Ok(Some(frame));
        }
        if timeout == Duration::from_ticks(0) {
            return Ok(None);
        }
        let ms = timeout.as_millis().min(u32::MAX as u64) as u32;
        match select(self.wait_readable(), delay.delay_ms(ms)).await {
            Either::First(ready) => {
                ready?;
                self.try_receive()
            }
            Either::Second(()) => Ok(None),
        }
    }

    /// Sends without retrying. `false` on any radio or link failure.
    pub async fn send(&mut self, address: LinkAddress, data: &[u8]) -> bool {
        match self.driver.send(address, data).await {
            Ok(()) => true,
            Err(_) => {
                warn!("radio: send failed");
                false
            }
        }
    }
}
