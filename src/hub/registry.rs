//! Per-device liveness and discovery bookkeeping for the hub.

use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::MAX_DEVICES;
use crate::device::{Device, DeviceId};

// Every (sensor, property) pair of a device gets one bit.
const _: () = assert!(crate::MAX_SENSORS * crate::MAX_PROPERTIES <= 32);

#[derive(Debug)]
struct Entry {
    id: DeviceId,
    timeout: Duration,
    /// `Some` while the device is online.
    last_receive: Option<Instant>,
    announced: bool,
    discovered: u32,
}

/// Liveness table of every configured device, plus the record of what
/// discovery documents were already published in this run.
///
/// A device is online exactly while it has a last-receive time. The sweep
/// clears that time, so each outage is reported once.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    entries: Vec<Entry, MAX_DEVICES>,
}

impl DeviceRegistry {
    pub fn new(devices: &[Device]) -> Self {
        let mut entries = Vec::new();
        for device in devices.iter().take(MAX_DEVICES) {
            let _ = entries.push(Entry {
                id: device.id.clone(),
                timeout: device.liveness_timeout,
                last_receive: None,
                announced: false,
                discovered: 0,
            });
        }
        Self { entries }
    }

    /// Forgets all liveness and discovery state.
    pub fn reset(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.last_receive = None;
            entry.announced = false;
            entry.discovered = 0;
        }
    }

    fn entry_mut(&mut self, id: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    /// Records a receive. Returns `true` when the device was offline.
    pub fn mark_seen(&mut self, id: &str, now: Instant) -> bool {
        let Some(entry) = self.entry_mut(id) else {
            return false;
        };
        entry.last_receive.replace(now).is_none()
    }

    /// Takes every device silent for longer than its timeout offline and
    /// returns their ids.
    pub fn sweep_stale(&mut self, now: Instant) -> Vec<DeviceId, MAX_DEVICES> {
        let mut stale = Vec::new();
        for entry in self.entries.iter_mut() {
            let Some(last) = entry.last_receive else {
                continue;
            };
            let silent = now
                .checked_duration_since(last)
                .unwrap_or(Duration::from_ticks(0));
            if silent > entry.timeout {
                entry.last_receive = None;
                let _ = stale.push(entry.id.clone());
            }
        }
        stale
    }

    pub fn is_online(&self, id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.id == id && e.last_receive.is_some())
    }

    /// Marks entity `index` of the device as published. `false` when it
    /// already was.
    pub fn mark_discovered(&mut self, id: &str, index: usize) -> bool {
        let Some(entry) = self.entry_mut(id) else {
            return false;
        };
        let bit = 1u32 << index;
        let fresh = entry.discovered & bit == 0;
        entry.discovered |= bit;
        fresh
    }

    /// Marks the device's initial status as published. `false` when it
    /// already was.
    pub fn mark_announced(&mut self, id: &str) -> bool {
        match self.entry_mut(id) {
            Some(entry) => !core::mem::replace(&mut entry.announced, true),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
