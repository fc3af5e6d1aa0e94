//! Last transmitted value of each `(sensor, property)`, kept in
//! non-volatile storage so it survives deep sleep.
//!
//! Entries live under namespace = sensor id, key = property name, as the
//! text `"<value>,<millis>"`.

use core::fmt::Write;

use embassy_time::Instant;
use heapless::String;

use crate::device::Property;
use crate::storage::{KeyValueStore, MAX_VALUE_LEN};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheEntry {
    pub value: f64,
    pub sent_at: Instant,
}

impl CacheEntry {
    fn parse(text: &str) -> Option<Self> {
        let (value, millis) = text.trim().split_once(',')?;
        Some(Self {
            value: value.parse().ok()?,
            sent_at: Instant::from_millis(millis.parse().ok()?),
        })
    }
}

pub struct ValueCache<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore> ValueCache<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// `None` when nothing usable is stored. Read failures and garbage
    /// count as nothing stored.
    pub fn get(&mut self, sensor_id: &str, property: Property) -> Option<CacheEntry> {
        let mut buf = [0u8; MAX_VALUE_LEN];
        let len = match self.store.read(sensor_id, property.as_str(), &mut buf) {
            Ok(len) => len?,
            Err(_) => {
                warn!("cache: cannot read {}/{}", sensor_id, property.as_str());
                return None;
            }
        };
        let entry = core::str::from_utf8(&buf[..len])
            .ok()
            .and_then(CacheEntry::parse);
        if entry.is_none() {
            warn!("cache: ignoring corrupt {}/{}", sensor_id, property.as_str());
        }
        entry
    }

    /// Returns whether the entry was stored.
    pub fn set(&mut self, sensor_id: &str, property: Property, entry: CacheEntry) -> bool {
        let mut text = String::<48>::new();
        if write!(text, "{},{}", entry.value, entry.sent_at.as_millis()).is_err() {
            return false;
        }
        match self.store.write(sensor_id, property.as_str(), text.as_bytes()) {
            Ok(()) => true,
            Err(_) => {
                warn!("cache: cannot write {}/{}", sensor_id, property.as_str());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn stored_as_value_and_millis() {
        let mut cache = ValueCache::new(MemoryStore::<4>::new());
        let entry = CacheEntry {
            value: 21.2,
            sent_at: Instant::from_millis(3000),
        };

        assert!(cache.set("inside", Property::Temperature, entry));

        let mut buf = [0u8; 16];
        let len = cache
            .store_mut()
            .read("inside", "temperature", &mut buf)
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"21.2,3000");
        assert_eq!(cache.get("inside", Property::Temperature), Some(entry));
        assert_eq!(cache.get("inside", Property::Humidity), None);
    }

    #[test]
    fn corrupt_entry_reads_as_missing() {
        let mut store = MemoryStore::<4>::new();
        store.write("inside", "temperature", b"21.2").unwrap();
        store.write("inside", "humidity", b"abc,12").unwrap();
        let mut cache = ValueCache::new(store);

        assert_eq!(cache.get("inside", Property::Temperature), None);
        assert_eq!(cache.get("inside", Property::Humidity), None);
    }

    #[test]
    fn full_store_is_not_fatal() {
        let mut cache = ValueCache::new(MemoryStore::<1>::new());
        let entry = CacheEntry {
            value: 1.0,
            sent_at: Instant::from_millis(0),
        };
        assert!(cache.set("a", Property::Pressure, entry));
        assert!(!cache.set("b", Property::Pressure, entry));
    }
}
