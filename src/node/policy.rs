//! Decides which measured properties are worth a transmission.

use embassy_time::Instant;
use heapless::LinearMap;

use super::cache::{CacheEntry, ValueCache};
use crate::MAX_PROPERTIES;
use crate::config::SendConfig;
use crate::device::Property;
use crate::sensors::{Reading, round_to};
use crate::storage::KeyValueStore;

pub type SendConfigs = LinearMap<Property, SendConfig, MAX_PROPERTIES>;

/// A value is sent when nothing was sent before, when it moved by at least
/// the diff threshold, or when the last send is at least the time threshold
/// old. A clock that went backwards counts as old.
pub fn should_send(value: f64, last: Option<&CacheEntry>, config: &SendConfig, now: Instant) -> bool {
    let Some(last) = last else {
        return true;
    };
    let diff = value - last.value;
    let diff = if diff < 0.0 { -diff } else { diff };
    if round_to(diff, 10) >= config.diff_threshold {
        return true;
    }
    now.checked_duration_since(last.sent_at)
        .is_none_or(|elapsed| elapsed >= config.time_threshold)
}

/// [`should_send`] over whole readings, backed by the [`ValueCache`].
pub struct SendPolicy<S: KeyValueStore> {
    cache: ValueCache<S>,
}

impl<S: KeyValueStore> SendPolicy<S> {
    pub fn new(store: S) -> Self {
        Self {
            cache: ValueCache::new(store),
        }
    }

    pub fn store_mut(&mut self) -> &mut S {
        self.cache.store_mut()
    }

    /// The part of `reading` to transmit. Properties without a send
    /// config always pass. Does not touch the cache.
    pub fn filter(&mut self, sensor_id: &str, reading: &Reading, configs: &SendConfigs, now: Instant) -> Reading {
        let mut selected = Reading::new();
        for (property, value) in reading.iter() {
            let keep = match configs.get(property) {
                None => true,
                Some(config) => {
                    let last = self.cache.get(sensor_id, *property);
                    should_send(*value, last.as_ref(), config, now)
                }
            };
            if keep {
                let _ = selected.insert(*property, *value);
            }
        }
        selected
    }

    /// Records a confirmed transmission of `sent`. Only configured
    /// properties are cached.
    pub fn commit(&mut self, sensor_id: &str, sent: &Reading, configs: &SendConfigs, now: Instant) {
        for (property, value) in sent.iter() {
            if configs.contains_key(property) {
                self.cache.set(sensor_id, *property, CacheEntry {
                    value: *value,
                    sent_at: now,
                });
            }
        }
    }
}
