//! # Key-Value Storage
//!
//! Non-volatile data (value cache, sensor calibration) is addressed by a
//! `(namespace, key)` pair, mirroring flash NVS partitions. A missing entry
//! is `Ok(None)`; only real medium failures are errors, and callers treat
//! those as a missing entry too.

use heapless::{String, Vec};

/// Longest namespace or key accepted by flash NVS backends.
pub const MAX_KEY_LEN: usize = 15;

/// Largest value [`MemoryStore`] keeps.
pub const MAX_VALUE_LEN: usize = 96;

pub trait KeyValueStore {
    type Error: core::fmt::Debug;

    /// Copies the value into `buf` and returns its length, or `None` when
    /// nothing is stored under the key.
    fn read(
        &mut self,
        namespace: &str,
        key: &str,
        buf: &mut [u8],
    ) -> Result<Option<usize>, Self::Error>;

    /// Stores the value durably before returning.
    fn write(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), Self::Error>;
}

impl<S: KeyValueStore> KeyValueStore for &mut S {
    type Error = S::Error;

    fn read(
        &mut self,
        namespace: &str,
        key: &str,
        buf: &mut [u8],
    ) -> Result<Option<usize>, Self::Error> {
        (**self).read(namespace, key, buf)
    }

    fn write(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), Self::Error> {
        (**self).write(namespace, key, value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StorageError {
    /// No free slot left for a new key.
    Full,
    KeyTooLong,
    ValueTooLarge,
    /// The caller's buffer cannot hold the stored value.
    BufferTooSmall,
}

struct Entry {
    namespace: String<MAX_KEY_LEN>,
    key: String<MAX_KEY_LEN>,
    value: Vec<u8, MAX_VALUE_LEN>,
}

/// RAM-backed store with room for `N` entries.
///
/// Survives nothing but a soft restart of the run; boards without flash
/// storage and tests use it.
pub struct MemoryStore<const N: usize> {
    entries: Vec<Entry, N>,
}

impl<const N: usize> Default for MemoryStore<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> MemoryStore<N> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, namespace: &str, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.namespace == namespace && e.key == key)
    }
}

impl<const N: usize> KeyValueStore for MemoryStore<N> {
    type Error = StorageError;

    fn read(
        &mut self,
        namespace: &str,
        key: &str,
        buf: &mut [u8],
    ) -> Result<Option<usize>, StorageError> {
        let Some(idx) = self.find(namespace, key) else {
            return Ok(None);
        };
        let value = &self.entries[idx].value;
        buf.get_mut(..value.len())
            .ok_or(StorageError::BufferTooSmall)?
            .copy_from_slice(value);
        Ok(Some(value.len()))
    }

    fn write(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let value = Vec::from_slice(value).map_err(|_| StorageError::ValueTooLarge)?;
        if let Some(idx) = self.find(namespace, key) {
            self.entries[idx].value = value;
            return Ok(());
        }
        let entry = Entry {
            namespace: String::try_from(namespace).map_err(|_| StorageError::KeyTooLong)?,
            key: String::try_from(key).map_err(|_| StorageError::KeyTooLong)?,
            value,
        };
        self.entries.push(entry).map_err(|_| StorageError::Full)
    }
}
