//! Persistence of the address map and group assignments.
//!
//! The bridge does not own a storage medium. It talks to a small
//! key/value port ([`KeyValueStore`]) that the firmware backs with flash
//! and tests back with [`MemoryStore`].
//!
//! | key | content |
//! |-----|---------|
//! | `DALIAddrMap` | array of 30-byte [`AddressRecord`]s |
//! | `DALIGroups` | group assignment JSON (`{"0A1B2C":[0,3]}`) |

pub mod address_map;
pub mod groups;

use crate::error::{DaliError, Result};

pub use address_map::AddressRecord;
pub use groups::GroupsDocument;

/// Key of the address map blob
pub const ADDRESS_MAP_KEY: &str = "DALIAddrMap";
/// Key of the group assignment JSON
pub const GROUPS_KEY: &str = "DALIGroups";

/// Largest value the bridge stores (128 address records)
pub const MAX_VALUE_LEN: usize = 4096;

/// Async key/value storage port.
///
/// Implementations decide where the data lives. A missing key is not an
/// error.
#[allow(async_fn_in_trait, reason = "Futures run on a single-threaded executor and need not be Send")]
pub trait KeyValueStore {
    /// Read the value of `key` into `buf`.
    ///
    /// Returns the value length, or `None` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the medium fails or the value does not
    /// fit in `buf`.
    async fn read(&mut self, key: &str, buf: &mut [u8]) -> Result<Option<usize>>;

    /// Store `data` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the value could not be written.
    async fn write(&mut self, key: &str, data: &[u8]) -> Result<()>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for &mut S {
    async fn read(&mut self, key: &str, buf: &mut [u8]) -> Result<Option<usize>> {
        (**self).read(key, buf).await
    }

    async fn write(&mut self, key: &str, data: &[u8]) -> Result<()> {
        (**self).write(key, data).await
    }
}

const MEMORY_KEYS: usize = 8;
const MEMORY_KEY_LEN: usize = 16;

/// In-memory store for tests and host builds
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: heapless::index_map::FnvIndexMap<heapless::String<MEMORY_KEY_LEN>, heapless::Vec<u8, MAX_VALUE_LEN>, MEMORY_KEYS>,
    fail_writes: bool,
    fail_reads: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail.
    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Make every following read fail.
    pub fn fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    /// Stored value of `key`.
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        let key = heapless::String::try_from(key).ok()?;
        self.values.get(&key).map(|value| value.as_slice())
    }
}

impl KeyValueStore for MemoryStore {
    async fn read(&mut self, key: &str, buf: &mut [u8]) -> Result<Option<usize>> {
        if self.fail_reads {
            return Err(DaliError::storage_read_failed());
        }
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let target = buf.get_mut(..value.len()).ok_or_else(DaliError::buffer_too_small)?;
        target.copy_from_slice(value);
        Ok(Some(value.len()))
    }

    async fn write(&mut self, key: &str, data: &[u8]) -> Result<()> {
        if self.fail_writes {
            return Err(DaliError::storage_write_failed());
        }
        let key = heapless::String::try_from(key).map_err(|_| DaliError::storage_write_failed())?;
        let value = heapless::Vec::from_slice(data).map_err(|_| DaliError::buffer_too_small())?;
        self.values
            .insert(key, value)
            .map(|_| ())
            .map_err(|_| DaliError::storage_write_failed())
    }
}
