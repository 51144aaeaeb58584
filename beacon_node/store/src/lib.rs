//! Storage for validator duty records.
//!
//! Provides the following key-value backends:
//!
//! - `Redb`: an on-disk store backed by redb. Used in production.
//! - `MemoryStore`: an in-memory store backed by a `BTreeMap`. Used for testing.
//! - `ShardedStore`: spreads keys across several of the above by validator index.
//!
//! On top of these, `DutyStore` provides typed access to attestation, sync committee and proposal
//! records, and to the per-validator watermarks. See tests for examples.
mod database;
mod duty_store;
mod errors;
pub mod key;
mod memory_store;
pub mod metadata;
pub mod records;
mod sharded_store;

pub use self::database::redb_impl::{Redb, DB_FILE_NAME};
pub use self::duty_store::{DutyStore, DutyStoreOp, Watermark};
pub use self::memory_store::MemoryStore;
pub use self::sharded_store::ShardedStore;
pub use errors::Error;
pub use key::Key;
pub use metadata::{SchemaVersion, CURRENT_SCHEMA_VERSION};

/// An ordered key-value store.
///
/// Keys are compared byte-wise. Implementations must apply `do_atomically` batches all-or-nothing
/// and must not expose a partially applied batch to readers.
pub trait KeyValueStore: Sync + Send + Sized + 'static {
    /// Retrieve some bytes with `key`.
    fn get_bytes(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    /// Store some `value`, indexed with `key`.
    fn put_bytes(&self, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Return `true` if `key` exists.
    fn key_exists(&self, key: &[u8]) -> Result<bool, Error>;

    /// Removes `key`.
    fn key_delete(&self, key: &[u8]) -> Result<(), Error>;

    /// Execute either all of the operations in `batch` or none at all.
    fn do_atomically(&self, batch: Vec<KeyValueStoreOp>) -> Result<(), Error>;

    /// All entries with `start <= key < end`, in ascending key order.
    fn iter_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error>;

    /// Flush everything written so far to durable storage.
    fn sync(&self) -> Result<(), Error>;
}

/// Reified key-value storage operation.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValueStoreOp {
    PutKeyValue(Vec<u8>, Vec<u8>),
    DeleteKey(Vec<u8>),
}

/// An item that may be stored in a `KeyValueStore` by serializing and deserializing from bytes.
pub trait StoreItem: Sized {
    /// Serialize `self` as bytes.
    fn as_store_bytes(&self) -> Vec<u8>;

    /// De-serialize `self` from bytes.
    fn from_store_bytes(bytes: &[u8]) -> Result<Self, Error>;

    fn as_kv_store_op(&self, key: &Key) -> KeyValueStoreOp {
        KeyValueStoreOp::PutKeyValue(key.as_bytes().to_vec(), self.as_store_bytes())
    }
}

/// Decode a big-endian `u64` as written for watermarks and the schema version.
pub fn u64_from_be_bytes(bytes: &[u8]) -> Result<u64, Error> {
    let array: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::InvalidValueLength {
            expected: 8,
            found: bytes.len(),
        })?;
    Ok(u64::from_be_bytes(array))
}
