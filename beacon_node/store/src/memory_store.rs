use crate::{Error, KeyValueStore, KeyValueStoreOp};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

type DBMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// A thread-safe, ordered, in-memory key-value store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    db: Arc<RwLock<DBMap>>,
}

impl MemoryStore {
    /// Create a new, empty database.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.db.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_bytes(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.db.read().get(key).cloned())
    }

    fn put_bytes(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.db.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn key_exists(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.db.read().contains_key(key))
    }

    fn key_delete(&self, key: &[u8]) -> Result<(), Error> {
        self.db.write().remove(key);
        Ok(())
    }

    fn do_atomically(&self, batch: Vec<KeyValueStoreOp>) -> Result<(), Error> {
        // A single write guard makes the batch invisible to readers until it is complete.
        let mut db = self.db.write();
        for op in batch {
            match op {
                KeyValueStoreOp::PutKeyValue(key, value) => {
                    db.insert(key, value);
                }
                KeyValueStoreOp::DeleteKey(key) => {
                    db.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iter_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        if start >= end {
            return Ok(vec![]);
        }
        Ok(self
            .db
            .read()
            .range::<[u8], _>((
                std::ops::Bound::Included(start),
                std::ops::Bound::Excluded(end),
            ))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn sync(&self) -> Result<(), Error> {
        Ok(())
    }
}
