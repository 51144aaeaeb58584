use crate::key::validator_index_of;
use crate::{Error, KeyValueStore, KeyValueStoreOp};
use std::collections::BTreeMap;

/// Spreads keys across several stores by validator index.
///
/// Keys under `(_, "validator", index, ..)` live on shard `index % shards`; every other key lives
/// on shard 0. A batch is atomic within each shard it touches, but not across shards.
pub struct ShardedStore<S> {
    shards: Vec<S>,
}

impl<S: KeyValueStore> ShardedStore<S> {
    pub fn new(shards: Vec<S>) -> Result<Self, Error> {
        if shards.is_empty() {
            return Err(Error::ShardCountZero);
        }
        Ok(Self { shards })
    }

    fn shard_index(&self, key: &[u8]) -> usize {
        validator_index_of(key)
            .map(|index| (index % self.shards.len() as u64) as usize)
            .unwrap_or(0)
    }

    fn shard(&self, key: &[u8]) -> &S {
        &self.shards[self.shard_index(key)]
    }
}

impl<S: KeyValueStore> KeyValueStore for ShardedStore<S> {
    fn get_bytes(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.shard(key).get_bytes(key)
    }

    fn put_bytes(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.shard(key).put_bytes(key, value)
    }

    fn key_exists(&self, key: &[u8]) -> Result<bool, Error> {
        self.shard(key).key_exists(key)
    }

    fn key_delete(&self, key: &[u8]) -> Result<(), Error> {
        self.shard(key).key_delete(key)
    }

    fn do_atomically(&self, batch: Vec<KeyValueStoreOp>) -> Result<(), Error> {
        let mut per_shard: BTreeMap<usize, Vec<KeyValueStoreOp>> = BTreeMap::new();
        for op in batch {
            let key = match &op {
                KeyValueStoreOp::PutKeyValue(key, _) => key,
                KeyValueStoreOp::DeleteKey(key) => key,
            };
            per_shard
                .entry(self.shard_index(key))
                .or_default()
                .push(op);
        }

        for (shard, ops) in per_shard {
            self.shards[shard].do_atomically(ops)?;
        }
        Ok(())
    }

    fn iter_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        // A range within a single validator is served by one shard. Prefix ranges end in a
        // trailing 0xff which is not a component of its own.
        let end_prefix = end.strip_suffix(&[0xff]).unwrap_or(end);
        if let (Some(a), Some(b)) = (validator_index_of(start), validator_index_of(end_prefix)) {
            if a == b {
                return self.shard(start).iter_range(start, end);
            }
        }

        let mut entries = vec![];
        for shard in &self.shards {
            entries.extend(shard.iter_range(start, end)?);
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    fn sync(&self) -> Result<(), Error> {
        for shard in &self.shards {
            shard.sync()?;
        }
        Ok(())
    }
}
