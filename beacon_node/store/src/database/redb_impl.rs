use crate::{Error, KeyValueStore, KeyValueStoreOp};
use redb::{ReadableTable, TableDefinition};
use std::path::Path;

pub const DB_FILE_NAME: &str = "duties.redb";

/// Every key lives in one table; the canonical key encoding already namespaces them.
const DUTIES_TABLE: TableDefinition<'static, &[u8], &[u8]> = TableDefinition::new("duties");

/// A `KeyValueStore` backed by a single redb database file.
pub struct Redb {
    db: redb::Database,
}

impl Redb {
    /// Open (or create) the database at `path`. If `path` is a directory the database file is
    /// created inside it.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let path = if path.is_dir() {
            path.join(DB_FILE_NAME)
        } else {
            path.to_path_buf()
        };
        let db = redb::Database::create(path)?;

        let tx = db.begin_write()?;
        tx.open_table(DUTIES_TABLE)?;
        tx.commit()?;

        Ok(Self { db })
    }
}

impl KeyValueStore for Redb {
    fn get_bytes(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(DUTIES_TABLE)?;
        let result = table.get(key)?;
        Ok(result.map(|access_guard| access_guard.value().to_vec()))
    }

    fn put_bytes(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(DUTIES_TABLE)?;
            table.insert(key, value)?;
        }
        tx.commit().map_err(Into::into)
    }

    fn key_exists(&self, key: &[u8]) -> Result<bool, Error> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(DUTIES_TABLE)?;
        table
            .get(key)
            .map_err(Into::into)
            .map(|access_guard| access_guard.is_some())
    }

    fn key_delete(&self, key: &[u8]) -> Result<(), Error> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(DUTIES_TABLE)?;
            table.remove(key)?;
        }
        tx.commit().map_err(Into::into)
    }

    fn do_atomically(&self, batch: Vec<KeyValueStoreOp>) -> Result<(), Error> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(DUTIES_TABLE)?;
            for op in batch {
                match op {
                    KeyValueStoreOp::PutKeyValue(key, value) => {
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                    KeyValueStoreOp::DeleteKey(key) => {
                        table.remove(key.as_slice())?;
                    }
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn iter_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Error> {
        if start >= end {
            return Ok(vec![]);
        }
        let tx = self.db.begin_read()?;
        let table = tx.open_table(DUTIES_TABLE)?;
        let entries = table
            .range::<&[u8]>(start..end)?
            .map(|entry| {
                let (key, value) = entry?;
                Ok((key.value().to_vec(), value.value().to_vec()))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(entries)
    }

    fn sync(&self) -> Result<(), Error> {
        // Commits are durable on return, so an empty commit is all that is left to do.
        let tx = self.db.begin_write()?;
        tx.commit().map_err(Into::into)
    }
}
