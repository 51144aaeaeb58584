use crate::{Error, StoreItem};
use serde::{Deserialize, Serialize};

/// Version of the on-disk encoding of keys and records.
///
/// Bump whenever a record type changes shape or the key layout changes.
pub const CURRENT_SCHEMA_VERSION: SchemaVersion = SchemaVersion(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaVersion(pub u64);

impl SchemaVersion {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl StoreItem for SchemaVersion {
    fn as_store_bytes(&self) -> Vec<u8> {
        self.0.to_be_bytes().to_vec()
    }

    fn from_store_bytes(bytes: &[u8]) -> Result<Self, Error> {
        crate::u64_from_be_bytes(bytes).map(SchemaVersion)
    }
}
