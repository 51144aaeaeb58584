use crate::metadata::SchemaVersion;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    DatabaseRedbError(redb::Error),
    DatabaseIoError(std::io::Error),
    SerializationError(serde_json::Error),
    /// A stored key does not follow the canonical component encoding.
    InvalidKey(String),
    /// A stored scalar value does not have the expected width.
    InvalidValueLength { expected: usize, found: usize },
    IncompatibleSchemaVersion {
        database_schema_version: SchemaVersion,
        software_schema_version: SchemaVersion,
    },
    ShardCountZero,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::DatabaseIoError(e)
    }
}

macro_rules! impl_from_redb_error {
    ($error: ty) => {
        impl From<$error> for Error {
            fn from(e: $error) -> Self {
                Error::DatabaseRedbError(e.into())
            }
        }
    };
}

impl_from_redb_error!(redb::Error);
impl_from_redb_error!(redb::DatabaseError);
impl_from_redb_error!(redb::TransactionError);
impl_from_redb_error!(redb::TableError);
impl_from_redb_error!(redb::StorageError);
impl_from_redb_error!(redb::CommitError);
