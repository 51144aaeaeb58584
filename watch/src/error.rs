use eth2::types::Epoch;

#[derive(Debug)]
pub enum Error {
    /// A beacon node request failed or returned an unexpected status.
    BeaconNode(eth2::Error),
    /// The beacon node answered `404` for data that must exist.
    BeaconNodeMissing(String),
    Explorer(explorer_api::Error),
    Store(store::Error),
    MalformedBitfield(boolean_bitfield::Error),
    /// The beacon node's data contradicts itself or the records already stored.
    DataIntegrity(String),
    /// The store disagrees with the explorer about a committed record.
    ConsistencyMismatch {
        validator: u64,
        epoch: Epoch,
        reason: String,
    },
    Cancelled,
    Config(String),
    Io(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<eth2::Error> for Error {
    fn from(e: eth2::Error) -> Self {
        Error::BeaconNode(e)
    }
}

impl From<explorer_api::Error> for Error {
    fn from(e: explorer_api::Error) -> Self {
        Error::Explorer(e)
    }
}

impl From<store::Error> for Error {
    fn from(e: store::Error) -> Self {
        Error::Store(e)
    }
}

impl From<boolean_bitfield::Error> for Error {
    fn from(e: boolean_bitfield::Error) -> Self {
        Error::MalformedBitfield(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
