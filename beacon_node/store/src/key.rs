//! The canonical composite-key encoding.
//!
//! A key is a tuple of components, each either an unsigned integer or a string. Each component is
//! encoded as a tag byte followed by its payload:
//!
//! - integer: `0x01` followed by 8 big-endian bytes;
//! - string: `0x02` followed by the UTF-8 bytes and a `0x00` terminator.
//!
//! With this encoding the byte-wise ordering of two keys equals the component-wise ordering of
//! their tuples, and every key extending a prefix `p` sorts within `[p, p ++ 0xff)`. Range scans
//! over a validator or a record kind rely on both properties.
//!
//! Every record lives under `(chain_id, "validator", validator_index, ...)`:
//!
//! ```text
//! (chain_id, "validator", index, "attestation", epoch)
//! (chain_id, "validator", index, "sync", epoch)
//! (chain_id, "validator", index, "proposal", slot)
//! (chain_id, "validator", index, "nextEpoch")
//! (chain_id, "validator", index, "dutiesEpoch")
//! (chain_id, "meta", "schemaVersion")
//! ```
use crate::Error;
use std::fmt;

const TAG_INT: u8 = 0x01;
const TAG_STR: u8 = 0x02;
const STR_TERMINATOR: u8 = 0x00;
/// Sorts after every component tag.
const PREFIX_END: u8 = 0xff;

pub const VALIDATOR: &str = "validator";
pub const ATTESTATION: &str = "attestation";
pub const SYNC: &str = "sync";
pub const PROPOSAL: &str = "proposal";
pub const NEXT_EPOCH: &str = "nextEpoch";
pub const DUTIES_EPOCH: &str = "dutiesEpoch";
pub const META: &str = "meta";
pub const SCHEMA_VERSION: &str = "schemaVersion";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyComponent {
    Int(u64),
    Str(String),
}

#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an integer component.
    pub fn int(mut self, value: u64) -> Self {
        self.0.push(TAG_INT);
        self.0.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// Append a string component.
    ///
    /// Strings containing a NUL byte cannot be encoded; they are truncated at the first NUL. All
    /// strings used by this crate are the constants above.
    pub fn str(mut self, value: &str) -> Self {
        self.0.push(TAG_STR);
        self.0
            .extend(value.bytes().take_while(|byte| *byte != STR_TERMINATOR));
        self.0.push(STR_TERMINATOR);
        self
    }

    pub fn from_components(components: &[KeyComponent]) -> Self {
        components
            .iter()
            .fold(Key::new(), |key, component| match component {
                KeyComponent::Int(value) => key.int(*value),
                KeyComponent::Str(value) => key.str(value),
            })
    }

    /// The half-open byte range containing this key and every key it prefixes.
    pub fn prefix_range(&self) -> (Vec<u8>, Vec<u8>) {
        let mut end = self.0.clone();
        end.push(PREFIX_END);
        (self.0.clone(), end)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Decode an encoded key back into its components.
    pub fn parse(bytes: &[u8]) -> Result<Vec<KeyComponent>, Error> {
        let mut components = vec![];
        let mut rest = bytes;

        while let Some((tag, tail)) = rest.split_first() {
            match *tag {
                TAG_INT => {
                    if tail.len() < 8 {
                        return Err(Error::InvalidKey(format!(
                            "truncated integer component in {:?}",
                            bytes
                        )));
                    }
                    let (int_bytes, tail) = tail.split_at(8);
                    let mut array = [0; 8];
                    array.copy_from_slice(int_bytes);
                    components.push(KeyComponent::Int(u64::from_be_bytes(array)));
                    rest = tail;
                }
                TAG_STR => {
                    let end = tail
                        .iter()
                        .position(|byte| *byte == STR_TERMINATOR)
                        .ok_or_else(|| {
                            Error::InvalidKey(format!("unterminated string in {:?}", bytes))
                        })?;
                    let value = String::from_utf8(tail[..end].to_vec())
                        .map_err(|e| Error::InvalidKey(format!("{:?}", e)))?;
                    components.push(KeyComponent::Str(value));
                    rest = &tail[end + 1..];
                }
                other => {
                    return Err(Error::InvalidKey(format!(
                        "unknown component tag {:#04x}",
                        other
                    )))
                }
            }
        }

        Ok(components)
    }
}

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Key::parse(&self.0) {
            Ok(components) => f.debug_tuple("Key").field(&components).finish(),
            Err(_) => f.debug_tuple("Key").field(&self.0).finish(),
        }
    }
}

/// `(chain_id, "validator", validator_index)`
pub fn validator_prefix(chain_id: u64, validator_index: u64) -> Key {
    Key::new().int(chain_id).str(VALIDATOR).int(validator_index)
}

/// `(chain_id, "validator", validator_index, kind)`
pub fn record_kind_prefix(chain_id: u64, validator_index: u64, kind: &str) -> Key {
    validator_prefix(chain_id, validator_index).str(kind)
}

pub fn attestation_key(chain_id: u64, validator_index: u64, epoch: u64) -> Key {
    record_kind_prefix(chain_id, validator_index, ATTESTATION).int(epoch)
}

pub fn sync_key(chain_id: u64, validator_index: u64, epoch: u64) -> Key {
    record_kind_prefix(chain_id, validator_index, SYNC).int(epoch)
}

pub fn proposal_key(chain_id: u64, validator_index: u64, slot: u64) -> Key {
    record_kind_prefix(chain_id, validator_index, PROPOSAL).int(slot)
}

pub fn next_epoch_key(chain_id: u64, validator_index: u64) -> Key {
    validator_prefix(chain_id, validator_index).str(NEXT_EPOCH)
}

pub fn duties_epoch_key(chain_id: u64, validator_index: u64) -> Key {
    validator_prefix(chain_id, validator_index).str(DUTIES_EPOCH)
}

pub fn schema_version_key(chain_id: u64) -> Key {
    Key::new().int(chain_id).str(META).str(SCHEMA_VERSION)
}

/// Returns the validator index of a key under `(_, "validator", index, ..)`.
///
/// Accepts bare prefixes, so range bounds can be routed as well as full keys.
pub fn validator_index_of(bytes: &[u8]) -> Option<u64> {
    match Key::parse(bytes).ok()?.as_slice() {
        [KeyComponent::Int(_), KeyComponent::Str(kind), KeyComponent::Int(index), ..]
            if kind == VALIDATOR =>
        {
            Some(*index)
        }
        _ => None,
    }
}

/// Returns the trailing integer component of a record key, i.e. its epoch or slot.
pub fn trailing_int(bytes: &[u8]) -> Result<u64, Error> {
    match Key::parse(bytes)?.last() {
        Some(KeyComponent::Int(value)) => Ok(*value),
        _ => Err(Error::InvalidKey(format!(
            "key {:?} does not end in an integer",
            bytes
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_components() {
        let components = vec![
            KeyComponent::Int(1),
            KeyComponent::Str(VALIDATOR.into()),
            KeyComponent::Int(42),
            KeyComponent::Str(ATTESTATION.into()),
            KeyComponent::Int(100),
        ];
        let key = Key::from_components(&components);
        assert_eq!(key, attestation_key(1, 42, 100));
        assert_eq!(Key::parse(key.as_bytes()).unwrap(), components);
    }

    #[test]
    fn byte_order_matches_tuple_order() {
        // Integers compare numerically, not by decimal string.
        assert!(attestation_key(1, 9, 0) < attestation_key(1, 10, 0));
        assert!(attestation_key(1, 1, 255) < attestation_key(1, 1, 256));
        // A string sorts before any string it prefixes.
        assert!(Key::new().str("sync") < Key::new().str("syncs"));
        // Integers sort before strings in the same position.
        assert!(Key::new().int(u64::MAX) < Key::new().str(""));
    }

    #[test]
    fn prefix_range_contains_extensions_only() {
        let (start, end) = record_kind_prefix(1, 42, ATTESTATION).prefix_range();
        let inside = attestation_key(1, 42, u64::MAX);
        let outside = [
            attestation_key(1, 43, 0),
            sync_key(1, 42, 0),
            next_epoch_key(1, 42),
            attestation_key(2, 42, 0),
        ];

        assert!(start.as_slice() <= inside.as_bytes() && inside.as_bytes() < end.as_slice());
        for key in outside {
            let bytes = key.as_bytes();
            assert!(!(start.as_slice() <= bytes && bytes < end.as_slice()), "{:?}", key);
        }
    }

    #[test]
    fn validator_routing() {
        assert_eq!(validator_index_of(sync_key(5, 77, 3).as_bytes()), Some(77));
        assert_eq!(validator_index_of(validator_prefix(5, 77).as_bytes()), Some(77));
        assert_eq!(validator_index_of(schema_version_key(5).as_bytes()), None);
        assert_eq!(trailing_int(proposal_key(5, 77, 3210).as_bytes()).unwrap(), 3210);
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(Key::parse(&[TAG_INT, 0, 1]).is_err());
        assert!(Key::parse(&[TAG_STR, b'a']).is_err());
        assert!(Key::parse(&[0x7f]).is_err());
    }
}
