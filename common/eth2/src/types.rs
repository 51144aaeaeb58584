//! The subset of standard beacon node API types consumed by the duty watcher.

pub use crate::slot_epoch::{Epoch, Slot, SLOTS_PER_EPOCH};
pub use ethereum_types::H256 as Hash256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An API error serializable to JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
    #[serde(default)]
    pub stacktraces: Vec<String>,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum BlockId {
    Head,
    Genesis,
    Finalized,
    Justified,
    Slot(Slot),
    Root(Hash256),
}

impl FromStr for BlockId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "head" => Ok(BlockId::Head),
            "genesis" => Ok(BlockId::Genesis),
            "finalized" => Ok(BlockId::Finalized),
            "justified" => Ok(BlockId::Justified),
            other => {
                if let Some(root) = other.strip_prefix("0x") {
                    Hash256::from_str(root)
                        .map(BlockId::Root)
                        .map_err(|e| format!("{} cannot be parsed as a root", e))
                } else {
                    Slot::from_str(other)
                        .map(BlockId::Slot)
                        .map_err(|_| format!("{} cannot be parsed as a parameter", s))
                }
            }
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Head => write!(f, "head"),
            BlockId::Genesis => write!(f, "genesis"),
            BlockId::Finalized => write!(f, "finalized"),
            BlockId::Justified => write!(f, "justified"),
            BlockId::Slot(slot) => write!(f, "{}", slot),
            BlockId::Root(root) => write!(f, "{:?}", root),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum StateId {
    Head,
    Genesis,
    Finalized,
    Justified,
    Slot(Slot),
    Root(Hash256),
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateId::Head => write!(f, "head"),
            StateId::Genesis => write!(f, "genesis"),
            StateId::Finalized => write!(f, "finalized"),
            StateId::Justified => write!(f, "justified"),
            StateId::Slot(slot) => write!(f, "{}", slot),
            StateId::Root(root) => write!(f, "{:?}", root),
        }
    }
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Serialize + serde::de::DeserializeOwned")]
pub struct GenericResponse<T: Serialize + serde::de::DeserializeOwned> {
    pub data: T,
}

impl<T: Serialize + serde::de::DeserializeOwned> From<T> for GenericResponse<T> {
    fn from(data: T) -> Self {
        Self { data }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: Hash256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalityCheckpointsData {
    pub previous_justified: Checkpoint,
    pub current_justified: Checkpoint,
    pub finalized: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootData {
    pub root: Hash256,
}

/// The fields of a registry validator that the watcher reads. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    #[serde(with = "serde_utils::quoted_u64")]
    pub effective_balance: u64,
    #[serde(default)]
    pub slashed: bool,
    pub activation_epoch: Epoch,
    pub exit_epoch: Epoch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorData {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub balance: u64,
    pub status: String,
    pub validator: Validator,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitteeData {
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64_vec")]
    pub validators: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCommitteeByValidatorIndices {
    #[serde(with = "serde_utils::quoted_u64_vec")]
    pub validators: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposerData {
    pub pubkey: String,
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    pub slot: Slot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationData {
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64")]
    pub index: u64,
    pub beacon_block_root: Hash256,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

/// An aggregate attestation as included in a block. The bitfield stays hex-encoded until the
/// consumer decodes it against its committee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    pub aggregation_bits: String,
    pub data: AttestationData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAggregate {
    pub sync_committee_bits: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconBlockBody {
    #[serde(default)]
    pub attestations: Vec<Attestation>,
    #[serde(default)]
    pub sync_aggregate: Option<SyncAggregate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconBlock {
    pub slot: Slot,
    #[serde(with = "serde_utils::quoted_u64")]
    pub proposer_index: u64,
    pub body: BeaconBlockBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedBeaconBlock {
    pub message: BeaconBlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IdealAttestationRewards {
    #[serde(with = "serde_utils::quoted_u64")]
    pub effective_balance: u64,
    #[serde(with = "serde_utils::quoted_i64")]
    pub head: i64,
    #[serde(with = "serde_utils::quoted_i64")]
    pub target: i64,
    #[serde(with = "serde_utils::quoted_i64")]
    pub source: i64,
    #[serde(default, with = "serde_utils::quoted_i64")]
    pub inactivity: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TotalAttestationRewards {
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_i64")]
    pub head: i64,
    #[serde(with = "serde_utils::quoted_i64")]
    pub target: i64,
    #[serde(with = "serde_utils::quoted_i64")]
    pub source: i64,
    #[serde(default, with = "serde_utils::quoted_i64")]
    pub inactivity: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardAttestationRewards {
    pub ideal_rewards: Vec<IdealAttestationRewards>,
    pub total_rewards: Vec<TotalAttestationRewards>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncCommitteeReward {
    #[serde(with = "serde_utils::quoted_u64")]
    pub validator_index: u64,
    #[serde(with = "serde_utils::quoted_i64")]
    pub reward: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StandardBlockReward {
    #[serde(with = "serde_utils::quoted_u64")]
    pub proposer_index: u64,
    #[serde(with = "serde_utils::quoted_u64")]
    pub total: u64,
}

/// Request body for the batched reward endpoints when the server expects the wrapped form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorIdsBody {
    pub ids: Vec<String>,
}

/// Body of the batched reward requests: either a bare array of index strings, or the same array
/// wrapped as `{"ids": [...]}` for servers expecting that form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ValidatorIdsRequest {
    Plain(Vec<String>),
    Wrapped(ValidatorIdsBody),
}

impl ValidatorIdsRequest {
    pub fn new(ids: &[u64], wrapped: bool) -> Self {
        let ids = ids.iter().map(u64::to_string).collect();
        if wrapped {
            ValidatorIdsRequest::Wrapped(ValidatorIdsBody { ids })
        } else {
            ValidatorIdsRequest::Plain(ids)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_round_trips_through_display() {
        for id in ["head", "finalized", "1234"] {
            assert_eq!(BlockId::from_str(id).unwrap().to_string(), id);
        }
    }

    #[test]
    fn decodes_rewards_with_negative_components() {
        let json = r#"{
            "ideal_rewards": [
                {"effective_balance": "32000000000", "head": "2000", "target": "4000", "source": "2000", "inactivity": "0"}
            ],
            "total_rewards": [
                {"validator_index": "7", "head": "0", "target": "-4000", "source": "-2000", "inclusion_delay": "0", "inactivity": "0"}
            ]
        }"#;
        let rewards: StandardAttestationRewards = serde_json::from_str(json).unwrap();
        assert_eq!(rewards.ideal_rewards[0].effective_balance, 32_000_000_000);
        assert_eq!(rewards.total_rewards[0].target, -4000);
        assert_eq!(rewards.total_rewards[0].validator_index, 7);
    }

    #[test]
    fn reward_ids_body_forms() {
        assert_eq!(
            serde_json::to_string(&ValidatorIdsRequest::new(&[1, 22], false)).unwrap(),
            r#"["1","22"]"#
        );
        assert_eq!(
            serde_json::to_string(&ValidatorIdsRequest::new(&[1, 22], true)).unwrap(),
            r#"{"ids":["1","22"]}"#
        );
    }

    #[test]
    fn decodes_block_without_sync_aggregate() {
        let json = r#"{
            "message": {
                "slot": "10",
                "proposer_index": "3",
                "parent_root": "0x0000000000000000000000000000000000000000000000000000000000000000",
                "body": { "attestations": [] }
            }
        }"#;
        let block: SignedBeaconBlock = serde_json::from_str(json).unwrap();
        assert_eq!(block.message.slot, Slot::new(10));
        assert!(block.message.body.sync_aggregate.is_none());
    }
}
