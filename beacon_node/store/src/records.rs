//! Typed duty records.
//!
//! Each record only ever moves forward through its states: fields set at assignment never
//! change, outcomes are set at most once and are never cleared. The `record_*` methods enforce
//! this by returning `false` (and leaving the record untouched) when the target state has
//! already been reached.
use crate::{Error, StoreItem};
use eth2::types::{Hash256, Slot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The votes carried by the first attestation that included the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestedVote {
    /// Slot of the block the attestation was included in.
    pub slot: Slot,
    pub head: Hash256,
    pub source: Hash256,
    pub target: Hash256,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardComponents {
    pub head: i64,
    pub target: i64,
    pub source: i64,
    pub inactivity: i64,
}

impl RewardComponents {
    pub fn total(&self) -> i64 {
        self.head
            .saturating_add(self.target)
            .saturating_add(self.source)
            .saturating_add(self.inactivity)
    }

    pub fn is_negative(&self) -> bool {
        self.total() < 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Inclusion {
    Pending,
    Included(AttestedVote),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardOutcome {
    Pending,
    Rewarded {
        reward: RewardComponents,
        ideal: RewardComponents,
    },
}

/// A validator's attestation duty for one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRecord {
    pub slot: Slot,
    pub committee_index: u64,
    /// Index of the validator within its committee's aggregation bits.
    pub position: u64,
    /// Length of the committee, and so of every aggregation bit-list for it.
    pub committee_size: u64,
    pub inclusion: Inclusion,
    pub rewards: RewardOutcome,
}

impl AttestationRecord {
    pub fn assigned(slot: Slot, committee_index: u64, position: u64, committee_size: u64) -> Self {
        Self {
            slot,
            committee_index,
            position,
            committee_size,
            inclusion: Inclusion::Pending,
            rewards: RewardOutcome::Pending,
        }
    }

    pub fn attested(&self) -> Option<&AttestedVote> {
        match &self.inclusion {
            Inclusion::Included(vote) => Some(vote),
            Inclusion::Pending => None,
        }
    }

    pub fn is_attested(&self) -> bool {
        self.attested().is_some()
    }

    pub fn is_rewarded(&self) -> bool {
        matches!(self.rewards, RewardOutcome::Rewarded { .. })
    }

    /// Returns `(reward, ideal)` once rewards are known.
    pub fn reward_and_ideal(&self) -> Option<(RewardComponents, RewardComponents)> {
        match self.rewards {
            RewardOutcome::Rewarded { reward, ideal } => Some((reward, ideal)),
            RewardOutcome::Pending => None,
        }
    }

    /// Slots between the duty and the inclusion of the attestation.
    pub fn inclusion_delay(&self) -> Option<u64> {
        self.attested()
            .map(|vote| vote.slot.as_u64().saturating_sub(self.slot.as_u64()))
    }

    /// Returns `true` if `vote` was recorded. The first inclusion wins.
    pub fn record_inclusion(&mut self, vote: AttestedVote) -> bool {
        match self.inclusion {
            Inclusion::Pending => {
                self.inclusion = Inclusion::Included(vote);
                true
            }
            Inclusion::Included(_) => false,
        }
    }

    /// Returns `true` if the rewards were recorded. Rewards are only ever set once.
    pub fn record_rewards(&mut self, reward: RewardComponents, ideal: RewardComponents) -> bool {
        match self.rewards {
            RewardOutcome::Pending => {
                self.rewards = RewardOutcome::Rewarded { reward, ideal };
                true
            }
            RewardOutcome::Rewarded { .. } => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReward {
    pub slot: Slot,
    pub reward: i64,
}

/// A validator's sync committee duty for one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Index of the validator within the sync committee bits.
    pub position: u64,
    pub missed: BTreeSet<Slot>,
    pub rewards: Vec<SyncReward>,
}

impl SyncRecord {
    pub fn assigned(position: u64) -> Self {
        Self {
            position,
            missed: BTreeSet::new(),
            rewards: vec![],
        }
    }

    pub fn record_missed(&mut self, slot: Slot) -> bool {
        self.missed.insert(slot)
    }

    pub fn has_reward(&self, slot: Slot) -> bool {
        self.rewards.iter().any(|r| r.slot == slot)
    }

    pub fn record_reward(&mut self, slot: Slot, reward: i64) -> bool {
        if self.has_reward(slot) {
            return false;
        }
        self.rewards.push(SyncReward { slot, reward });
        true
    }
}

/// The outcome of a block proposal duty. Written once, in a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalRecord {
    Missed,
    Proposed { reward: u64 },
}

impl ProposalRecord {
    pub fn missed(&self) -> bool {
        matches!(self, ProposalRecord::Missed)
    }

    pub fn reward(&self) -> u64 {
        match self {
            ProposalRecord::Missed => 0,
            ProposalRecord::Proposed { reward } => *reward,
        }
    }
}

macro_rules! impl_json_store_item {
    ($type: ty) => {
        impl StoreItem for $type {
            fn as_store_bytes(&self) -> Vec<u8> {
                // Serializing plain data structs with string keys cannot fail.
                serde_json::to_vec(self).unwrap_or_default()
            }

            fn from_store_bytes(bytes: &[u8]) -> Result<Self, Error> {
                serde_json::from_slice(bytes).map_err(Into::into)
            }
        }
    };
}

impl_json_store_item!(AttestationRecord);
impl_json_store_item!(SyncRecord);
impl_json_store_item!(ProposalRecord);
