//! In-memory stand-ins for the beacon node and the explorer.
//!
//! `MockChain::build` generates a small, fully participating chain: every slot has a block, every
//! attestation is included one slot after its duty, every sync committee member signs and every
//! reward equals the ideal reward. Tests then perturb the chain to produce the case under test.
use crate::beacon::BeaconApi;
use crate::explorer::Explorer;
use crate::validators::TrackedValidator;
use crate::Error;
use async_trait::async_trait;
use boolean_bitfield::{encode_bit_list, encode_bit_vector};
use eth2::types::{
    Attestation, AttestationData, BeaconBlock, BeaconBlockBody, Checkpoint, CommitteeData, Epoch,
    Hash256, IdealAttestationRewards, ProposerData, SignedBeaconBlock, Slot,
    StandardAttestationRewards, StandardBlockReward, StateId, SyncAggregate, SyncCommitteeReward,
    TotalAttestationRewards, Validator, ValidatorData, ValidatorIdsRequest, SLOTS_PER_EPOCH,
};
use explorer_api::ExplorerAttestation;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const EFFECTIVE_BALANCE: u64 = 32_000_000_000;
pub const IDEAL_HEAD: i64 = 700;
pub const IDEAL_TARGET: i64 = 1_300;
pub const IDEAL_SOURCE: i64 = 700;
pub const SYNC_REWARD: i64 = 20;
pub const PROPOSER_REWARD: u64 = 30_000;
/// Slot offset within each epoch at which the lowest tracked validator proposes.
pub const PROPOSAL_OFFSET: u64 = 3;
/// Untracked indices used to fill committees and proposer slots.
const FILLER_INDEX: u64 = 1_000_000;

/// The root of the block at `slot` in a generated chain.
pub fn block_root(slot: Slot) -> Hash256 {
    Hash256::from_low_u64_be(slot.as_u64() + 1)
}

fn ideal_rewards() -> IdealAttestationRewards {
    IdealAttestationRewards {
        effective_balance: EFFECTIVE_BALANCE,
        head: IDEAL_HEAD,
        target: IDEAL_TARGET,
        source: IDEAL_SOURCE,
        inactivity: 0,
    }
}

fn request_ids(request: &ValidatorIdsRequest) -> Vec<u64> {
    let ids = match request {
        ValidatorIdsRequest::Plain(ids) => ids,
        ValidatorIdsRequest::Wrapped(body) => &body.ids,
    };
    ids.iter().filter_map(|id| id.parse().ok()).collect()
}

#[derive(Debug, Default, Clone)]
pub struct MockChain {
    pub finalized_slot: Slot,
    pub validators: BTreeMap<u64, ValidatorData>,
    pub committees: HashMap<Epoch, Vec<CommitteeData>>,
    pub sync_committees: HashMap<Epoch, Vec<u64>>,
    pub blocks: BTreeMap<Slot, BeaconBlock>,
    pub proposer_duties: HashMap<Epoch, Vec<ProposerData>>,
    /// Attestation rewards that differ from the ideal reward.
    pub reward_overrides: HashMap<(u64, Epoch), TotalAttestationRewards>,
    /// Epochs whose committee lookups fail.
    pub failing_epochs: HashSet<Epoch>,
    /// Epochs whose sync committee lookups answer not found. Sync rewards are still paid.
    pub hidden_sync_committees: HashSet<Epoch>,
    /// Validators left out of attestation reward reports.
    pub unrewarded: HashSet<u64>,
}

impl MockChain {
    /// Generate a chain covering `epochs`, plus one following epoch so that every attestation in
    /// range has a block to be included in.
    pub fn build(
        validators: &[TrackedValidator],
        epochs: RangeInclusive<u64>,
        sync_committee_size: usize,
    ) -> Self {
        let mut chain = MockChain::default();
        let mut sorted = validators.to_vec();
        sorted.sort();

        for validator in &sorted {
            chain.validators.insert(
                validator.index,
                ValidatorData {
                    index: validator.index,
                    balance: EFFECTIVE_BALANCE,
                    status: "active_ongoing".into(),
                    validator: Validator {
                        effective_balance: EFFECTIVE_BALANCE,
                        slashed: false,
                        activation_epoch: validator.activation_epoch,
                        exit_epoch: Epoch::max_value(),
                    },
                },
            );
        }

        let (first, last) = (*epochs.start(), *epochs.end() + 1);
        for epoch in (first..=last).map(Epoch::new) {
            let active = sorted
                .iter()
                .filter(|v| v.activation_epoch <= epoch)
                .map(|v| v.index)
                .collect::<Vec<_>>();

            let committees = epoch
                .slot_iter(SLOTS_PER_EPOCH)
                .map(|slot| CommitteeData {
                    index: 0,
                    slot,
                    validators: active
                        .iter()
                        .copied()
                        .filter(|index| index % SLOTS_PER_EPOCH == slot.as_u64() % SLOTS_PER_EPOCH)
                        .chain(std::iter::once(FILLER_INDEX + slot.as_u64()))
                        .collect(),
                })
                .collect::<Vec<_>>();
            chain.committees.insert(epoch, committees);

            let sync_committee = active
                .iter()
                .copied()
                .chain((0..).map(|i| FILLER_INDEX * 2 + i))
                .take(sync_committee_size)
                .collect();
            chain.sync_committees.insert(epoch, sync_committee);

            let duties = epoch
                .slot_iter(SLOTS_PER_EPOCH)
                .map(|slot| ProposerData {
                    pubkey: format!("0x{:096x}", slot.as_u64()),
                    validator_index: match active.first() {
                        Some(index) if slot.as_u64() % SLOTS_PER_EPOCH == PROPOSAL_OFFSET => {
                            *index
                        }
                        _ => FILLER_INDEX + slot.as_u64(),
                    },
                    slot,
                })
                .collect::<Vec<_>>();

            for duty in &duties {
                let block = chain.produce_block(duty.slot, duty.validator_index, sync_committee_size);
                chain.blocks.insert(duty.slot, block);
            }
            chain.proposer_duties.insert(epoch, duties);
        }

        chain.finalized_slot = (Epoch::new(*epochs.end()) + 1).start_slot(SLOTS_PER_EPOCH);
        chain
    }

    /// A block at `slot` including every attestation of the previous slot.
    fn produce_block(&self, slot: Slot, proposer_index: u64, sync_committee_size: usize) -> BeaconBlock {
        let mut attestations = vec![];
        if slot > Slot::new(0) {
            let duty_slot = slot - 1;
            let duty_epoch = duty_slot.epoch(SLOTS_PER_EPOCH);
            let committees = self.committees.get(&duty_epoch).into_iter().flatten();
            for committee in committees.filter(|c| c.slot == duty_slot) {
                attestations.push(Attestation {
                    aggregation_bits: encode_bit_list(&vec![true; committee.validators.len()]),
                    data: AttestationData {
                        slot: duty_slot,
                        index: committee.index,
                        beacon_block_root: block_root(duty_slot),
                        source: Checkpoint {
                            epoch: duty_epoch - 1,
                            root: block_root((duty_epoch - 1).start_slot(SLOTS_PER_EPOCH)),
                        },
                        target: Checkpoint {
                            epoch: duty_epoch,
                            root: block_root(duty_epoch.start_slot(SLOTS_PER_EPOCH)),
                        },
                    },
                });
            }
        }

        BeaconBlock {
            slot,
            proposer_index,
            body: BeaconBlockBody {
                attestations,
                sync_aggregate: Some(SyncAggregate {
                    sync_committee_bits: encode_bit_vector(&vec![true; sync_committee_size]),
                }),
            },
        }
    }

    /// Remove the block at `slot`, turning it into a skipped slot.
    pub fn skip_slot(&mut self, slot: Slot) {
        self.blocks.remove(&slot);
    }

    /// Clear `validator`'s bit in every aggregate attesting to its duty in `epoch`.
    pub fn drop_attestation(&mut self, validator: u64, epoch: Epoch) {
        let duty = self.committees.get(&epoch).and_then(|committees| {
            committees.iter().find_map(|c| {
                c.validators
                    .iter()
                    .position(|v| *v == validator)
                    .map(|position| (c.slot, c.index, c.validators.len(), position))
            })
        });
        let (slot, index, len, position) = match duty {
            Some(duty) => duty,
            None => return,
        };

        for block in self.blocks.values_mut() {
            for attestation in &mut block.body.attestations {
                if attestation.data.slot == slot && attestation.data.index == index {
                    let mut bits = vec![true; len];
                    bits[position] = false;
                    attestation.aggregation_bits = encode_bit_list(&bits);
                }
            }
        }
    }

    /// Clear the sync committee bit at `position` in the block at `slot`.
    pub fn drop_sync_signature(&mut self, slot: Slot, position: usize) {
        if let Some(aggregate) = self
            .blocks
            .get_mut(&slot)
            .and_then(|block| block.body.sync_aggregate.as_mut())
        {
            if let Ok(mut bits) = boolean_bitfield::decode_bit_vector(&aggregate.sync_committee_bits)
            {
                if position < bits.len() {
                    bits[position] = false;
                }
                aggregate.sync_committee_bits = encode_bit_vector(&bits);
            }
        }
    }

    fn sync_signed(&self, slot: Slot, validator: u64) -> bool {
        let epoch = slot.epoch(SLOTS_PER_EPOCH);
        let position = self
            .sync_committees
            .get(&epoch)
            .and_then(|members| members.iter().position(|v| *v == validator));
        let bits = self
            .blocks
            .get(&slot)
            .and_then(|block| block.body.sync_aggregate.as_ref())
            .and_then(|aggregate| {
                boolean_bitfield::decode_bit_vector(&aggregate.sync_committee_bits).ok()
            });
        match (position, bits) {
            (Some(position), Some(bits)) => bits.get(position).copied().unwrap_or(false),
            _ => false,
        }
    }
}

/// A `BeaconApi` served from a `MockChain`.
#[derive(Default)]
pub struct MockBeaconNode {
    chain: RwLock<MockChain>,
    block_requests: AtomicUsize,
}

impl MockBeaconNode {
    pub fn new(chain: MockChain) -> Self {
        Self {
            chain: RwLock::new(chain),
            block_requests: AtomicUsize::new(0),
        }
    }

    /// Mutate the served chain.
    pub fn update(&self, f: impl FnOnce(&mut MockChain)) {
        f(&mut self.chain.write())
    }

    pub fn set_finalized_epoch(&self, epoch: Epoch) {
        self.chain.write().finalized_slot = epoch.start_slot(SLOTS_PER_EPOCH);
    }

    /// Number of block requests served so far.
    pub fn block_requests(&self) -> usize {
        self.block_requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BeaconApi for MockBeaconNode {
    async fn finalized_slot(&self) -> Result<Slot, Error> {
        Ok(self.chain.read().finalized_slot)
    }

    async fn validators(&self, _state: StateId, ids: &[u64]) -> Result<Vec<ValidatorData>, Error> {
        let chain = self.chain.read();
        Ok(ids
            .iter()
            .filter_map(|id| chain.validators.get(id).cloned())
            .collect())
    }

    async fn committees(&self, epoch: Epoch) -> Result<Vec<CommitteeData>, Error> {
        let chain = self.chain.read();
        if chain.failing_epochs.contains(&epoch) {
            return Err(Error::BeaconNodeMissing(format!(
                "committees for epoch {}",
                epoch
            )));
        }
        chain
            .committees
            .get(&epoch)
            .cloned()
            .ok_or_else(|| Error::BeaconNodeMissing(format!("committees for epoch {}", epoch)))
    }

    async fn sync_committee(&self, epoch: Epoch) -> Result<Option<Vec<u64>>, Error> {
        let chain = self.chain.read();
        if chain.hidden_sync_committees.contains(&epoch) {
            return Ok(None);
        }
        Ok(chain.sync_committees.get(&epoch).cloned())
    }

    async fn block(&self, slot: Slot) -> Result<Option<SignedBeaconBlock>, Error> {
        self.block_requests.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .chain
            .read()
            .blocks
            .get(&slot)
            .cloned()
            .map(|message| SignedBeaconBlock { message }))
    }

    async fn block_root(&self, slot: Slot) -> Result<Option<Hash256>, Error> {
        Ok(self
            .chain
            .read()
            .blocks
            .get(&slot)
            .map(|block| block_root(block.slot)))
    }

    async fn attestation_rewards(
        &self,
        epoch: Epoch,
        ids: &ValidatorIdsRequest,
    ) -> Result<StandardAttestationRewards, Error> {
        let chain = self.chain.read();
        let ideal = ideal_rewards();
        let total_rewards = request_ids(ids)
            .into_iter()
            .filter(|id| !chain.unrewarded.contains(id))
            .map(|id| {
                chain
                    .reward_overrides
                    .get(&(id, epoch))
                    .copied()
                    .unwrap_or(TotalAttestationRewards {
                        validator_index: id,
                        head: ideal.head,
                        target: ideal.target,
                        source: ideal.source,
                        inactivity: ideal.inactivity,
                    })
            })
            .collect();
        Ok(StandardAttestationRewards {
            ideal_rewards: vec![ideal],
            total_rewards,
        })
    }

    async fn sync_committee_rewards(
        &self,
        slot: Slot,
        ids: &ValidatorIdsRequest,
    ) -> Result<Option<Vec<SyncCommitteeReward>>, Error> {
        let chain = self.chain.read();
        if !chain.blocks.contains_key(&slot) {
            return Ok(None);
        }
        let members = chain
            .sync_committees
            .get(&slot.epoch(SLOTS_PER_EPOCH))
            .cloned()
            .unwrap_or_default();
        Ok(Some(
            request_ids(ids)
                .into_iter()
                .filter(|id| members.contains(id))
                .map(|id| SyncCommitteeReward {
                    validator_index: id,
                    reward: if chain.sync_signed(slot, id) {
                        SYNC_REWARD
                    } else {
                        -SYNC_REWARD
                    },
                })
                .collect(),
        ))
    }

    async fn block_reward(&self, slot: Slot) -> Result<Option<StandardBlockReward>, Error> {
        Ok(self
            .chain
            .read()
            .blocks
            .get(&slot)
            .map(|block| StandardBlockReward {
                proposer_index: block.proposer_index,
                total: PROPOSER_REWARD,
            }))
    }

    async fn proposer_duties(&self, epoch: Epoch) -> Result<Vec<ProposerData>, Error> {
        Ok(self
            .chain
            .read()
            .proposer_duties
            .get(&epoch)
            .cloned()
            .unwrap_or_default())
    }
}

/// An `Explorer` answering from a fixed set of rows.
#[derive(Default)]
pub struct MockExplorer {
    rows: RwLock<HashMap<(u64, Epoch), ExplorerAttestation>>,
    requests: AtomicUsize,
}

impl MockExplorer {
    pub fn insert(&self, row: ExplorerAttestation) {
        self.rows
            .write()
            .insert((row.validator_index, Epoch::new(row.epoch)), row);
    }

    /// A row describing a vote for `attester_slot` included at `inclusion_slot` (0 if missed).
    pub fn row(validator_index: u64, epoch: Epoch, attester_slot: Slot, inclusion_slot: u64) -> ExplorerAttestation {
        ExplorerAttestation {
            validator_index,
            epoch: epoch.as_u64(),
            attester_slot: attester_slot.as_u64(),
            committee_index: 0,
            inclusion_slot,
            status: u64::from(inclusion_slot != 0),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Explorer for MockExplorer {
    async fn attestation(
        &self,
        validator_index: u64,
        epoch: Epoch,
    ) -> Result<Option<ExplorerAttestation>, Error> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        Ok(self.rows.read().get(&(validator_index, epoch)).copied())
    }
}
