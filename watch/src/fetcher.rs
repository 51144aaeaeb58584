//! Per-epoch ingestion of duties, their outcomes and their rewards.
//!
//! A unit for epoch `E` only ever writes records keyed by `E` (or by a slot in `E`), so units for
//! different epochs never contend for a record. Every step only fills in what is still missing,
//! which makes re-running a unit after a crash or for a fixup safe.
use crate::beacon::BeaconApi;
use crate::metrics;
use crate::Error;
use boolean_bitfield::Bitfield;
use eth2::types::{
    BeaconBlock, Epoch, IdealAttestationRewards, Slot, StateId, TotalAttestationRewards,
    ValidatorIdsRequest, SLOTS_PER_EPOCH,
};
use futures::{stream, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use slog::{debug, trace, Logger};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use store::records::{AttestationRecord, AttestedVote, ProposalRecord, RewardComponents, SyncRecord};
use store::{DutyStore, DutyStoreOp, KeyValueStore};
use tokio_util::sync::CancellationToken;

/// Number of validators in the sync committee on every supported network.
pub const SYNC_COMMITTEE_SIZE: usize = 512;
/// Blocks kept in memory. Two adjacent epoch units share one epoch worth of blocks.
pub const DEFAULT_BLOCK_CACHE_SIZE: usize = 256;
/// Blocks requested concurrently while scanning an epoch. Results are consumed in slot order.
pub const DEFAULT_BLOCK_FETCH_CONCURRENCY: usize = 8;

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Send reward request ids as `{"ids": [...]}` instead of a bare array.
    pub wrap_reward_ids: bool,
    pub sync_committee_size: usize,
    pub block_cache_size: usize,
    pub block_fetch_concurrency: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            wrap_reward_ids: false,
            sync_committee_size: SYNC_COMMITTEE_SIZE,
            block_cache_size: DEFAULT_BLOCK_CACHE_SIZE,
            block_fetch_concurrency: DEFAULT_BLOCK_FETCH_CONCURRENCY,
        }
    }
}

fn check_exit(exit: &CancellationToken) -> Result<(), Error> {
    if exit.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

fn reward_components(total: &TotalAttestationRewards) -> RewardComponents {
    RewardComponents {
        head: total.head,
        target: total.target,
        source: total.source,
        inactivity: total.inactivity,
    }
}

fn ideal_components(ideal: &IdealAttestationRewards) -> RewardComponents {
    RewardComponents {
        head: ideal.head,
        target: ideal.target,
        source: ideal.source,
        inactivity: ideal.inactivity,
    }
}

/// The tracked validators attesting in one committee.
struct CommitteeDuty {
    committee_size: usize,
    validators: Vec<u64>,
}

pub struct DutyFetcher<B, S: KeyValueStore> {
    beacon: Arc<B>,
    store: Arc<DutyStore<S>>,
    /// Only blocks are cached. A skipped slot may still be filled if it is not yet finalized.
    block_cache: Mutex<LruCache<Slot, Arc<BeaconBlock>>>,
    config: FetcherConfig,
    log: Logger,
}

impl<B: BeaconApi, S: KeyValueStore> DutyFetcher<B, S> {
    pub fn new(
        beacon: Arc<B>,
        store: Arc<DutyStore<S>>,
        config: FetcherConfig,
        log: Logger,
    ) -> Result<Self, Error> {
        let cache_size = NonZeroUsize::new(config.block_cache_size)
            .ok_or_else(|| Error::Config("block_cache_size must be non-zero".into()))?;
        if config.block_fetch_concurrency == 0 {
            return Err(Error::Config(
                "block_fetch_concurrency must be non-zero".into(),
            ));
        }
        Ok(Self {
            beacon,
            store,
            block_cache: Mutex::new(LruCache::new(cache_size)),
            config,
            log,
        })
    }

    pub fn store(&self) -> &Arc<DutyStore<S>> {
        &self.store
    }

    pub fn beacon(&self) -> &Arc<B> {
        &self.beacon
    }

    fn ids_request(&self, ids: &[u64]) -> ValidatorIdsRequest {
        ValidatorIdsRequest::new(ids, self.config.wrap_reward_ids)
    }

    /// Ingest every duty type of `epoch` for `validators`.
    ///
    /// The cancellation token is checked before each step and before each slot of the inclusion
    /// scan; a cancelled unit returns `Error::Cancelled` having written only whole steps.
    pub async fn process_epoch(
        &self,
        epoch: Epoch,
        validators: &[u64],
        exit: &CancellationToken,
    ) -> Result<(), Error> {
        let tracked: HashSet<u64> = validators.iter().copied().collect();

        check_exit(exit)?;
        let sync_assigned = self.assign_sync_duties(epoch, &tracked).await?;

        check_exit(exit)?;
        let attestations_assigned = self.assign_attestation_duties(epoch, &tracked).await?;

        check_exit(exit)?;
        let (attested, sync_updated) = self.scan_inclusions(epoch, validators, exit).await?;

        check_exit(exit)?;
        let rewarded = self.record_attestation_rewards(epoch, validators).await?;

        check_exit(exit)?;
        let proposals = self.record_proposals(epoch, &tracked).await?;

        debug!(
            self.log,
            "Processed epoch";
            "epoch" => epoch,
            "validators" => validators.len(),
            "sync_assigned" => sync_assigned,
            "attestations_assigned" => attestations_assigned,
            "attested" => attested,
            "sync_updated" => sync_updated,
            "rewarded" => rewarded,
            "proposals" => proposals,
        );
        Ok(())
    }

    /// Ingest only the attestation assignments of `epoch`.
    pub async fn process_epoch_duties(
        &self,
        epoch: Epoch,
        validators: &[u64],
        exit: &CancellationToken,
    ) -> Result<(), Error> {
        let tracked: HashSet<u64> = validators.iter().copied().collect();

        check_exit(exit)?;
        let assigned = self.assign_attestation_duties(epoch, &tracked).await?;

        trace!(
            self.log,
            "Processed epoch duties";
            "epoch" => epoch,
            "assigned" => assigned,
        );
        Ok(())
    }

    /// Create a sync record for every tracked committee member that lacks one.
    ///
    /// A validator may occupy several committee positions; its first one is recorded.
    async fn assign_sync_duties(&self, epoch: Epoch, tracked: &HashSet<u64>) -> Result<usize, Error> {
        let members = match self.beacon.sync_committee(epoch).await? {
            Some(members) => members,
            None => {
                trace!(self.log, "No sync committee for epoch"; "epoch" => epoch);
                return Ok(0);
            }
        };

        let mut positions = BTreeMap::new();
        for (position, validator) in members.iter().enumerate() {
            if tracked.contains(validator) {
                positions.entry(*validator).or_insert(position as u64);
            }
        }

        let mut ops = vec![];
        for (validator, position) in positions {
            if self.store.get_sync(validator, epoch)?.is_none() {
                ops.push(DutyStoreOp::PutSync(
                    validator,
                    epoch,
                    SyncRecord::assigned(position),
                ));
            }
        }

        let count = ops.len();
        self.store.do_atomically(ops)?;
        Ok(count)
    }

    /// Create an attestation record for every tracked validator that lacks one.
    async fn assign_attestation_duties(
        &self,
        epoch: Epoch,
        tracked: &HashSet<u64>,
    ) -> Result<usize, Error> {
        let committees = self.beacon.committees(epoch).await?;

        let mut ops = vec![];
        for committee in &committees {
            if committee.slot.epoch(SLOTS_PER_EPOCH) != epoch {
                return Err(Error::DataIntegrity(format!(
                    "committee {} at slot {} returned for epoch {}",
                    committee.index, committee.slot, epoch
                )));
            }
            for (position, validator) in committee.validators.iter().enumerate() {
                if tracked.contains(validator)
                    && self.store.get_attestation(*validator, epoch)?.is_none()
                {
                    ops.push(DutyStoreOp::PutAttestation(
                        *validator,
                        epoch,
                        AttestationRecord::assigned(
                            committee.slot,
                            committee.index,
                            position as u64,
                            committee.validators.len() as u64,
                        ),
                    ));
                }
            }
        }

        let count = ops.len();
        self.store.do_atomically(ops)?;
        Ok(count)
    }

    async fn get_block(&self, slot: Slot) -> Result<Option<Arc<BeaconBlock>>, Error> {
        let cached = self.block_cache.lock().get(&slot).cloned();
        if let Some(block) = cached {
            metrics::inc_counter(&metrics::BLOCK_CACHE_HITS);
            return Ok(Some(block));
        }
        metrics::inc_counter(&metrics::BLOCK_CACHE_MISSES);

        let block = self
            .beacon
            .block(slot)
            .await?
            .map(|signed| Arc::new(signed.message));
        if let Some(block) = &block {
            self.block_cache.lock().put(slot, block.clone());
        }
        Ok(block)
    }

    /// Walk the blocks that may carry evidence for `epoch` and record inclusions and sync
    /// committee participation.
    ///
    /// Attestations for `epoch` may be included until the end of the following epoch, so both
    /// epochs are scanned for them. Sync aggregates are only read from `epoch`'s own blocks, and
    /// are read even when no validator holds a sync record so that unexpected sync rewards are
    /// caught. Records are loaded once, updated slot by slot and written in a single batch.
    async fn scan_inclusions(
        &self,
        epoch: Epoch,
        validators: &[u64],
        exit: &CancellationToken,
    ) -> Result<(usize, usize), Error> {
        if validators.is_empty() {
            return Ok((0, 0));
        }

        let mut attestations = HashMap::new();
        let mut syncs = HashMap::new();
        for &validator in validators {
            if let Some(record) = self.store.get_attestation(validator, epoch)? {
                if !record.is_attested() {
                    attestations.insert(validator, record);
                }
            }
            if let Some(record) = self.store.get_sync(validator, epoch)? {
                syncs.insert(validator, record);
            }
        }

        let mut duties: HashMap<(Slot, u64), CommitteeDuty> = HashMap::new();
        for (validator, record) in &attestations {
            duties
                .entry((record.slot, record.committee_index))
                .or_insert_with(|| CommitteeDuty {
                    committee_size: record.committee_size as usize,
                    validators: vec![],
                })
                .validators
                .push(*validator);
        }

        let mut slots: Vec<Slot> = epoch.slot_iter(SLOTS_PER_EPOCH).collect();
        if !attestations.is_empty() {
            slots.extend((epoch + 1).slot_iter(SLOTS_PER_EPOCH));
        }

        let mut blocks = stream::iter(slots)
            .map(|slot| async move { self.get_block(slot).await })
            .buffered(self.config.block_fetch_concurrency);

        let mut attested = HashSet::new();
        let mut sync_updated = HashSet::new();
        while let Some(block) = blocks.next().await {
            check_exit(exit)?;
            let block = match block? {
                Some(block) => block,
                None => continue,
            };

            Self::apply_attestations(epoch, &block, &duties, &mut attestations, &mut attested)?;

            if block.slot.epoch(SLOTS_PER_EPOCH) == epoch {
                self.apply_sync_aggregate(&block, validators, &mut syncs, &mut sync_updated)
                    .await?;
            }
        }

        let mut ops = vec![];
        for validator in &attested {
            if let Some(record) = attestations.remove(validator) {
                ops.push(DutyStoreOp::PutAttestation(*validator, epoch, record));
            }
        }
        for validator in &sync_updated {
            if let Some(record) = syncs.remove(validator) {
                ops.push(DutyStoreOp::PutSync(*validator, epoch, record));
            }
        }
        self.store.do_atomically(ops)?;

        Ok((attested.len(), sync_updated.len()))
    }

    fn apply_attestations(
        epoch: Epoch,
        block: &BeaconBlock,
        duties: &HashMap<(Slot, u64), CommitteeDuty>,
        attestations: &mut HashMap<u64, AttestationRecord>,
        attested: &mut HashSet<u64>,
    ) -> Result<(), Error> {
        for attestation in &block.body.attestations {
            let data = &attestation.data;
            if data.slot.epoch(SLOTS_PER_EPOCH) != epoch {
                continue;
            }
            let duty = match duties.get(&(data.slot, data.index)) {
                Some(duty) => duty,
                None => continue,
            };

            let bits = Bitfield::from_bit_list_hex(&attestation.aggregation_bits)?
                .expect_len(duty.committee_size)?;
            for validator in &duty.validators {
                if let Some(record) = attestations.get_mut(validator) {
                    let vote = AttestedVote {
                        slot: block.slot,
                        head: data.beacon_block_root,
                        source: data.source.root,
                        target: data.target.root,
                    };
                    if bits.get(record.position as usize) && record.record_inclusion(vote) {
                        attested.insert(*validator);
                    }
                }
            }
        }
        Ok(())
    }

    async fn apply_sync_aggregate(
        &self,
        block: &BeaconBlock,
        validators: &[u64],
        syncs: &mut HashMap<u64, SyncRecord>,
        updated: &mut HashSet<u64>,
    ) -> Result<(), Error> {
        let aggregate = match &block.body.sync_aggregate {
            Some(aggregate) => aggregate,
            None => return Ok(()),
        };
        let bits = Bitfield::from_bit_vector_hex(&aggregate.sync_committee_bits)?
            .expect_len(self.config.sync_committee_size)?;

        for (validator, record) in syncs.iter_mut() {
            if !bits.get(record.position as usize) && record.record_missed(block.slot) {
                updated.insert(*validator);
            }
        }

        let rewards = match self
            .beacon
            .sync_committee_rewards(block.slot, &self.ids_request(validators))
            .await?
        {
            Some(rewards) => rewards,
            None => return Ok(()),
        };

        for reward in rewards {
            match syncs.get_mut(&reward.validator_index) {
                Some(record) => {
                    if record.record_reward(block.slot, reward.reward) {
                        updated.insert(reward.validator_index);
                    }
                }
                None if reward.reward != 0 => {
                    return Err(Error::DataIntegrity(format!(
                        "sync reward {} at slot {} for validator {} without a sync duty",
                        reward.reward, block.slot, reward.validator_index
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Fill in rewards for every attestation record of `epoch` that is still missing them.
    ///
    /// The ideal reward is the ideal row matching the validator's effective balance at the start
    /// of the epoch.
    async fn record_attestation_rewards(
        &self,
        epoch: Epoch,
        validators: &[u64],
    ) -> Result<usize, Error> {
        let mut pending = vec![];
        for &validator in validators {
            if let Some(record) = self.store.get_attestation(validator, epoch)? {
                if !record.is_rewarded() {
                    pending.push((validator, record));
                }
            }
        }
        if pending.is_empty() {
            return Ok(0);
        }

        let ids = pending.iter().map(|(v, _)| *v).collect::<Vec<_>>();
        let rewards = self
            .beacon
            .attestation_rewards(epoch, &self.ids_request(&ids))
            .await?;
        let balances = self
            .beacon
            .validators(StateId::Slot(epoch.start_slot(SLOTS_PER_EPOCH)), &ids)
            .await?
            .into_iter()
            .map(|data| (data.index, data.validator.effective_balance))
            .collect::<HashMap<_, _>>();

        let mut ops = vec![];
        for (validator, mut record) in pending {
            let total = rewards
                .total_rewards
                .iter()
                .find(|total| total.validator_index == validator)
                .ok_or_else(|| {
                    Error::DataIntegrity(format!(
                        "no attestation reward for validator {} in epoch {}",
                        validator, epoch
                    ))
                })?;
            let effective_balance = balances.get(&validator).ok_or_else(|| {
                Error::DataIntegrity(format!(
                    "no effective balance for validator {} at epoch {}",
                    validator, epoch
                ))
            })?;
            let ideal = rewards
                .ideal_rewards
                .iter()
                .find(|ideal| ideal.effective_balance == *effective_balance)
                .ok_or_else(|| {
                    Error::DataIntegrity(format!(
                        "no ideal reward for effective balance {} in epoch {}",
                        effective_balance, epoch
                    ))
                })?;

            if record.record_rewards(reward_components(total), ideal_components(ideal)) {
                ops.push(DutyStoreOp::PutAttestation(validator, epoch, record));
            }
        }

        let count = ops.len();
        self.store.do_atomically(ops)?;
        Ok(count)
    }

    /// Record the outcome of every tracked proposal duty of `epoch` not yet recorded.
    async fn record_proposals(&self, epoch: Epoch, tracked: &HashSet<u64>) -> Result<usize, Error> {
        let duties = self.beacon.proposer_duties(epoch).await?;

        let mut ops = vec![];
        for duty in duties {
            if !tracked.contains(&duty.validator_index)
                || duty.slot.epoch(SLOTS_PER_EPOCH) != epoch
                || self
                    .store
                    .get_proposal(duty.validator_index, duty.slot)?
                    .is_some()
            {
                continue;
            }

            let record = match self.beacon.block_reward(duty.slot).await? {
                None => ProposalRecord::Missed,
                Some(reward) if reward.proposer_index != duty.validator_index => {
                    return Err(Error::DataIntegrity(format!(
                        "block at slot {} proposed by {}, assigned to {}",
                        duty.slot, reward.proposer_index, duty.validator_index
                    )));
                }
                Some(reward) => ProposalRecord::Proposed {
                    reward: reward.total,
                },
            };
            ops.push(DutyStoreOp::PutProposal(
                duty.validator_index,
                duty.slot,
                record,
            ));
        }

        let count = ops.len();
        self.store.do_atomically(ops)?;
        Ok(count)
    }
}
