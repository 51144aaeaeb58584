//! Background auditing of committed attestation records against an independent explorer.
//!
//! Each iteration samples one committed record at random and compares it with the explorer's
//! view. A disagreement triggers a single targeted re-ingestion of the affected epoch; if the
//! records still disagree afterwards the mismatch is fatal.
use crate::beacon::BeaconApi;
use crate::explorer::Explorer;
use crate::fetcher::DutyFetcher;
use crate::metrics;
use crate::Error;
use eth2::types::{Epoch, Hash256, Slot, SLOTS_PER_EPOCH};
use explorer_api::ExplorerAttestation;
use rand::seq::SliceRandom;
use slog::{debug, info, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use store::records::AttestationRecord;
use store::{KeyValueStore, Watermark};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Time to wait before sampling again when there is nothing to sample.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(12);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No committed record was available to sample.
    NothingToSample,
    /// The explorer has no row for the sampled epoch.
    Skipped { validator: u64, epoch: Epoch },
    Consistent { validator: u64, epoch: Epoch },
    /// A mismatch was found and re-ingestion resolved it.
    Repaired { validator: u64, epoch: Epoch },
}

pub struct ConsistencyChecker<B, S: KeyValueStore, X> {
    fetcher: Arc<DutyFetcher<B, S>>,
    explorer: Arc<X>,
    validators: Vec<u64>,
    idle_interval: Duration,
    log: Logger,
}

impl<B: BeaconApi, S: KeyValueStore, X: Explorer> ConsistencyChecker<B, S, X> {
    pub fn new(
        fetcher: Arc<DutyFetcher<B, S>>,
        explorer: Arc<X>,
        validators: Vec<u64>,
        log: Logger,
    ) -> Self {
        Self {
            fetcher,
            explorer,
            validators,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            log,
        }
    }

    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    /// Sample records until `exit` is cancelled or a mismatch survives re-ingestion.
    pub async fn run(&self, exit: &CancellationToken) -> Result<(), Error> {
        while !exit.is_cancelled() {
            let outcome = match self.check_once(exit).await {
                Ok(outcome) => outcome,
                Err(Error::Cancelled) => return Ok(()),
                Err(e) => return Err(e),
            };

            if outcome == CheckOutcome::NothingToSample {
                tokio::select! {
                    _ = exit.cancelled() => return Ok(()),
                    _ = sleep(self.idle_interval) => {}
                }
            }
        }
        Ok(())
    }

    /// Sample one record and check it.
    pub async fn check_once(&self, exit: &CancellationToken) -> Result<CheckOutcome, Error> {
        let sample = {
            let mut rng = rand::thread_rng();
            match self.validators.choose(&mut rng) {
                Some(validator) => self
                    .sample_record(*validator)?
                    .and_then(|records| records.choose(&mut rng).copied())
                    .map(|(epoch, record)| (*validator, epoch, record)),
                None => None,
            }
        };
        let (validator, epoch, record) = match sample {
            Some(sample) => sample,
            None => return Ok(CheckOutcome::NothingToSample),
        };

        self.check_record(validator, epoch, record, exit).await
    }

    /// Committed attestation records of `validator`, i.e. those below its `nextEpoch`.
    fn sample_record(&self, validator: u64) -> Result<Option<Vec<(Epoch, AttestationRecord)>>, Error> {
        let store = self.fetcher.store();
        let next_epoch = match store.get_watermark(validator, Watermark::NextEpoch)? {
            Some(next_epoch) => next_epoch,
            None => return Ok(None),
        };
        let records = store.attestations_in_range(validator, Epoch::new(0), next_epoch)?;
        Ok(Some(records).filter(|records| !records.is_empty()))
    }

    /// Compare one record, re-ingesting its epoch once if it disagrees with the explorer.
    pub async fn check_record(
        &self,
        validator: u64,
        epoch: Epoch,
        record: AttestationRecord,
        exit: &CancellationToken,
    ) -> Result<CheckOutcome, Error> {
        let row = match self.explorer.attestation(validator, epoch).await? {
            Some(row) => row,
            None => {
                debug!(
                    self.log,
                    "Explorer has no record, skipping";
                    "validator" => validator,
                    "epoch" => epoch,
                );
                metrics::inc_counter_vec(&metrics::CONSISTENCY_CHECKS_TOTAL, &[metrics::SKIPPED]);
                return Ok(CheckOutcome::Skipped { validator, epoch });
            }
        };

        let reason = match self.compare(&record, &row).await? {
            None => {
                metrics::inc_counter_vec(&metrics::CONSISTENCY_CHECKS_TOTAL, &[metrics::CONSISTENT]);
                return Ok(CheckOutcome::Consistent { validator, epoch });
            }
            Some(reason) => reason,
        };

        warn!(
            self.log,
            "Record disagrees with explorer, re-ingesting";
            "validator" => validator,
            "epoch" => epoch,
            "reason" => &reason,
        );
        self.fetcher.process_epoch(epoch, &[validator], exit).await?;

        let record = self
            .fetcher
            .store()
            .get_attestation(validator, epoch)?
            .ok_or_else(|| Error::ConsistencyMismatch {
                validator,
                epoch,
                reason: "record missing after re-ingestion".into(),
            })?;
        match self.compare(&record, &row).await? {
            None => {
                info!(
                    self.log,
                    "Record repaired";
                    "validator" => validator,
                    "epoch" => epoch,
                );
                metrics::inc_counter_vec(&metrics::CONSISTENCY_CHECKS_TOTAL, &[metrics::REPAIRED]);
                Ok(CheckOutcome::Repaired { validator, epoch })
            }
            Some(reason) => {
                metrics::inc_counter_vec(&metrics::CONSISTENCY_CHECKS_TOTAL, &[metrics::MISMATCH]);
                Err(Error::ConsistencyMismatch {
                    validator,
                    epoch,
                    reason,
                })
            }
        }
    }

    /// Returns a description of the first disagreement, if any.
    async fn compare(
        &self,
        record: &AttestationRecord,
        row: &ExplorerAttestation,
    ) -> Result<Option<String>, Error> {
        if row.attested() != record.is_attested() {
            return Ok(Some(format!(
                "attested: store {}, explorer {}",
                record.is_attested(),
                row.attested()
            )));
        }
        if row.attester_slot != record.slot.as_u64() {
            return Ok(Some(format!(
                "assigned slot: store {}, explorer {}",
                record.slot, row.attester_slot
            )));
        }

        let vote = match record.attested() {
            Some(vote) => *vote,
            None => return Ok(None),
        };
        if row.inclusion_slot != vote.slot.as_u64() {
            return Ok(Some(format!(
                "inclusion slot: store {}, explorer {}",
                vote.slot, row.inclusion_slot
            )));
        }

        // A timely vote earns the ideal reward unless the reward is a penalty or the vote's head
        // was not canonical.
        let timely = record.inclusion_delay().map_or(false, |delay| delay <= 1);
        if let (true, Some((reward, ideal))) = (timely, record.reward_and_ideal()) {
            if reward != ideal && !reward.is_negative() {
                match self.canonical_head(record.slot).await? {
                    Some(head) if head == vote.head => {
                        return Ok(Some(format!(
                            "timely vote with canonical head rewarded {:?}, ideal {:?}",
                            reward, ideal
                        )));
                    }
                    Some(_) => {}
                    None => debug!(
                        self.log,
                        "No block within an epoch of the duty, reward not compared";
                        "slot" => record.slot,
                        "reward" => reward.total(),
                        "ideal" => ideal.total(),
                    ),
                }
            }
        }

        Ok(None)
    }

    /// The root of the latest block at or before `slot`, looking back at most one epoch.
    async fn canonical_head(&self, slot: Slot) -> Result<Option<Hash256>, Error> {
        let beacon = self.fetcher.beacon();
        for distance in 0..SLOTS_PER_EPOCH {
            if distance > slot.as_u64() {
                break;
            }
            if let Some(root) = beacon.block_root(slot - distance).await? {
                return Ok(Some(root));
            }
        }
        Ok(None)
    }
}
