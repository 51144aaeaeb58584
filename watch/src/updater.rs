//! Scheduling of epoch units and advancement of the per-validator watermarks.
//!
//! A pass covers a contiguous range of epochs. Units are dispatched in epoch order with bounded
//! concurrency but may complete in any order, so a watermark only moves up to the lowest epoch
//! that is still outstanding. After a crash the stored watermarks therefore never point past an
//! incomplete epoch, and re-running the affected units is harmless.
use crate::beacon::BeaconApi;
use crate::fetcher::DutyFetcher;
use crate::metrics;
use crate::validators::TrackedValidator;
use crate::Error;
use eth2::types::{Epoch, Slot, SLOTS_PER_EPOCH};
use futures::stream::{FuturesUnordered, StreamExt};
use slog::{debug, error, info, Logger};
use std::cmp::{max, min};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use store::{DutyStoreOp, KeyValueStore, Watermark};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// The two kinds of pass. Each owns one watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Attestation assignments only. Advances `dutiesEpoch`.
    Duties,
    /// Every duty type. Advances `nextEpoch`, never beyond `dutiesEpoch`.
    Full,
}

impl Pass {
    pub fn watermark(self) -> Watermark {
        match self {
            Pass::Duties => Watermark::DutiesEpoch,
            Pass::Full => Watermark::NextEpoch,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Pass::Duties => metrics::DUTIES,
            Pass::Full => metrics::FULL,
        }
    }
}

/// An inclusive range of epochs overriding the range derived from the watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochWindow {
    pub start: Epoch,
    pub end: Epoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// There was nothing to do.
    Idle,
    /// Every unit below `next_epoch` completed. `advanced` counts the watermark writes.
    Completed { next_epoch: Epoch, advanced: usize },
    /// The pass stopped early because of a shutdown.
    Cancelled,
}

/// The set of dispatched but incomplete epochs of a pass.
#[derive(Debug)]
pub struct OutstandingEpochs {
    outstanding: BTreeSet<Epoch>,
    next: Epoch,
    safe: Epoch,
}

impl OutstandingEpochs {
    pub fn new(start: Epoch) -> Self {
        Self {
            outstanding: BTreeSet::new(),
            next: start,
            safe: start,
        }
    }

    /// The epoch the next call to `dispatch` will return.
    pub fn next_undispatched(&self) -> Epoch {
        self.next
    }

    pub fn dispatch(&mut self) -> Epoch {
        let epoch = self.next;
        self.outstanding.insert(epoch);
        self.next = epoch + 1;
        epoch
    }

    /// Every epoch below this one has completed.
    pub fn safe(&self) -> Epoch {
        self.safe
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    /// Mark `epoch` as complete. Returns the new safe epoch if it moved.
    pub fn complete(&mut self, epoch: Epoch) -> Option<Epoch> {
        if !self.outstanding.remove(&epoch) {
            return None;
        }
        let safe = self
            .outstanding
            .iter()
            .next()
            .map_or(self.next, |lowest| min(*lowest, self.next));
        if safe > self.safe {
            self.safe = safe;
            Some(safe)
        } else {
            None
        }
    }
}

/// A validator's position within a single pass.
#[derive(Debug, Clone)]
struct Progress {
    index: u64,
    activation_epoch: Epoch,
    /// `max(stored watermark, activation_epoch)`.
    watermark: Epoch,
    /// Attestation assignments exist for every epoch below this one.
    duties_until: Epoch,
}

pub struct EpochScheduler<B, S: KeyValueStore> {
    fetcher: Arc<DutyFetcher<B, S>>,
    validators: Vec<TrackedValidator>,
    max_epoch_tasks: usize,
    poll_interval: Duration,
    log: Logger,
}

impl<B: BeaconApi, S: KeyValueStore> EpochScheduler<B, S> {
    pub fn new(
        fetcher: Arc<DutyFetcher<B, S>>,
        validators: Vec<TrackedValidator>,
        max_epoch_tasks: usize,
        poll_interval: Duration,
        log: Logger,
    ) -> Result<Self, Error> {
        if max_epoch_tasks == 0 {
            return Err(Error::Config("max_epoch_tasks must be non-zero".into()));
        }
        Ok(Self {
            fetcher,
            validators,
            max_epoch_tasks,
            poll_interval,
            log,
        })
    }

    pub fn validators(&self) -> &[TrackedValidator] {
        &self.validators
    }

    /// Run the duties pass, and unless `duties_only` the full pass alongside it, until `exit` is
    /// cancelled or either pass fails. A failure stops the other pass too.
    pub async fn run(&self, duties_only: bool, exit: &CancellationToken) -> Result<(), Error> {
        let passes_exit = exit.child_token();
        if duties_only {
            return self.run_continuous(Pass::Duties, &passes_exit).await;
        }

        let (duties, full) = tokio::join!(
            self.run_continuous(Pass::Duties, &passes_exit),
            self.run_continuous(Pass::Full, &passes_exit),
        );
        duties.and(full)
    }

    /// Repeat `pass` forever, idling for the poll interval whenever there is no new work.
    pub async fn run_continuous(&self, pass: Pass, exit: &CancellationToken) -> Result<(), Error> {
        let log = self.log.new(slog::o!("pass" => pass.label()));
        loop {
            if exit.is_cancelled() {
                return Ok(());
            }

            let idle = match self.run_pass(pass, None, exit).await {
                Ok(PassOutcome::Cancelled) => return Ok(()),
                Ok(PassOutcome::Idle) => true,
                Ok(PassOutcome::Completed {
                    next_epoch,
                    advanced,
                }) => {
                    info!(log, "Pass complete"; "next_epoch" => next_epoch, "advanced" => advanced);
                    advanced == 0
                }
                Err(e) => {
                    exit.cancel();
                    return Err(e);
                }
            };

            if idle {
                tokio::select! {
                    _ = exit.cancelled() => return Ok(()),
                    _ = sleep(self.poll_interval) => {}
                }
            }
        }
    }

    /// Process a bounded window once and return.
    ///
    /// The duties pass runs first; the full pass then treats the epochs it covered as assigned.
    pub async fn run_window(
        &self,
        window: EpochWindow,
        duties_only: bool,
        exit: &CancellationToken,
    ) -> Result<(), Error> {
        if window.end < window.start {
            return Err(Error::Config(format!(
                "start_epoch {} is after end_epoch {}",
                window.start, window.end
            )));
        }

        let duties = self.run_pass_inner(Pass::Duties, Some(window), None, exit).await?;
        info!(self.log, "Duties window complete"; "outcome" => ?duties);
        if duties_only {
            return Ok(());
        }

        let assigned_until = match duties {
            PassOutcome::Completed { next_epoch, .. } => next_epoch,
            PassOutcome::Idle | PassOutcome::Cancelled => return Ok(()),
        };
        let full = self
            .run_pass_inner(Pass::Full, Some(window), Some(assigned_until), exit)
            .await?;
        info!(self.log, "Full window complete"; "outcome" => ?full);
        Ok(())
    }

    /// Run `process_epoch` for each of `epochs` over `validators`. Watermarks are not touched.
    pub async fn run_fixup(
        &self,
        epochs: &[Epoch],
        validators: &[u64],
        exit: &CancellationToken,
    ) -> Result<(), Error> {
        let mut epochs = epochs.to_vec();
        epochs.sort_unstable();
        epochs.dedup();

        let fixup_exit = exit.child_token();
        let mut pending = epochs.into_iter();
        let mut units = FuturesUnordered::new();
        let mut failure = None;

        loop {
            while failure.is_none() && units.len() < self.max_epoch_tasks {
                let epoch = match pending.next() {
                    Some(epoch) => epoch,
                    None => break,
                };
                let fetcher = &self.fetcher;
                let unit_exit = &fixup_exit;
                units.push(async move {
                    let _timer =
                        metrics::start_timer_vec(&metrics::EPOCH_PROCESSING_SECONDS, &[metrics::FIXUP]);
                    (epoch, fetcher.process_epoch(epoch, validators, unit_exit).await)
                });
            }

            let (epoch, result) = match units.next().await {
                Some(completed) => completed,
                None => break,
            };
            match result {
                Ok(()) => {
                    metrics::inc_counter_vec(&metrics::EPOCHS_PROCESSED_TOTAL, &[metrics::FIXUP]);
                    info!(self.log, "Fixup epoch complete"; "epoch" => epoch);
                }
                Err(Error::Cancelled) => {}
                Err(e) => {
                    error!(self.log, "Fixup epoch failed"; "epoch" => epoch, "error" => ?e);
                    if failure.is_none() {
                        failure = Some(e);
                        fixup_exit.cancel();
                    }
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None if exit.is_cancelled() => Err(Error::Cancelled),
            None => Ok(()),
        }
    }

    /// Run one pass over every epoch between the lowest watermark (or the window start) and the
    /// last finalized epoch (or the window end).
    pub async fn run_pass(
        &self,
        pass: Pass,
        window: Option<EpochWindow>,
        exit: &CancellationToken,
    ) -> Result<PassOutcome, Error> {
        self.run_pass_inner(pass, window, None, exit).await
    }

    fn load_progress(
        &self,
        pass: Pass,
        assigned_until: Option<Epoch>,
    ) -> Result<Vec<Progress>, Error> {
        let store = self.fetcher.store();
        self.validators
            .iter()
            .map(|validator| {
                let stored = store
                    .get_watermark(validator.index, pass.watermark())?
                    .unwrap_or_default();
                let duties_until = store
                    .get_watermark(validator.index, Watermark::DutiesEpoch)?
                    .unwrap_or_default();
                Ok(Progress {
                    index: validator.index,
                    activation_epoch: validator.activation_epoch,
                    watermark: max(stored, validator.activation_epoch),
                    duties_until: assigned_until.map_or(duties_until, |assigned| {
                        max(duties_until, assigned)
                    }),
                })
            })
            .collect()
    }

    /// Validators that take part in the unit for `epoch`.
    fn eligible(pass: Pass, epoch: Epoch, windowed: bool, progress: &[Progress]) -> Vec<u64> {
        progress
            .iter()
            .filter(|p| p.activation_epoch <= epoch)
            .filter(|p| windowed || p.watermark <= epoch)
            .filter(|p| pass == Pass::Duties || p.duties_until > epoch)
            .map(|p| p.index)
            .collect()
    }

    /// Write the watermark of every validator that may now move up to `safe`.
    ///
    /// Inside a window a watermark is only moved if it already lies within the window, so that
    /// it never regresses and never skips an epoch the window did not cover.
    fn advance_watermarks(
        &self,
        pass: Pass,
        safe: Epoch,
        window: Option<EpochWindow>,
        progress: &mut [Progress],
    ) -> Result<usize, Error> {
        let mut ops = vec![];
        for p in progress.iter_mut() {
            let target = match pass {
                Pass::Duties => safe,
                Pass::Full => min(safe, p.duties_until),
            };
            let in_window = window.map_or(true, |window| window.start <= p.watermark);
            if in_window && p.watermark < target {
                ops.push(DutyStoreOp::PutWatermark(p.index, pass.watermark(), target));
                p.watermark = target;
            }
        }

        let count = ops.len();
        self.fetcher.store().do_atomically(ops)?;
        metrics::set_gauge_vec(
            &metrics::WATERMARK_EPOCH,
            &[pass.label()],
            safe.as_u64() as i64,
        );
        Ok(count)
    }

    async fn run_pass_inner(
        &self,
        pass: Pass,
        window: Option<EpochWindow>,
        assigned_until: Option<Epoch>,
        exit: &CancellationToken,
    ) -> Result<PassOutcome, Error> {
        let label = pass.label();
        let mut progress = self.load_progress(pass, assigned_until)?;

        let finalized_slot = self.fetcher.beacon().finalized_slot().await?;
        if finalized_slot == Slot::new(0) {
            return Ok(PassOutcome::Idle);
        }
        let mut final_epoch = (finalized_slot - 1).epoch(SLOTS_PER_EPOCH);

        if pass == Pass::Full {
            match progress.iter().map(|p| p.duties_until).max() {
                Some(duties_until) if duties_until > Epoch::new(0) => {
                    final_epoch = min(final_epoch, duties_until - 1);
                }
                _ => return Ok(PassOutcome::Idle),
            }
        }

        let start_epoch = match window {
            Some(window) => {
                final_epoch = min(final_epoch, window.end);
                window.start
            }
            None => match progress.iter().map(|p| p.watermark).min() {
                Some(start_epoch) => start_epoch,
                None => return Ok(PassOutcome::Idle),
            },
        };

        if final_epoch < start_epoch {
            return Ok(PassOutcome::Idle);
        }

        debug!(
            self.log,
            "Starting pass";
            "pass" => label,
            "start_epoch" => start_epoch,
            "final_epoch" => final_epoch,
            "windowed" => window.is_some(),
        );

        let pass_exit = exit.child_token();
        let mut tracker = OutstandingEpochs::new(start_epoch);
        let mut units = FuturesUnordered::new();
        let mut failure = None;
        let mut advanced = 0;

        loop {
            while failure.is_none()
                && !pass_exit.is_cancelled()
                && units.len() < self.max_epoch_tasks
                && tracker.next_undispatched() <= final_epoch
            {
                let epoch = tracker.dispatch();
                let ids = Self::eligible(pass, epoch, window.is_some(), &progress);
                let fetcher = &self.fetcher;
                let unit_exit = &pass_exit;
                metrics::inc_gauge_vec(&metrics::EPOCH_UNITS_IN_FLIGHT, &[label]);
                units.push(async move {
                    let _timer = metrics::start_timer_vec(&metrics::EPOCH_PROCESSING_SECONDS, &[label]);
                    let result = if ids.is_empty() {
                        Ok(())
                    } else {
                        match pass {
                            Pass::Duties => {
                                fetcher.process_epoch_duties(epoch, &ids, unit_exit).await
                            }
                            Pass::Full => fetcher.process_epoch(epoch, &ids, unit_exit).await,
                        }
                    };
                    (epoch, result)
                });
            }

            let (epoch, result) = match units.next().await {
                Some(completed) => completed,
                None => break,
            };
            metrics::dec_gauge_vec(&metrics::EPOCH_UNITS_IN_FLIGHT, &[label]);

            match result {
                Ok(()) => {
                    metrics::inc_counter_vec(&metrics::EPOCHS_PROCESSED_TOTAL, &[label]);
                    if let Some(safe) = tracker.complete(epoch) {
                        match self.advance_watermarks(pass, safe, window, &mut progress) {
                            Ok(count) => advanced += count,
                            Err(e) if failure.is_none() => {
                                failure = Some(e);
                                pass_exit.cancel();
                            }
                            Err(_) => {}
                        }
                    }
                }
                // A cancelled unit stays outstanding so no watermark passes it.
                Err(Error::Cancelled) => {}
                Err(e) => {
                    error!(
                        self.log,
                        "Epoch unit failed";
                        "pass" => label,
                        "epoch" => epoch,
                        "error" => ?e,
                    );
                    if failure.is_none() {
                        failure = Some(e);
                        pass_exit.cancel();
                    }
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        if exit.is_cancelled() {
            return Ok(PassOutcome::Cancelled);
        }
        Ok(PassOutcome::Completed {
            next_epoch: tracker.safe(),
            advanced,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_waits_for_lowest_outstanding() {
        let mut tracker = OutstandingEpochs::new(Epoch::new(5));
        for expected in [5, 6, 7] {
            assert_eq!(tracker.dispatch(), Epoch::new(expected));
        }

        assert_eq!(tracker.complete(Epoch::new(6)), None);
        assert_eq!(tracker.safe(), Epoch::new(5));

        assert_eq!(tracker.complete(Epoch::new(5)), Some(Epoch::new(7)));
        assert_eq!(tracker.complete(Epoch::new(7)), Some(Epoch::new(8)));
        assert!(tracker.is_empty());
    }

    #[test]
    fn safe_is_capped_by_next_undispatched() {
        let mut tracker = OutstandingEpochs::new(Epoch::new(0));
        tracker.dispatch();
        assert_eq!(tracker.complete(Epoch::new(0)), Some(Epoch::new(1)));
        // Completing an epoch twice, or one never dispatched, changes nothing.
        assert_eq!(tracker.complete(Epoch::new(0)), None);
        assert_eq!(tracker.complete(Epoch::new(3)), None);
        assert_eq!(tracker.next_undispatched(), Epoch::new(1));
    }

    fn progress(index: u64, activation: u64, watermark: u64, duties_until: u64) -> Progress {
        Progress {
            index,
            activation_epoch: Epoch::new(activation),
            watermark: Epoch::new(watermark),
            duties_until: Epoch::new(duties_until),
        }
    }

    #[test]
    fn full_pass_requires_assignments() {
        let validators = vec![progress(1, 0, 10, 12), progress(2, 0, 10, 10), progress(3, 11, 11, 20)];
        let eligible = |pass, epoch, windowed| {
            EpochScheduler::<crate::test_utils::MockBeaconNode, store::MemoryStore>::eligible(
                pass,
                Epoch::new(epoch),
                windowed,
                &validators,
            )
        };

        assert_eq!(eligible(Pass::Full, 10, false), vec![1]);
        assert_eq!(eligible(Pass::Full, 11, false), vec![1, 3]);
        assert_eq!(eligible(Pass::Duties, 10, false), vec![1, 2]);
        // Inside a window the validator's own watermark does not exclude it.
        assert_eq!(eligible(Pass::Full, 9, true), vec![1, 2]);
        assert_eq!(eligible(Pass::Full, 9, false), Vec::<u64>::new());
    }
}
