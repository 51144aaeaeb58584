#![recursion_limit = "256"]

use boolean_bitfield::encode_bit_list;
use eth2::types::{Epoch, Hash256, Slot, TotalAttestationRewards, SLOTS_PER_EPOCH};
use logging::test_logger;
use maplit::hashset;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use store::records::{AttestationRecord, AttestedVote, ProposalRecord};
use store::{DutyStore, DutyStoreOp, Redb, Watermark};
use tempfile::{tempdir, TempDir};
use tokio_util::sync::CancellationToken;
use watch::consistency::{CheckOutcome, ConsistencyChecker};
use watch::fetcher::{DutyFetcher, FetcherConfig};
use watch::test_utils::{
    block_root, MockBeaconNode, MockChain, MockExplorer, EFFECTIVE_BALANCE, IDEAL_HEAD,
    IDEAL_SOURCE, IDEAL_TARGET, PROPOSAL_OFFSET, PROPOSER_REWARD, SYNC_REWARD,
};
use watch::updater::{EpochScheduler, EpochWindow, Pass, PassOutcome};
use watch::validators::{resolve_activation_epochs, TrackedValidator};
use watch::Error;

const CHAIN_ID: u64 = 1;
const SYNC_COMMITTEE_SIZE: usize = 16;
const ACTIVATION_EPOCH: u64 = 100;
/// Proposes at `PROPOSAL_OFFSET` of every epoch, being the lowest active index.
const PROPOSER: u64 = 7;
const ATTESTER: u64 = 40;
/// Activates one epoch after the others.
const LATE: u64 = 12;

fn tracked() -> Vec<TrackedValidator> {
    vec![
        TrackedValidator::new(PROPOSER, Epoch::new(ACTIVATION_EPOCH)),
        TrackedValidator::new(LATE, Epoch::new(ACTIVATION_EPOCH + 1)),
        TrackedValidator::new(ATTESTER, Epoch::new(ACTIVATION_EPOCH)),
    ]
}

fn indices() -> Vec<u64> {
    tracked().iter().map(|v| v.index).collect()
}

fn duty_slot(validator: u64, epoch: u64) -> Slot {
    Epoch::new(epoch).start_slot(SLOTS_PER_EPOCH) + validator % SLOTS_PER_EPOCH
}

fn proposal_slot(epoch: u64) -> Slot {
    Epoch::new(epoch).start_slot(SLOTS_PER_EPOCH) + PROPOSAL_OFFSET
}

fn rewards(validator: u64, head: i64, target: i64, source: i64) -> TotalAttestationRewards {
    TotalAttestationRewards {
        validator_index: validator,
        head,
        target,
        source,
        inactivity: 0,
    }
}

struct Tester {
    beacon: Arc<MockBeaconNode>,
    store: Arc<DutyStore<Redb>>,
    fetcher: Arc<DutyFetcher<MockBeaconNode, Redb>>,
    exit: CancellationToken,
    _dir: TempDir,
}

impl Tester {
    /// A chain finalized up to and including the last of `epochs`.
    fn new(epochs: RangeInclusive<u64>) -> Self {
        let dir = tempdir().unwrap();
        let beacon = Arc::new(MockBeaconNode::new(MockChain::build(
            &tracked(),
            epochs,
            SYNC_COMMITTEE_SIZE,
        )));
        let db = Redb::open(dir.path()).unwrap();
        let store = Arc::new(DutyStore::open(db, CHAIN_ID, test_logger()).unwrap());
        let fetcher = Arc::new(
            DutyFetcher::new(
                beacon.clone(),
                store.clone(),
                FetcherConfig {
                    sync_committee_size: SYNC_COMMITTEE_SIZE,
                    ..FetcherConfig::default()
                },
                test_logger(),
            )
            .unwrap(),
        );

        Self {
            beacon,
            store,
            fetcher,
            exit: CancellationToken::new(),
            _dir: dir,
        }
    }

    fn scheduler(&self, max_epoch_tasks: usize) -> EpochScheduler<MockBeaconNode, Redb> {
        EpochScheduler::new(
            self.fetcher.clone(),
            tracked(),
            max_epoch_tasks,
            Duration::from_millis(10),
            test_logger(),
        )
        .unwrap()
    }

    async fn run_passes(&self, max_epoch_tasks: usize) -> (PassOutcome, PassOutcome) {
        let scheduler = self.scheduler(max_epoch_tasks);
        let duties = scheduler
            .run_pass(Pass::Duties, None, &self.exit)
            .await
            .unwrap();
        let full = scheduler
            .run_pass(Pass::Full, None, &self.exit)
            .await
            .unwrap();
        (duties, full)
    }

    fn watermark(&self, validator: u64, watermark: Watermark) -> Option<Epoch> {
        self.store.get_watermark(validator, watermark).unwrap()
    }

    fn attestation(&self, validator: u64, epoch: u64) -> Option<AttestationRecord> {
        self.store
            .get_attestation(validator, Epoch::new(epoch))
            .unwrap()
    }

    fn checker(&self, explorer: Arc<MockExplorer>) -> ConsistencyChecker<MockBeaconNode, Redb, MockExplorer> {
        ConsistencyChecker::new(self.fetcher.clone(), explorer, indices(), test_logger())
            .with_idle_interval(Duration::from_millis(10))
    }

    /// Check the stored vote of `validator` in `epoch` against an explorer that agrees with a
    /// timely inclusion.
    async fn check_timely_vote(&self, validator: u64, epoch: u64) -> Result<CheckOutcome, Error> {
        let slot = duty_slot(validator, epoch);
        let explorer = Arc::new(MockExplorer::default());
        explorer.insert(MockExplorer::row(
            validator,
            Epoch::new(epoch),
            slot,
            (slot + 1).as_u64(),
        ));
        let record = self.attestation(validator, epoch).unwrap();
        self.checker(explorer)
            .check_record(validator, Epoch::new(epoch), record, &self.exit)
            .await
    }
}

#[tokio::test]
async fn bootstrap_resolves_activation_epochs() {
    let tester = Tester::new(100..=102);
    let remaining = parking_lot::Mutex::new(vec![]);

    // 99 is unknown to the beacon node.
    let resolved = resolve_activation_epochs(
        &*tester.beacon,
        &[ATTESTER, 99, PROPOSER, LATE, PROPOSER],
        2,
        2,
        |left| remaining.lock().push(left),
        &test_logger(),
    )
    .await
    .unwrap();

    let mut expected = tracked();
    expected.sort();
    assert_eq!(resolved, expected);
    assert_eq!(remaining.lock().last(), Some(&0));
}

#[tokio::test]
async fn end_to_end() {
    let tester = Tester::new(100..=102);
    let (duties, full) = tester.run_passes(4).await;

    assert!(matches!(
        duties,
        PassOutcome::Completed { next_epoch, .. } if next_epoch == Epoch::new(103)
    ));
    assert!(matches!(
        full,
        PassOutcome::Completed { next_epoch, .. } if next_epoch == Epoch::new(103)
    ));

    for validator in indices() {
        assert_eq!(
            tester.watermark(validator, Watermark::DutiesEpoch),
            Some(Epoch::new(103))
        );
        assert_eq!(
            tester.watermark(validator, Watermark::NextEpoch),
            Some(Epoch::new(103))
        );
    }

    for (validator, first_epoch) in [(PROPOSER, 100), (ATTESTER, 100), (LATE, 101)] {
        let records = tester.store.attestations(validator).unwrap();
        assert_eq!(
            records.iter().map(|(epoch, _)| epoch.as_u64()).collect::<Vec<_>>(),
            (first_epoch..=102).collect::<Vec<_>>()
        );

        for (epoch, record) in records {
            assert_eq!(record.slot, duty_slot(validator, epoch.as_u64()));
            assert_eq!(record.inclusion_delay(), Some(1));
            assert_eq!(
                record.attested().map(|vote| vote.head),
                Some(block_root(record.slot))
            );

            let (reward, ideal) = record.reward_and_ideal().unwrap();
            assert_eq!(reward, ideal);
            assert_eq!(reward.total(), IDEAL_HEAD + IDEAL_TARGET + IDEAL_SOURCE);

            let sync = tester.store.get_sync(validator, epoch).unwrap().unwrap();
            assert!(sync.missed.is_empty());
            assert_eq!(sync.rewards.len() as u64, SLOTS_PER_EPOCH);
            assert!(sync.rewards.iter().all(|r| r.reward == SYNC_REWARD));
        }
    }
    assert!(tester.attestation(LATE, 100).is_none());
    assert!(tester.store.get_sync(LATE, Epoch::new(100)).unwrap().is_none());

    for epoch in 100..=102 {
        assert_eq!(
            tester
                .store
                .get_proposal(PROPOSER, proposal_slot(epoch))
                .unwrap(),
            Some(ProposalRecord::Proposed {
                reward: PROPOSER_REWARD
            })
        );
        assert!(tester
            .store
            .get_proposal(ATTESTER, proposal_slot(epoch))
            .unwrap()
            .is_none());
    }
}

#[tokio::test]
async fn blocks_are_fetched_once() {
    let tester = Tester::new(100..=102);
    tester.run_passes(1).await;

    // Epochs 100..=102 plus the inclusion window of 102.
    assert_eq!(tester.beacon.block_requests() as u64, 4 * SLOTS_PER_EPOCH);
}

#[tokio::test]
async fn records_missed_duties() {
    let tester = Tester::new(100..=102);
    let sync_miss = Epoch::new(101).start_slot(SLOTS_PER_EPOCH) + 5;
    tester.beacon.update(|chain| {
        chain.skip_slot(proposal_slot(100));
        chain.drop_attestation(ATTESTER, Epoch::new(101));
        // The proposer holds the first sync committee position.
        chain.drop_sync_signature(sync_miss, 0);
    });
    tester.run_passes(4).await;

    assert_eq!(
        tester
            .store
            .get_proposal(PROPOSER, proposal_slot(100))
            .unwrap(),
        Some(ProposalRecord::Missed)
    );

    let missed = tester.attestation(ATTESTER, 101).unwrap();
    assert!(!missed.is_attested());
    assert!(missed.is_rewarded());
    assert!(tester.attestation(ATTESTER, 102).unwrap().is_attested());

    let sync = tester.store.get_sync(PROPOSER, Epoch::new(101)).unwrap().unwrap();
    assert_eq!(sync.missed.iter().copied().collect::<Vec<_>>(), vec![sync_miss]);
    assert!(sync
        .rewards
        .iter()
        .any(|r| r.slot == sync_miss && r.reward == -SYNC_REWARD));

    // The skipped slot carries no sync aggregate and no reward.
    let sync = tester.store.get_sync(PROPOSER, Epoch::new(100)).unwrap().unwrap();
    assert_eq!(sync.rewards.len() as u64, SLOTS_PER_EPOCH - 1);
    assert!(sync.missed.is_empty());
}

#[tokio::test]
async fn reprocessing_is_idempotent() {
    let tester = Tester::new(100..=102);
    tester.run_passes(4).await;
    let before = tester.attestation(ATTESTER, 101).unwrap();

    tester.beacon.update(|chain| {
        chain.reward_overrides.insert(
            (ATTESTER, Epoch::new(101)),
            TotalAttestationRewards {
                validator_index: ATTESTER,
                head: 0,
                target: 0,
                source: 0,
                inactivity: 0,
            },
        );
    });

    let (duties, full) = tester.run_passes(4).await;
    assert_eq!(duties, PassOutcome::Idle);
    assert_eq!(full, PassOutcome::Idle);

    tester
        .scheduler(4)
        .run_fixup(&[Epoch::new(101)], &[ATTESTER], &tester.exit)
        .await
        .unwrap();
    assert_eq!(tester.attestation(ATTESTER, 101), Some(before));
}

#[tokio::test]
async fn fixup_fills_missing_rewards_only() {
    let tester = Tester::new(100..=102);
    let slot = duty_slot(ATTESTER, 101);
    let mut partial = AttestationRecord::assigned(slot, 0, 0, 2);
    partial.record_inclusion(AttestedVote {
        slot: slot + 1,
        head: block_root(slot),
        source: block_root(Epoch::new(100).start_slot(SLOTS_PER_EPOCH)),
        target: block_root(Epoch::new(101).start_slot(SLOTS_PER_EPOCH)),
    });
    tester
        .store
        .do_atomically(vec![DutyStoreOp::PutAttestation(
            ATTESTER,
            Epoch::new(101),
            partial,
        )])
        .unwrap();

    tester
        .scheduler(4)
        .run_fixup(&[Epoch::new(101)], &[ATTESTER], &tester.exit)
        .await
        .unwrap();

    let fixed = tester.attestation(ATTESTER, 101).unwrap();
    assert_eq!(fixed.inclusion, partial.inclusion);
    let (reward, ideal) = fixed.reward_and_ideal().unwrap();
    assert_eq!(reward, ideal);

    for validator in indices() {
        assert_eq!(tester.watermark(validator, Watermark::NextEpoch), None);
        assert_eq!(tester.watermark(validator, Watermark::DutiesEpoch), None);
    }
    assert!(tester.attestation(ATTESTER, 100).is_none());
    assert!(tester.attestation(ATTESTER, 102).is_none());
    assert!(tester.attestation(PROPOSER, 101).is_none());
}

#[tokio::test]
async fn watermark_stops_at_failed_epoch() {
    let tester = Tester::new(100..=102);
    tester.beacon.update(|chain| {
        chain.failing_epochs = hashset! {Epoch::new(101)};
    });

    let result = tester
        .scheduler(1)
        .run_pass(Pass::Duties, None, &tester.exit)
        .await;
    assert!(matches!(result, Err(Error::BeaconNodeMissing(_))));
    assert_eq!(
        tester.watermark(ATTESTER, Watermark::DutiesEpoch),
        Some(Epoch::new(101))
    );
    assert!(tester.attestation(ATTESTER, 100).is_some());
    assert!(tester.attestation(ATTESTER, 102).is_none());
}

#[tokio::test]
async fn proposer_mismatch_is_fatal() {
    let tester = Tester::new(100..=102);
    tester.beacon.update(|chain| {
        if let Some(block) = chain.blocks.get_mut(&proposal_slot(100)) {
            block.proposer_index = 999;
        }
    });

    let scheduler = tester.scheduler(1);
    scheduler
        .run_pass(Pass::Duties, None, &tester.exit)
        .await
        .unwrap();
    let result = scheduler.run_pass(Pass::Full, None, &tester.exit).await;
    assert!(matches!(result, Err(Error::DataIntegrity(_))));
    assert_eq!(tester.watermark(PROPOSER, Watermark::NextEpoch), None);
}

#[tokio::test]
async fn cancelled_pass_writes_nothing() {
    let tester = Tester::new(100..=102);
    tester.exit.cancel();

    let scheduler = tester.scheduler(4);
    assert_eq!(
        scheduler
            .run_pass(Pass::Duties, None, &tester.exit)
            .await
            .unwrap(),
        PassOutcome::Cancelled
    );
    scheduler.run(false, &tester.exit).await.unwrap();
    assert!(matches!(
        scheduler
            .run_fixup(&[Epoch::new(100)], &[ATTESTER], &tester.exit)
            .await,
        Err(Error::Cancelled)
    ));

    assert_eq!(tester.watermark(ATTESTER, Watermark::DutiesEpoch), None);
    assert!(tester.attestation(ATTESTER, 100).is_none());
}

#[tokio::test]
async fn continuous_run_follows_finalization() {
    let tester = Tester::new(100..=104);
    tester.beacon.set_finalized_epoch(Epoch::new(102));

    let scheduler = Arc::new(tester.scheduler(4));
    let exit = tester.exit.clone();
    let handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run(false, &exit).await }
    });

    let wait_for = |epoch: u64| {
        let tester = &tester;
        async move {
            for _ in 0..500 {
                if tester.watermark(PROPOSER, Watermark::NextEpoch) == Some(Epoch::new(epoch)) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("watermark never reached {}", epoch);
        }
    };

    wait_for(102).await;
    tester.beacon.set_finalized_epoch(Epoch::new(105));
    wait_for(105).await;

    tester.exit.cancel();
    handle.await.unwrap().unwrap();
    assert!(tester.attestation(PROPOSER, 104).unwrap().is_rewarded());
}

#[tokio::test]
async fn window_never_regresses_watermark() {
    let tester = Tester::new(100..=105);
    tester.beacon.set_finalized_epoch(Epoch::new(103));
    tester.run_passes(4).await;
    assert_eq!(
        tester.watermark(PROPOSER, Watermark::NextEpoch),
        Some(Epoch::new(103))
    );

    tester.beacon.set_finalized_epoch(Epoch::new(106));
    let scheduler = tester.scheduler(4);

    // A window behind the watermark reprocesses but leaves it in place.
    scheduler
        .run_window(
            EpochWindow {
                start: Epoch::new(100),
                end: Epoch::new(101),
            },
            false,
            &tester.exit,
        )
        .await
        .unwrap();
    assert_eq!(
        tester.watermark(PROPOSER, Watermark::NextEpoch),
        Some(Epoch::new(103))
    );

    // A window overlapping the watermark carries it forward.
    scheduler
        .run_window(
            EpochWindow {
                start: Epoch::new(102),
                end: Epoch::new(104),
            },
            false,
            &tester.exit,
        )
        .await
        .unwrap();
    assert_eq!(
        tester.watermark(PROPOSER, Watermark::NextEpoch),
        Some(Epoch::new(105))
    );
    assert_eq!(
        tester.watermark(PROPOSER, Watermark::DutiesEpoch),
        Some(Epoch::new(105))
    );
    assert!(tester.attestation(PROPOSER, 104).unwrap().is_rewarded());
    assert!(tester.attestation(PROPOSER, 105).is_none());
}

#[tokio::test]
async fn window_never_skips_uncovered_epochs() {
    let tester = Tester::new(100..=104);
    tester
        .scheduler(4)
        .run_window(
            EpochWindow {
                start: Epoch::new(102),
                end: Epoch::new(103),
            },
            false,
            &tester.exit,
        )
        .await
        .unwrap();

    assert!(tester.attestation(PROPOSER, 102).unwrap().is_rewarded());
    assert!(tester.attestation(PROPOSER, 103).unwrap().is_rewarded());
    assert!(tester.attestation(PROPOSER, 101).is_none());
    assert_eq!(tester.watermark(PROPOSER, Watermark::NextEpoch), None);
    assert_eq!(tester.watermark(PROPOSER, Watermark::DutiesEpoch), None);
}

#[tokio::test]
async fn consistency_check_agrees_with_explorer() {
    let tester = Tester::new(100..=102);
    tester.run_passes(4).await;

    let explorer = Arc::new(MockExplorer::default());
    explorer.insert(MockExplorer::row(
        ATTESTER,
        Epoch::new(101),
        duty_slot(ATTESTER, 101),
        (duty_slot(ATTESTER, 101) + 1).as_u64(),
    ));
    let checker = tester.checker(explorer.clone());

    let record = tester.attestation(ATTESTER, 101).unwrap();
    assert_eq!(
        checker
            .check_record(ATTESTER, Epoch::new(101), record, &tester.exit)
            .await
            .unwrap(),
        CheckOutcome::Consistent {
            validator: ATTESTER,
            epoch: Epoch::new(101)
        }
    );

    let record = tester.attestation(ATTESTER, 102).unwrap();
    assert_eq!(
        checker
            .check_record(ATTESTER, Epoch::new(102), record, &tester.exit)
            .await
            .unwrap(),
        CheckOutcome::Skipped {
            validator: ATTESTER,
            epoch: Epoch::new(102)
        }
    );

    assert!(!matches!(
        checker.check_once(&tester.exit).await.unwrap(),
        CheckOutcome::NothingToSample
    ));
    assert_eq!(explorer.requests(), 3);
}

#[tokio::test]
async fn consistency_check_with_empty_store() {
    let tester = Tester::new(100..=102);
    let checker = tester.checker(Arc::new(MockExplorer::default()));
    assert_eq!(
        checker.check_once(&tester.exit).await.unwrap(),
        CheckOutcome::NothingToSample
    );

    tester.exit.cancel();
    checker.run(&tester.exit).await.unwrap();
}

#[tokio::test]
async fn consistency_check_repairs_stale_record() {
    let tester = Tester::new(100..=102);
    let slot = duty_slot(ATTESTER, 101);
    let stale = AttestationRecord::assigned(slot, 0, 0, 2);
    tester
        .store
        .do_atomically(vec![DutyStoreOp::PutAttestation(
            ATTESTER,
            Epoch::new(101),
            stale,
        )])
        .unwrap();

    let explorer = Arc::new(MockExplorer::default());
    explorer.insert(MockExplorer::row(
        ATTESTER,
        Epoch::new(101),
        slot,
        (slot + 1).as_u64(),
    ));

    let outcome = tester
        .checker(explorer)
        .check_record(ATTESTER, Epoch::new(101), stale, &tester.exit)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CheckOutcome::Repaired {
            validator: ATTESTER,
            epoch: Epoch::new(101)
        }
    );
    let repaired = tester.attestation(ATTESTER, 101).unwrap();
    assert_eq!(repaired.inclusion_delay(), Some(1));
    assert!(repaired.is_rewarded());
}

#[tokio::test]
async fn persistent_mismatch_is_fatal() {
    let tester = Tester::new(100..=102);
    tester.run_passes(4).await;

    let explorer = Arc::new(MockExplorer::default());
    let slot = duty_slot(ATTESTER, 101);
    explorer.insert(MockExplorer::row(
        ATTESTER,
        Epoch::new(101),
        slot,
        (slot + 3).as_u64(),
    ));

    let record = tester.attestation(ATTESTER, 101).unwrap();
    let result = tester
        .checker(explorer)
        .check_record(ATTESTER, Epoch::new(101), record, &tester.exit)
        .await;
    match result {
        Err(Error::ConsistencyMismatch {
            validator, epoch, ..
        }) => {
            assert_eq!(validator, ATTESTER);
            assert_eq!(epoch, Epoch::new(101));
        }
        other => panic!("expected a mismatch, got {:?}", other),
    }
}

#[tokio::test]
async fn suboptimal_reward_for_canonical_vote_is_a_mismatch() {
    let tester = Tester::new(100..=102);
    tester.beacon.update(|chain| {
        chain.reward_overrides.insert(
            (PROPOSER, Epoch::new(101)),
            TotalAttestationRewards {
                validator_index: PROPOSER,
                head: 0,
                target: IDEAL_TARGET,
                source: IDEAL_SOURCE,
                inactivity: 0,
            },
        );
    });
    tester.run_passes(4).await;

    let slot = duty_slot(PROPOSER, 101);
    let explorer = Arc::new(MockExplorer::default());
    explorer.insert(MockExplorer::row(
        PROPOSER,
        Epoch::new(101),
        slot,
        (slot + 1).as_u64(),
    ));

    let record = tester.attestation(PROPOSER, 101).unwrap();
    let result = tester
        .checker(explorer)
        .check_record(PROPOSER, Epoch::new(101), record, &tester.exit)
        .await;
    assert!(matches!(result, Err(Error::ConsistencyMismatch { .. })));
}

#[tokio::test]
async fn sync_reward_without_sync_duty_is_fatal() {
    let tester = Tester::new(100..=102);
    tester.beacon.update(|chain| {
        chain.hidden_sync_committees = hashset! {Epoch::new(101)};
    });

    let result = tester
        .fetcher
        .process_epoch(Epoch::new(101), &indices(), &tester.exit)
        .await;
    assert!(matches!(result, Err(Error::DataIntegrity(_))));
    assert!(tester.store.get_sync(PROPOSER, Epoch::new(101)).unwrap().is_none());
    // The failed scan writes nothing.
    assert!(!tester.attestation(PROPOSER, 101).unwrap().is_attested());
}

#[tokio::test]
async fn unknown_effective_balance_is_fatal() {
    let tester = Tester::new(100..=102);
    tester.beacon.update(|chain| {
        if let Some(data) = chain.validators.get_mut(&ATTESTER) {
            data.validator.effective_balance = EFFECTIVE_BALANCE - 1_000_000_000;
        }
    });

    let result = tester
        .fetcher
        .process_epoch(Epoch::new(100), &indices(), &tester.exit)
        .await;
    assert!(matches!(result, Err(Error::DataIntegrity(_))));

    // Rewards are written in one batch, so the validator with a known balance is not rewarded
    // either.
    for validator in [PROPOSER, ATTESTER] {
        let record = tester.attestation(validator, 100).unwrap();
        assert!(record.is_attested());
        assert!(!record.is_rewarded());
    }
}

#[tokio::test]
async fn malformed_sync_bits_stop_the_watermark() {
    let tester = Tester::new(100..=102);
    tester.beacon.update(|chain| {
        let slot = Epoch::new(101).start_slot(SLOTS_PER_EPOCH) + 2;
        if let Some(aggregate) = chain
            .blocks
            .get_mut(&slot)
            .and_then(|block| block.body.sync_aggregate.as_mut())
        {
            aggregate.sync_committee_bits = "0xff".into();
        }
    });

    let scheduler = tester.scheduler(1);
    scheduler
        .run_pass(Pass::Duties, None, &tester.exit)
        .await
        .unwrap();
    let result = scheduler.run_pass(Pass::Full, None, &tester.exit).await;
    assert!(matches!(
        result,
        Err(Error::MalformedBitfield(
            boolean_bitfield::Error::LengthMismatch {
                expected: SYNC_COMMITTEE_SIZE,
                found: 8
            }
        ))
    ));

    for validator in [PROPOSER, ATTESTER] {
        assert_eq!(
            tester.watermark(validator, Watermark::NextEpoch),
            Some(Epoch::new(101))
        );
    }
    let sync = tester.store.get_sync(PROPOSER, Epoch::new(101)).unwrap().unwrap();
    assert!(sync.rewards.is_empty());
}

#[tokio::test]
async fn truncated_aggregation_bits_are_malformed() {
    let tester = Tester::new(100..=102);
    tester.beacon.update(|chain| {
        if let Some(block) = chain.blocks.get_mut(&(duty_slot(ATTESTER, 101) + 1)) {
            for attestation in &mut block.body.attestations {
                attestation.aggregation_bits = encode_bit_list(&[true]);
            }
        }
    });

    let result = tester
        .fetcher
        .process_epoch(Epoch::new(101), &indices(), &tester.exit)
        .await;
    // The committee holds the attester and one untracked member.
    assert!(matches!(
        result,
        Err(Error::MalformedBitfield(
            boolean_bitfield::Error::LengthMismatch {
                expected: 2,
                found: 1
            }
        ))
    ));
    assert!(!tester.attestation(ATTESTER, 101).unwrap().is_attested());
}

#[tokio::test]
async fn penalised_timely_vote_is_consistent() {
    let tester = Tester::new(100..=102);
    tester.beacon.update(|chain| {
        chain.reward_overrides.insert(
            (PROPOSER, Epoch::new(101)),
            rewards(PROPOSER, 0, -IDEAL_TARGET, -IDEAL_SOURCE),
        );
    });
    tester.run_passes(4).await;

    assert_eq!(
        tester.check_timely_vote(PROPOSER, 101).await.unwrap(),
        CheckOutcome::Consistent {
            validator: PROPOSER,
            epoch: Epoch::new(101)
        }
    );
}

#[tokio::test]
async fn suboptimal_reward_for_orphaned_head_is_consistent() {
    let tester = Tester::new(100..=102);
    let orphaned = Hash256::repeat_byte(0xaa);
    tester.beacon.update(|chain| {
        chain.reward_overrides.insert(
            (PROPOSER, Epoch::new(101)),
            rewards(PROPOSER, 0, IDEAL_TARGET, IDEAL_SOURCE),
        );
        if let Some(block) = chain.blocks.get_mut(&(duty_slot(PROPOSER, 101) + 1)) {
            for attestation in &mut block.body.attestations {
                attestation.data.beacon_block_root = orphaned;
            }
        }
    });
    tester.run_passes(4).await;

    let record = tester.attestation(PROPOSER, 101).unwrap();
    assert_eq!(record.attested().map(|vote| vote.head), Some(orphaned));
    assert_eq!(
        tester.check_timely_vote(PROPOSER, 101).await.unwrap(),
        CheckOutcome::Consistent {
            validator: PROPOSER,
            epoch: Epoch::new(101)
        }
    );
}

#[tokio::test]
async fn suboptimal_reward_without_nearby_block_is_consistent() {
    let tester = Tester::new(100..=102);
    tester.beacon.update(|chain| {
        chain.reward_overrides.insert(
            (PROPOSER, Epoch::new(101)),
            rewards(PROPOSER, 0, IDEAL_TARGET, IDEAL_SOURCE),
        );
    });
    tester.run_passes(4).await;

    // No block within an epoch of the duty leaves nothing to compare the head with.
    let slot = duty_slot(PROPOSER, 101).as_u64();
    tester.beacon.update(|chain| {
        for skipped in slot + 1 - SLOTS_PER_EPOCH..=slot {
            chain.skip_slot(Slot::new(skipped));
        }
    });

    assert_eq!(
        tester.check_timely_vote(PROPOSER, 101).await.unwrap(),
        CheckOutcome::Consistent {
            validator: PROPOSER,
            epoch: Epoch::new(101)
        }
    );
}
