//! Resolution of the tracked validator set into `(index, activation_epoch)` pairs.
use crate::beacon::BeaconApi;
use crate::Error;
use eth2::types::{Epoch, StateId};
use futures::{stream, StreamExt, TryStreamExt};
use slog::{debug, info, warn, Logger};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TrackedValidator {
    pub index: u64,
    /// The first epoch in which the validator has duties.
    pub activation_epoch: Epoch,
}

impl TrackedValidator {
    pub fn new(index: u64, activation_epoch: Epoch) -> Self {
        Self {
            index,
            activation_epoch,
        }
    }
}

/// Look up the activation epoch of every validator in `indices` at the finalized state.
///
/// Lookups are made in chunks of `max_beacon_range` indices with at most `concurrency` chunks in
/// flight. `on_remaining` is called with the number of indices still unresolved after each chunk.
/// Indices unknown to the beacon node are logged and left out. The result is sorted by index.
pub async fn resolve_activation_epochs<B: BeaconApi>(
    beacon: &B,
    indices: &[u64],
    max_beacon_range: usize,
    concurrency: usize,
    on_remaining: impl Fn(usize),
    log: &Logger,
) -> Result<Vec<TrackedValidator>, Error> {
    if max_beacon_range == 0 || concurrency == 0 {
        return Err(Error::Config(
            "max_beacon_range and bootstrap_concurrency must be non-zero".into(),
        ));
    }

    let mut indices = indices.to_vec();
    indices.sort_unstable();
    indices.dedup();

    let mut remaining = indices.len();
    let mut resolved = BTreeMap::new();
    let lookups: Vec<_> = indices
        .chunks(max_beacon_range)
        .map(|chunk| async move {
            beacon
                .validators(StateId::Finalized, chunk)
                .await
                .map(|data| (chunk.len(), data))
        })
        .collect();
    let mut chunks = stream::iter(lookups).buffer_unordered(concurrency);

    while let Some((requested, data)) = chunks.try_next().await? {
        for validator in data {
            resolved.insert(validator.index, validator.validator.activation_epoch);
        }
        remaining = remaining.saturating_sub(requested);
        debug!(log, "Resolved validator batch"; "remaining" => remaining);
        on_remaining(remaining);
    }

    for index in indices.iter().filter(|index| !resolved.contains_key(index)) {
        warn!(log, "Validator unknown to beacon node"; "validator_index" => index);
    }

    info!(
        log,
        "Resolved tracked validators";
        "requested" => indices.len(),
        "resolved" => resolved.len(),
    );

    Ok(resolved
        .into_iter()
        .map(|(index, activation_epoch)| TrackedValidator::new(index, activation_epoch))
        .collect())
}
