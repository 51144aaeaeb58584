use crate::key::{
    attestation_key, duties_epoch_key, next_epoch_key, proposal_key, record_kind_prefix,
    schema_version_key, sync_key, trailing_int, ATTESTATION,
};
use crate::metadata::{SchemaVersion, CURRENT_SCHEMA_VERSION};
use crate::records::{AttestationRecord, ProposalRecord, SyncRecord};
use crate::{u64_from_be_bytes, Error, Key, KeyValueStore, KeyValueStoreOp, StoreItem};
use eth2::types::{Epoch, Slot};
use slog::{debug, info, Logger};
use std::fmt;

/// The two per-validator checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Watermark {
    /// Every duty type is ingested for all epochs below this one.
    NextEpoch,
    /// Attestation assignments are ingested for all epochs below this one.
    DutiesEpoch,
}

impl Watermark {
    fn key(self, chain_id: u64, validator_index: u64) -> Key {
        match self {
            Watermark::NextEpoch => next_epoch_key(chain_id, validator_index),
            Watermark::DutiesEpoch => duties_epoch_key(chain_id, validator_index),
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Watermark::NextEpoch => write!(f, "next_epoch"),
            Watermark::DutiesEpoch => write!(f, "duties_epoch"),
        }
    }
}

/// A typed write, applied in batches by `DutyStore::do_atomically`.
#[derive(Debug, Clone, PartialEq)]
pub enum DutyStoreOp {
    PutAttestation(u64, Epoch, AttestationRecord),
    PutSync(u64, Epoch, SyncRecord),
    PutProposal(u64, Slot, ProposalRecord),
    PutWatermark(u64, Watermark, Epoch),
}

/// Typed access to duty records and watermarks for one chain.
pub struct DutyStore<S: KeyValueStore> {
    db: S,
    chain_id: u64,
    log: Logger,
}

impl<S: KeyValueStore> DutyStore<S> {
    /// Wrap `db`, writing the schema version on first use and rejecting databases written with a
    /// different one.
    pub fn open(db: S, chain_id: u64, log: Logger) -> Result<Self, Error> {
        let store = Self { db, chain_id, log };

        match store.schema_version()? {
            Some(database_schema_version) if database_schema_version != CURRENT_SCHEMA_VERSION => {
                return Err(Error::IncompatibleSchemaVersion {
                    database_schema_version,
                    software_schema_version: CURRENT_SCHEMA_VERSION,
                });
            }
            Some(_) => {
                debug!(store.log, "Opened existing duty store"; "chain_id" => chain_id);
            }
            None => {
                let key = schema_version_key(chain_id);
                store
                    .db
                    .put_bytes(key.as_bytes(), &CURRENT_SCHEMA_VERSION.as_store_bytes())?;
                info!(
                    store.log,
                    "Initialized duty store";
                    "chain_id" => chain_id,
                    "schema_version" => CURRENT_SCHEMA_VERSION.as_u64(),
                );
            }
        }

        Ok(store)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn schema_version(&self) -> Result<Option<SchemaVersion>, Error> {
        self.get_item(&schema_version_key(self.chain_id))
    }

    fn get_item<I: StoreItem>(&self, key: &Key) -> Result<Option<I>, Error> {
        self.db
            .get_bytes(key.as_bytes())?
            .map(|bytes| I::from_store_bytes(&bytes))
            .transpose()
    }

    pub fn get_attestation(
        &self,
        validator_index: u64,
        epoch: Epoch,
    ) -> Result<Option<AttestationRecord>, Error> {
        self.get_item(&attestation_key(
            self.chain_id,
            validator_index,
            epoch.as_u64(),
        ))
    }

    pub fn get_sync(&self, validator_index: u64, epoch: Epoch) -> Result<Option<SyncRecord>, Error> {
        self.get_item(&sync_key(self.chain_id, validator_index, epoch.as_u64()))
    }

    pub fn get_proposal(
        &self,
        validator_index: u64,
        slot: Slot,
    ) -> Result<Option<ProposalRecord>, Error> {
        self.get_item(&proposal_key(self.chain_id, validator_index, slot.as_u64()))
    }

    /// All attestation records of `validator_index` with `start <= epoch < end`, in epoch order.
    pub fn attestations_in_range(
        &self,
        validator_index: u64,
        start: Epoch,
        end: Epoch,
    ) -> Result<Vec<(Epoch, AttestationRecord)>, Error> {
        let start_key = attestation_key(self.chain_id, validator_index, start.as_u64());
        let end_key = attestation_key(self.chain_id, validator_index, end.as_u64());
        self.db
            .iter_range(start_key.as_bytes(), end_key.as_bytes())?
            .into_iter()
            .map(|(key, value)| {
                Ok((
                    Epoch::new(trailing_int(&key)?),
                    AttestationRecord::from_store_bytes(&value)?,
                ))
            })
            .collect()
    }

    /// Every attestation record of `validator_index`, in epoch order.
    pub fn attestations(&self, validator_index: u64) -> Result<Vec<(Epoch, AttestationRecord)>, Error> {
        let (start, end) = record_kind_prefix(self.chain_id, validator_index, ATTESTATION)
            .prefix_range();
        self.db
            .iter_range(&start, &end)?
            .into_iter()
            .map(|(key, value)| {
                Ok((
                    Epoch::new(trailing_int(&key)?),
                    AttestationRecord::from_store_bytes(&value)?,
                ))
            })
            .collect()
    }

    pub fn get_watermark(
        &self,
        validator_index: u64,
        watermark: Watermark,
    ) -> Result<Option<Epoch>, Error> {
        let key = watermark.key(self.chain_id, validator_index);
        self.db
            .get_bytes(key.as_bytes())?
            .map(|bytes| u64_from_be_bytes(&bytes).map(Epoch::new))
            .transpose()
    }

    /// Convert `ops` into key-value operations and apply them as a single batch.
    pub fn do_atomically(&self, ops: Vec<DutyStoreOp>) -> Result<(), Error> {
        if ops.is_empty() {
            return Ok(());
        }
        let batch = self.convert_to_kv_batch(ops);
        self.db.do_atomically(batch)
    }

    fn convert_to_kv_batch(&self, ops: Vec<DutyStoreOp>) -> Vec<KeyValueStoreOp> {
        let chain_id = self.chain_id;
        ops.into_iter()
            .map(|op| match op {
                DutyStoreOp::PutAttestation(validator, epoch, record) => {
                    record.as_kv_store_op(&attestation_key(chain_id, validator, epoch.as_u64()))
                }
                DutyStoreOp::PutSync(validator, epoch, record) => {
                    record.as_kv_store_op(&sync_key(chain_id, validator, epoch.as_u64()))
                }
                DutyStoreOp::PutProposal(validator, slot, record) => {
                    record.as_kv_store_op(&proposal_key(chain_id, validator, slot.as_u64()))
                }
                DutyStoreOp::PutWatermark(validator, watermark, epoch) => {
                    KeyValueStoreOp::PutKeyValue(
                        watermark.key(chain_id, validator).into_bytes(),
                        epoch.as_u64().to_be_bytes().to_vec(),
                    )
                }
            })
            .collect()
    }

    pub fn sync(&self) -> Result<(), Error> {
        self.db.sync()
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }
}
