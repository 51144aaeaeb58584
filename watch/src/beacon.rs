//! The beacon node surface consumed by the watcher.
//!
//! Production code talks to a `BeaconNodeHttpClient`; tests substitute an in-memory node.
use crate::Error;
use async_trait::async_trait;
use eth2::types::{
    BlockId, CommitteeData, Epoch, Hash256, ProposerData, SignedBeaconBlock, Slot,
    StandardAttestationRewards, StandardBlockReward, StateId, SyncCommitteeReward, ValidatorData,
    ValidatorIdsRequest, SLOTS_PER_EPOCH,
};
use eth2::BeaconNodeHttpClient;

#[async_trait]
pub trait BeaconApi: Send + Sync + 'static {
    /// The first slot of the latest finalized checkpoint epoch.
    async fn finalized_slot(&self) -> Result<Slot, Error>;

    /// Registry entries for `ids` in `state`. Unknown indices are omitted.
    async fn validators(&self, state: StateId, ids: &[u64]) -> Result<Vec<ValidatorData>, Error>;

    async fn committees(&self, epoch: Epoch) -> Result<Vec<CommitteeData>, Error>;

    /// Sync committee members in bit order. `None` before the sync committee fork.
    async fn sync_committee(&self, epoch: Epoch) -> Result<Option<Vec<u64>>, Error>;

    /// `None` for a skipped slot.
    async fn block(&self, slot: Slot) -> Result<Option<SignedBeaconBlock>, Error>;

    /// `None` for a skipped slot.
    async fn block_root(&self, slot: Slot) -> Result<Option<Hash256>, Error>;

    async fn attestation_rewards(
        &self,
        epoch: Epoch,
        ids: &ValidatorIdsRequest,
    ) -> Result<StandardAttestationRewards, Error>;

    /// `None` for a skipped slot.
    async fn sync_committee_rewards(
        &self,
        slot: Slot,
        ids: &ValidatorIdsRequest,
    ) -> Result<Option<Vec<SyncCommitteeReward>>, Error>;

    /// `None` for a skipped slot, i.e. a missed proposal.
    async fn block_reward(&self, slot: Slot) -> Result<Option<StandardBlockReward>, Error>;

    async fn proposer_duties(&self, epoch: Epoch) -> Result<Vec<ProposerData>, Error>;
}

/// Committees are read from the state at the start of the epoch they describe.
fn epoch_state(epoch: Epoch) -> StateId {
    StateId::Slot(epoch.start_slot(SLOTS_PER_EPOCH))
}

#[async_trait]
impl BeaconApi for BeaconNodeHttpClient {
    async fn finalized_slot(&self) -> Result<Slot, Error> {
        let checkpoints = self
            .get_beacon_states_finality_checkpoints(StateId::Head)
            .await?
            .ok_or_else(|| Error::BeaconNodeMissing("head finality checkpoints".into()))?
            .data;
        Ok(checkpoints.finalized.epoch.start_slot(SLOTS_PER_EPOCH))
    }

    async fn validators(&self, state: StateId, ids: &[u64]) -> Result<Vec<ValidatorData>, Error> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        Ok(self
            .get_beacon_states_validators(state, ids)
            .await?
            .map(|response| response.data)
            .unwrap_or_default())
    }

    async fn committees(&self, epoch: Epoch) -> Result<Vec<CommitteeData>, Error> {
        self.get_beacon_states_committees(epoch_state(epoch), Some(epoch))
            .await?
            .map(|response| response.data)
            .ok_or_else(|| Error::BeaconNodeMissing(format!("committees for epoch {}", epoch)))
    }

    async fn sync_committee(&self, epoch: Epoch) -> Result<Option<Vec<u64>>, Error> {
        Ok(self
            .get_beacon_states_sync_committees(epoch_state(epoch), Some(epoch))
            .await?
            .map(|response| response.data.validators))
    }

    async fn block(&self, slot: Slot) -> Result<Option<SignedBeaconBlock>, Error> {
        Ok(self
            .get_beacon_blocks(BlockId::Slot(slot))
            .await?
            .map(|response| response.data))
    }

    async fn block_root(&self, slot: Slot) -> Result<Option<Hash256>, Error> {
        Ok(self
            .get_beacon_blocks_root(BlockId::Slot(slot))
            .await?
            .map(|response| response.data.root))
    }

    async fn attestation_rewards(
        &self,
        epoch: Epoch,
        ids: &ValidatorIdsRequest,
    ) -> Result<StandardAttestationRewards, Error> {
        Ok(self.post_beacon_rewards_attestations(epoch, ids).await?.data)
    }

    async fn sync_committee_rewards(
        &self,
        slot: Slot,
        ids: &ValidatorIdsRequest,
    ) -> Result<Option<Vec<SyncCommitteeReward>>, Error> {
        Ok(self
            .post_beacon_rewards_sync_committee(BlockId::Slot(slot), ids)
            .await?
            .map(|response| response.data))
    }

    async fn block_reward(&self, slot: Slot) -> Result<Option<StandardBlockReward>, Error> {
        Ok(self
            .get_beacon_rewards_blocks(BlockId::Slot(slot))
            .await?
            .map(|response| response.data))
    }

    async fn proposer_duties(&self, epoch: Epoch) -> Result<Vec<ProposerData>, Error> {
        Ok(self.get_validator_duties_proposer(epoch).await?.data)
    }
}
