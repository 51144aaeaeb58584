use crate::Error;
use async_trait::async_trait;
use eth2::types::Epoch;
use explorer_api::{ExplorerAttestation, ExplorerHttpClient};

/// An independent source of attestation outcomes, used to audit the store.
#[async_trait]
pub trait Explorer: Send + Sync + 'static {
    /// The explorer's view of `validator_index`'s attestation in `epoch`, if it has one.
    async fn attestation(
        &self,
        validator_index: u64,
        epoch: Epoch,
    ) -> Result<Option<ExplorerAttestation>, Error>;
}

#[async_trait]
impl Explorer for ExplorerHttpClient {
    async fn attestation(
        &self,
        validator_index: u64,
        epoch: Epoch,
    ) -> Result<Option<ExplorerAttestation>, Error> {
        Ok(self
            .get_validator_attestation(validator_index, epoch.as_u64())
            .await?)
    }
}
