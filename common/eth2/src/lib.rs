//! A wrapper around `reqwest` forming a HTTP client for the subset of the standard beacon node
//! API used to reconstruct validator duties, their outcomes and their rewards.
//!
//! Endpoints which may legitimately return a 404 (e.g. a block at a skipped slot) return
//! `Ok(None)` rather than an error.

pub mod mixin;
pub mod slot_epoch;
pub mod types;

use self::mixin::ResponseOptional;
use self::types::*;
pub use reqwest;
use reqwest::{IntoUrl, Response};
pub use reqwest::{StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::time::Duration;

pub const V1: EndpointVersion = EndpointVersion(1);
pub const V2: EndpointVersion = EndpointVersion(2);

#[derive(Debug)]
pub enum Error {
    /// The `reqwest` client raised an error.
    HttpClient(reqwest::Error),
    /// The server returned an error message where the body was able to be parsed.
    ServerMessage(ErrorMessage),
    /// The server returned an error message where the body was unable to be parsed.
    StatusCode(StatusCode),
    /// The supplied URL is badly formatted. It should look something like `http://127.0.0.1:5052`.
    InvalidUrl(Url),
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::HttpClient(error)
    }
}

impl Error {
    /// If the error has a HTTP status code, return it.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::HttpClient(error) => error.status(),
            Error::ServerMessage(msg) => StatusCode::try_from(msg.code).ok(),
            Error::StatusCode(status) => Some(*status),
            Error::InvalidUrl(_) => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Timeouts for the different classes of request made to the beacon node.
#[derive(Clone, Debug)]
pub struct Timeouts {
    pub default: Duration,
    pub blocks: Duration,
    pub rewards: Duration,
    pub validators: Duration,
}

impl Timeouts {
    pub fn set_all(timeout: Duration) -> Self {
        Timeouts {
            default: timeout,
            blocks: timeout,
            rewards: timeout,
            validators: timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointVersion(pub u64);

impl fmt::Display for EndpointVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A wrapper around `reqwest::Client` which provides convenience methods for interfacing with a
/// beacon node HTTP server.
#[derive(Clone)]
pub struct BeaconNodeHttpClient {
    client: reqwest::Client,
    server: Url,
    timeouts: Timeouts,
}

impl fmt::Display for BeaconNodeHttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.server)
    }
}

impl AsRef<str> for BeaconNodeHttpClient {
    fn as_ref(&self) -> &str {
        self.server.as_ref()
    }
}

impl BeaconNodeHttpClient {
    pub fn new(server: Url, timeouts: Timeouts) -> Self {
        Self {
            client: reqwest::Client::new(),
            server,
            timeouts,
        }
    }

    pub fn from_components(server: Url, client: reqwest::Client, timeouts: Timeouts) -> Self {
        Self {
            client,
            server,
            timeouts,
        }
    }

    /// Return the path with the standard `/eth/vX` prefix applied.
    fn eth_path(&self, version: EndpointVersion) -> Result<Url, Error> {
        let mut path = self.server.clone();

        path.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(self.server.clone()))?
            .push("eth")
            .push(&version.to_string());

        Ok(path)
    }

    /// Return the path `/eth/v1/beacon/states/{state_id}` with `segments` appended.
    fn states_path(&self, state_id: StateId, segments: &[&str]) -> Result<Url, Error> {
        let mut path = self.eth_path(V1)?;

        {
            let mut path_segments = path
                .path_segments_mut()
                .map_err(|()| Error::InvalidUrl(self.server.clone()))?;
            path_segments
                .push("beacon")
                .push("states")
                .push(&state_id.to_string());
            for segment in segments {
                path_segments.push(segment);
            }
        }

        Ok(path)
    }

    /// Perform a HTTP GET request with a custom timeout.
    async fn get_with_timeout<T: DeserializeOwned, U: IntoUrl>(
        &self,
        url: U,
        timeout: Duration,
    ) -> Result<T, Error> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        Ok(ok_or_error(response).await?.json().await?)
    }

    /// Perform a HTTP GET request with a custom timeout, returning `None` on a 404 error.
    async fn get_opt_with_timeout<T: DeserializeOwned, U: IntoUrl>(
        &self,
        url: U,
        timeout: Duration,
    ) -> Result<Option<T>, Error> {
        let response = match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => ok_or_error(response).await,
            Err(e) => Err(e.into()),
        };
        match response.optional()? {
            Some(response) => Ok(Some(response.json().await?)),
            None => Ok(None),
        }
    }

    /// Generic POST function supporting arbitrary responses and timeouts.
    async fn post_generic<T: Serialize, U: IntoUrl>(
        &self,
        url: U,
        body: &T,
        timeout: Option<Duration>,
    ) -> Result<Response, Error> {
        let mut builder = self.client.post(url);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.json(body).send().await?;
        ok_or_error(response).await
    }

    /// `GET beacon/states/{state_id}/finality_checkpoints`
    ///
    /// Returns `Ok(None)` on a 404 error.
    pub async fn get_beacon_states_finality_checkpoints(
        &self,
        state_id: StateId,
    ) -> Result<Option<GenericResponse<FinalityCheckpointsData>>, Error> {
        let path = self.states_path(state_id, &["finality_checkpoints"])?;
        self.get_opt_with_timeout(path, self.timeouts.default).await
    }

    /// `GET beacon/states/{state_id}/validators?id`
    ///
    /// Returns `Ok(None)` on a 404 error.
    pub async fn get_beacon_states_validators(
        &self,
        state_id: StateId,
        ids: &[u64],
    ) -> Result<Option<GenericResponse<Vec<ValidatorData>>>, Error> {
        let mut path = self.states_path(state_id, &["validators"])?;

        let id_string = ids
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        path.query_pairs_mut().append_pair("id", &id_string);

        self.get_opt_with_timeout(path, self.timeouts.validators)
            .await
    }

    /// `GET beacon/states/{state_id}/committees?epoch`
    ///
    /// Returns `Ok(None)` on a 404 error.
    pub async fn get_beacon_states_committees(
        &self,
        state_id: StateId,
        epoch: Option<Epoch>,
    ) -> Result<Option<GenericResponse<Vec<CommitteeData>>>, Error> {
        let mut path = self.states_path(state_id, &["committees"])?;

        if let Some(epoch) = epoch {
            path.query_pairs_mut()
                .append_pair("epoch", &epoch.to_string());
        }

        self.get_opt_with_timeout(path, self.timeouts.default).await
    }

    /// `GET beacon/states/{state_id}/sync_committees?epoch`
    ///
    /// Returns `Ok(None)` on a 404 error, which is also how pre-Altair states respond.
    pub async fn get_beacon_states_sync_committees(
        &self,
        state_id: StateId,
        epoch: Option<Epoch>,
    ) -> Result<Option<GenericResponse<SyncCommitteeByValidatorIndices>>, Error> {
        let mut path = self.states_path(state_id, &["sync_committees"])?;

        if let Some(epoch) = epoch {
            path.query_pairs_mut()
                .append_pair("epoch", &epoch.to_string());
        }

        self.get_opt_with_timeout(path, self.timeouts.default).await
    }

    /// `GET v2/beacon/blocks/{block_id}`
    ///
    /// Returns `Ok(None)` on a 404 error, i.e. a skipped slot.
    pub async fn get_beacon_blocks(
        &self,
        block_id: BlockId,
    ) -> Result<Option<GenericResponse<SignedBeaconBlock>>, Error> {
        let mut path = self.eth_path(V2)?;

        path.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(self.server.clone()))?
            .push("beacon")
            .push("blocks")
            .push(&block_id.to_string());

        self.get_opt_with_timeout(path, self.timeouts.blocks).await
    }

    /// `GET beacon/blocks/{block_id}/root`
    ///
    /// Returns `Ok(None)` on a 404 error.
    pub async fn get_beacon_blocks_root(
        &self,
        block_id: BlockId,
    ) -> Result<Option<GenericResponse<RootData>>, Error> {
        let mut path = self.eth_path(V1)?;

        path.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(self.server.clone()))?
            .push("beacon")
            .push("blocks")
            .push(&block_id.to_string())
            .push("root");

        self.get_opt_with_timeout(path, self.timeouts.blocks).await
    }

    /// `POST beacon/rewards/attestations/{epoch}`
    pub async fn post_beacon_rewards_attestations(
        &self,
        epoch: Epoch,
        ids: &ValidatorIdsRequest,
    ) -> Result<GenericResponse<StandardAttestationRewards>, Error> {
        let mut path = self.eth_path(V1)?;

        path.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(self.server.clone()))?
            .push("beacon")
            .push("rewards")
            .push("attestations")
            .push(&epoch.to_string());

        Ok(self
            .post_generic(path, ids, Some(self.timeouts.rewards))
            .await?
            .json()
            .await?)
    }

    /// `POST beacon/rewards/sync_committee/{block_id}`
    ///
    /// Returns `Ok(None)` on a 404 error.
    pub async fn post_beacon_rewards_sync_committee(
        &self,
        block_id: BlockId,
        ids: &ValidatorIdsRequest,
    ) -> Result<Option<GenericResponse<Vec<SyncCommitteeReward>>>, Error> {
        let mut path = self.eth_path(V1)?;

        path.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(self.server.clone()))?
            .push("beacon")
            .push("rewards")
            .push("sync_committee")
            .push(&block_id.to_string());

        match self
            .post_generic(path, ids, Some(self.timeouts.rewards))
            .await
            .optional()?
        {
            Some(response) => Ok(Some(response.json().await?)),
            None => Ok(None),
        }
    }

    /// `GET beacon/rewards/blocks/{block_id}`
    ///
    /// Returns `Ok(None)` on a 404 error, i.e. the proposer missed the slot.
    pub async fn get_beacon_rewards_blocks(
        &self,
        block_id: BlockId,
    ) -> Result<Option<GenericResponse<StandardBlockReward>>, Error> {
        let mut path = self.eth_path(V1)?;

        path.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(self.server.clone()))?
            .push("beacon")
            .push("rewards")
            .push("blocks")
            .push(&block_id.to_string());

        self.get_opt_with_timeout(path, self.timeouts.rewards).await
    }

    /// `GET validator/duties/proposer/{epoch}`
    pub async fn get_validator_duties_proposer(
        &self,
        epoch: Epoch,
    ) -> Result<GenericResponse<Vec<ProposerData>>, Error> {
        let mut path = self.eth_path(V1)?;

        path.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(self.server.clone()))?
            .push("validator")
            .push("duties")
            .push("proposer")
            .push(&epoch.to_string());

        self.get_with_timeout(path, self.timeouts.default).await
    }
}

/// Returns `Ok(response)` if the response is a `200 OK` response. Otherwise, creates an
/// appropriate error message.
pub async fn ok_or_error(response: Response) -> Result<Response, Error> {
    let status = response.status();

    if status == StatusCode::OK {
        Ok(response)
    } else if let Ok(message) = response.json().await {
        Err(Error::ServerMessage(message))
    } else {
        Err(Error::StatusCode(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> BeaconNodeHttpClient {
        BeaconNodeHttpClient::new(
            Url::parse("http://localhost:5052").unwrap(),
            Timeouts::set_all(Duration::from_secs(1)),
        )
    }

    #[test]
    fn states_path_segments() {
        let path = client()
            .states_path(StateId::Slot(Slot::new(3200)), &["committees"])
            .unwrap();
        assert_eq!(
            path.as_str(),
            "http://localhost:5052/eth/v1/beacon/states/3200/committees"
        );
    }

    #[test]
    fn status_of_server_message() {
        let error = Error::ServerMessage(ErrorMessage {
            code: 404,
            message: "NOT_FOUND: beacon block".into(),
            stacktraces: vec![],
        });
        assert_eq!(error.status(), Some(StatusCode::NOT_FOUND));
    }
}
