//! Client for a third-party beacon chain explorer, used as an independent source of truth for
//! validator attestation outcomes.
//!
//! Explorers enforce strict rate limits, so every request made through an `ExplorerHttpClient`
//! is spaced at least `MIN_REQUEST_INTERVAL` after the previous one.
mod types;
use std::time::Duration;

use reqwest::{IntoUrl, Response};
pub use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use slog::{debug, trace};
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

pub use types::{ErrorMessage, ExplorerAttestation, ExplorerResponse};

/// Timeout for HTTP requests.
pub const TIMEOUT_DURATION: u64 = 5;
/// Minimum spacing between two requests to the explorer.
pub const MIN_REQUEST_INTERVAL: Duration = Duration::from_secs(1);
/// Rows requested per page of attestation history.
pub const PAGE_SIZE: u64 = 100;
/// Status string carried by successful responses.
pub const STATUS_OK: &str = "OK";

#[derive(Debug)]
pub enum Error {
    /// The `reqwest` client raised an error.
    Reqwest(reqwest::Error),
    /// The supplied URL is badly formatted. It should look something like `https://beaconcha.in`.
    InvalidUrl(Url),
    /// The server returned an error message where the body was able to be parsed.
    ServerMessage(ErrorMessage),
    /// The server returned an error message where the body was unable to be parsed.
    StatusCode(StatusCode),
    /// The server answered `200 OK` but flagged the response as unsuccessful.
    Status(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub struct ExplorerHttpClient {
    client: reqwest::Client,
    explorer_endpoint: Url,
    api_key: Option<String>,
    min_request_interval: Duration,
    last_request: Mutex<Option<Instant>>,
    log: slog::Logger,
}

impl ExplorerHttpClient {
    pub fn new(
        explorer_endpoint: &str,
        api_key: Option<String>,
        log: slog::Logger,
    ) -> Result<Self, String> {
        Ok(Self {
            client: reqwest::Client::new(),
            explorer_endpoint: Url::parse(explorer_endpoint)
                .map_err(|e| format!("Invalid explorer endpoint: {}", e))?,
            api_key,
            min_request_interval: MIN_REQUEST_INTERVAL,
            last_request: Mutex::new(None),
            log,
        })
    }

    /// Override the request spacing. Only intended for tests against local servers.
    pub fn with_min_request_interval(mut self, interval: Duration) -> Self {
        self.min_request_interval = interval;
        self
    }

    /// Wait until at least `min_request_interval` has elapsed since the previous request.
    ///
    /// The lock is held across the sleep so concurrent callers queue up behind each other.
    async fn throttle(&self) {
        let mut last_request = self.last_request.lock().await;
        if let Some(previous) = *last_request {
            let next = previous + self.min_request_interval;
            if next > Instant::now() {
                trace!(self.log, "Throttling explorer request"; "until" => ?next);
                sleep_until(next).await;
            }
        }
        *last_request = Some(Instant::now());
    }

    /// Perform a rate-limited HTTP GET request.
    async fn get<T: DeserializeOwned, U: IntoUrl>(&self, url: U) -> Result<T, Error> {
        self.throttle().await;
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(TIMEOUT_DURATION))
            .send()
            .await
            .map_err(Error::Reqwest)?;
        ok_or_error(response)
            .await?
            .json()
            .await
            .map_err(Error::Reqwest)
    }

    /// `GET api/v1/validator/{index}/attestations?limit&offset`
    pub async fn get_validator_attestations_page(
        &self,
        validator_index: u64,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<ExplorerAttestation>, Error> {
        let mut path = self.explorer_endpoint.clone();

        path.path_segments_mut()
            .map_err(|()| Error::InvalidUrl(self.explorer_endpoint.clone()))?
            .push("api")
            .push("v1")
            .push("validator")
            .push(&validator_index.to_string())
            .push("attestations");

        path.query_pairs_mut()
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string());
        if let Some(api_key) = &self.api_key {
            path.query_pairs_mut().append_pair("apikey", api_key);
        }

        let response: ExplorerResponse<Vec<ExplorerAttestation>> = self.get(path).await?;
        if response.status != STATUS_OK {
            return Err(Error::Status(response.status));
        }
        Ok(response.data)
    }

    /// Find the explorer's record of `validator_index`'s attestation in `epoch`.
    ///
    /// History is served newest first, so pages are walked until the epoch is found or the page
    /// has moved past it. Returns `Ok(None)` if the explorer has no row for the epoch.
    pub async fn get_validator_attestation(
        &self,
        validator_index: u64,
        epoch: u64,
    ) -> Result<Option<ExplorerAttestation>, Error> {
        let mut offset = 0;
        loop {
            let page = self
                .get_validator_attestations_page(validator_index, PAGE_SIZE, offset)
                .await?;

            if let Some(row) = page.iter().find(|row| row.epoch == epoch) {
                return Ok(Some(*row));
            }

            let passed_epoch = page.iter().any(|row| row.epoch < epoch);
            if page.len() < PAGE_SIZE as usize || passed_epoch {
                debug!(
                    self.log,
                    "Explorer has no attestation record";
                    "validator_index" => validator_index,
                    "epoch" => epoch,
                );
                return Ok(None);
            }
            offset += page.len() as u64;
        }
    }
}

/// Returns `Ok(response)` if the response is a `200 OK` response. Otherwise, creates an
/// appropriate error message.
async fn ok_or_error(response: Response) -> Result<Response, Error> {
    let status = response.status();

    if status == StatusCode::OK {
        Ok(response)
    } else if let Ok(message) = response.json().await {
        Err(Error::ServerMessage(message))
    } else {
        Err(Error::StatusCode(status))
    }
}
