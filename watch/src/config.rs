use crate::fetcher::{DEFAULT_BLOCK_CACHE_SIZE, DEFAULT_BLOCK_FETCH_CONCURRENCY, SYNC_COMMITTEE_SIZE};
use crate::updater::EpochWindow;
use crate::Error;
use eth2::types::Epoch;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::PathBuf;

pub const DEFAULT_BEACON_NODE_URL: &str = "http://127.0.0.1:5052";
pub const DEFAULT_CHAIN_ID: u64 = 1;
pub const DEFAULT_DATABASE_PATH: &str = "watch_db";
pub const DEFAULT_SHARDS: usize = 1;
pub const DEFAULT_MAX_EPOCH_TASKS: usize = 4;
pub const DEFAULT_MAX_BEACON_RANGE: usize = 100;
pub const DEFAULT_BOOTSTRAP_CONCURRENCY: usize = 4;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Epochs and validators to re-ingest once, without touching watermarks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixupConfig {
    pub epochs: Vec<Epoch>,
    pub validators: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub beacon_node_url: String,
    /// Base URL of the explorer. The consistency checker is disabled when unset.
    pub explorer_url: Option<String>,
    pub explorer_api_key: Option<String>,
    pub chain_id: u64,
    pub database_path: PathBuf,
    pub shards: usize,
    pub in_memory: bool,
    pub validators: Vec<u64>,
    pub max_epoch_tasks: usize,
    pub max_beacon_range: usize,
    pub bootstrap_concurrency: usize,
    pub duties_only: bool,
    pub start_epoch: Option<Epoch>,
    pub end_epoch: Option<Epoch>,
    pub fixup: Option<FixupConfig>,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub wrap_reward_ids: bool,
    pub block_cache_size: usize,
    pub block_fetch_concurrency: usize,
    pub sync_committee_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            beacon_node_url: DEFAULT_BEACON_NODE_URL.to_string(),
            explorer_url: None,
            explorer_api_key: None,
            chain_id: DEFAULT_CHAIN_ID,
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            shards: DEFAULT_SHARDS,
            in_memory: false,
            validators: vec![],
            max_epoch_tasks: DEFAULT_MAX_EPOCH_TASKS,
            max_beacon_range: DEFAULT_MAX_BEACON_RANGE,
            bootstrap_concurrency: DEFAULT_BOOTSTRAP_CONCURRENCY,
            duties_only: false,
            start_epoch: None,
            end_epoch: None,
            fixup: None,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            wrap_reward_ids: false,
            block_cache_size: DEFAULT_BLOCK_CACHE_SIZE,
            block_fetch_concurrency: DEFAULT_BLOCK_FETCH_CONCURRENCY,
            sync_committee_size: SYNC_COMMITTEE_SIZE,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file(path_to_file: String) -> Result<Config, String> {
        let file =
            File::open(path_to_file).map_err(|e| format!("Error reading config file: {:?}", e))?;
        let config: Config = serde_yaml::from_reader(file)
            .map_err(|e| format!("Error parsing config file: {:?}", e))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let non_zero = [
            ("shards", self.shards),
            ("max_epoch_tasks", self.max_epoch_tasks),
            ("max_beacon_range", self.max_beacon_range),
            ("bootstrap_concurrency", self.bootstrap_concurrency),
            ("block_cache_size", self.block_cache_size),
            ("block_fetch_concurrency", self.block_fetch_concurrency),
            ("sync_committee_size", self.sync_committee_size),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(Error::Config(format!("{} must be non-zero", name)));
        }

        if let (Some(start), Some(end)) = (self.start_epoch, self.end_epoch) {
            if end < start {
                return Err(Error::Config(format!(
                    "start_epoch {} is after end_epoch {}",
                    start, end
                )));
            }
        }
        if self.end_epoch.is_some() && self.start_epoch.is_none() {
            return Err(Error::Config("end_epoch requires start_epoch".into()));
        }

        if !logging::LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(Error::Config(format!(
                "unsupported log level {}",
                self.log_level
            )));
        }
        Ok(())
    }

    /// The bounded override window, if one is configured. An open end is filled in by the
    /// scheduler from the finalized epoch.
    pub fn window(&self) -> Option<EpochWindow> {
        self.start_epoch.map(|start| EpochWindow {
            start,
            end: self.end_epoch.unwrap_or_else(Epoch::max_value),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn partial_yaml_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "beacon_node_url: \"http://localhost:5052\"\nvalidators: [1, 2, 3]\nstart_epoch: \"100\"\nend_epoch: \"102\"\nfixup:\n  epochs: [\"7\"]\n  validators: [1]"
        )
        .unwrap();

        let config = Config::load_from_file(file.path().to_string_lossy().into_owned()).unwrap();
        assert_eq!(config.validators, vec![1, 2, 3]);
        assert_eq!(config.max_epoch_tasks, DEFAULT_MAX_EPOCH_TASKS);
        assert_eq!(
            config.window(),
            Some(EpochWindow {
                start: Epoch::new(100),
                end: Epoch::new(102)
            })
        );
        assert_eq!(config.fixup.unwrap().epochs, vec![Epoch::new(7)]);
    }

    #[test]
    fn rejects_bad_values() {
        let config = Config {
            max_epoch_tasks: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = Config {
            shards: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            start_epoch: Some(Epoch::new(10)),
            end_epoch: Some(Epoch::new(9)),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
