use crate::beacon::BeaconApi;
use crate::config::{Config, FixupConfig};
use crate::consistency::ConsistencyChecker;
use crate::fetcher::{DutyFetcher, FetcherConfig};
use crate::metrics;
use crate::updater::EpochScheduler;
use crate::validators::resolve_activation_epochs;
use crate::Error;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use eth2::types::Epoch;
use eth2::{BeaconNodeHttpClient, Timeouts, Url};
use explorer_api::ExplorerHttpClient;
use slog::{crit, debug, info, o, warn, Logger};
use std::sync::Arc;
use std::time::Duration;
use store::{DutyStore, KeyValueStore, MemoryStore, Redb, ShardedStore};
use task_executor::{ShutdownReason, TaskExecutor};

pub const RUN: &str = "run";
pub const CHECK: &str = "check";
pub const FIXUP: &str = "fixup";
pub const SCHEMA_VERSION: &str = "schema-version";
pub const CONFIG: &str = "config";
pub const EPOCHS: &str = "epochs";
pub const VALIDATORS: &str = "validators";

/// Time allowed for in-flight units to settle once a shutdown begins.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Run,
    Check,
    Fixup,
    SchemaVersion,
}

fn run_command() -> Command {
    Command::new(RUN).about(
        "Ingest duties for every tracked validator, following finalization, and audit the \
         results against the explorer if one is configured.",
    )
}

fn check_command() -> Command {
    Command::new(CHECK).about("Run only the consistency checker against the existing store.")
}

fn fixup_command() -> Command {
    Command::new(FIXUP)
        .about("Re-ingest the given epochs for the given validators without moving watermarks.")
        .arg(
            Arg::new(EPOCHS)
                .long(EPOCHS)
                .value_name("EPOCHS")
                .help("Comma-separated epochs to re-ingest. Overrides the config file.")
                .value_delimiter(',')
                .value_parser(value_parser!(u64))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new(VALIDATORS)
                .long(VALIDATORS)
                .value_name("INDICES")
                .help(
                    "Comma-separated validator indices. Defaults to every tracked validator. \
                     Overrides the config file.",
                )
                .value_delimiter(',')
                .value_parser(value_parser!(u64))
                .action(ArgAction::Set),
        )
}

fn schema_version_command() -> Command {
    Command::new(SCHEMA_VERSION).about("Print the schema version of the store and exit.")
}

pub fn app() -> Command {
    Command::new("watch")
        .author("Sigma Prime <contact@sigmaprime.io>")
        .about("Records the duties of a set of validators, and how well they performed them.")
        .arg(
            Arg::new(CONFIG)
                .long(CONFIG)
                .value_name("PATH_TO_CONFIG")
                .help("Path to configuration file")
                .action(ArgAction::Set)
                .global(true),
        )
        .subcommand(run_command())
        .subcommand(check_command())
        .subcommand(fixup_command())
        .subcommand(schema_version_command())
}

fn parse_fixup(matches: &ArgMatches, config: &Config) -> FixupConfig {
    let mut fixup = config.fixup.clone().unwrap_or_default();
    if let Some(epochs) = matches.get_many::<u64>(EPOCHS) {
        fixup.epochs = epochs.copied().map(Epoch::new).collect();
    }
    if let Some(validators) = matches.get_many::<u64>(VALIDATORS) {
        fixup.validators = validators.copied().collect();
    }
    if fixup.validators.is_empty() {
        fixup.validators = config.validators.clone();
    }
    fixup
}

/// Parse the command line, run the selected service to completion and return the reason it
/// stopped.
pub async fn run() -> Result<ShutdownReason, String> {
    let matches = app().get_matches();

    let mut config = match matches.get_one::<String>(CONFIG) {
        Some(path) => Config::load_from_file(path.to_string())?,
        None => Config::default(),
    };

    let mode = match matches.subcommand() {
        Some((RUN, _)) | None if config.fixup.is_some() => Mode::Fixup,
        Some((RUN, _)) | None => Mode::Run,
        Some((CHECK, _)) => Mode::Check,
        Some((FIXUP, sub_matches)) => {
            config.fixup = Some(parse_fixup(sub_matches, &config));
            Mode::Fixup
        }
        Some((SCHEMA_VERSION, _)) => Mode::SchemaVersion,
        _ => return Err("Unsupported subcommand. See --help".into()),
    };

    config
        .validate()
        .map_err(|e| format!("Invalid configuration: {}", e))?;
    let log = logging::build_logger(&config.log_level)?;

    if config.in_memory {
        return start(config, mode, MemoryStore::open(), log).await;
    }

    std::fs::create_dir_all(&config.database_path)
        .map_err(|e| format!("Unable to create database directory: {:?}", e))?;
    if config.shards == 1 {
        let db = Redb::open(&config.database_path)
            .map_err(|e| format!("Unable to open database: {:?}", e))?;
        start(config, mode, db, log).await
    } else {
        let shards = (0..config.shards)
            .map(|shard| Redb::open(&config.database_path.join(format!("shard_{}.redb", shard))))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("Unable to open database shard: {:?}", e))?;
        let db =
            ShardedStore::new(shards).map_err(|e| format!("Unable to shard database: {:?}", e))?;
        start(config, mode, db, log).await
    }
}

async fn start<S: KeyValueStore>(
    config: Config,
    mode: Mode,
    db: S,
    log: Logger,
) -> Result<ShutdownReason, String> {
    let store = Arc::new(
        DutyStore::open(db, config.chain_id, log.new(o!("service" => "store")))
            .map_err(|e| format!("Unable to open store: {:?}", e))?,
    );

    if mode == Mode::SchemaVersion {
        let version = store
            .schema_version()
            .map_err(|e| format!("Unable to read schema version: {:?}", e))?;
        info!(log, "Store schema"; "version" => ?version, "chain_id" => store.chain_id());
        return Ok(ShutdownReason::Success("schema version reported"));
    }

    let server = Url::parse(&config.beacon_node_url)
        .map_err(|e| format!("Invalid beacon node url: {:?}", e))?;
    let beacon = Arc::new(BeaconNodeHttpClient::new(
        server,
        Timeouts::set_all(Duration::from_secs(config.request_timeout_secs)),
    ));
    let fetcher = Arc::new(
        DutyFetcher::new(
            beacon,
            store.clone(),
            FetcherConfig {
                wrap_reward_ids: config.wrap_reward_ids,
                sync_committee_size: config.sync_committee_size,
                block_cache_size: config.block_cache_size,
                block_fetch_concurrency: config.block_fetch_concurrency,
            },
            log.new(o!("service" => "fetcher")),
        )
        .map_err(|e| format!("Unable to build fetcher: {:?}", e))?,
    );

    let (executor, mut signal_rx) = TaskExecutor::with_channel(log.clone());
    let config = Arc::new(config);
    match mode {
        Mode::Run => {
            spawn_scheduler(&executor, fetcher.clone(), config.clone());
            if config.explorer_url.is_some() {
                spawn_checker(&executor, fetcher.clone(), &config)?;
            } else {
                info!(log, "No explorer configured, consistency checks disabled");
            }
        }
        Mode::Check => spawn_checker(&executor, fetcher.clone(), &config)?,
        Mode::Fixup => spawn_fixup(&executor, fetcher.clone(), config.clone()),
        Mode::SchemaVersion => {}
    }

    let reason = tokio::select! {
        reason = signal_rx.recv() => {
            reason.unwrap_or(ShutdownReason::Failure("shutdown channel closed"))
        }
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => {
                info!(log, "Received ctrl-c, shutting down");
                ShutdownReason::Success("received ctrl-c")
            }
            Err(e) => {
                crit!(log, "Unable to listen for ctrl-c"; "error" => %e);
                ShutdownReason::Failure("unable to listen for ctrl-c")
            }
        },
    };

    if !executor.shutdown(SHUTDOWN_TIMEOUT).await {
        warn!(log, "Tasks did not settle before the shutdown timeout");
    }
    store
        .sync()
        .map_err(|e| format!("Unable to flush store: {:?}", e))?;

    match metrics::gather_text() {
        Ok(text) => debug!(log, "Final metrics"; "metrics" => text),
        Err(e) => debug!(log, "Unable to gather metrics"; "error" => e),
    }
    info!(log, "Shutdown complete"; "reason" => reason.message());
    Ok(reason)
}

/// Resolve the tracked validators and drive the scheduler until shutdown. A bounded window shuts
/// the process down once it has been processed.
fn spawn_scheduler<B: BeaconApi, S: KeyValueStore>(
    executor: &TaskExecutor,
    fetcher: Arc<DutyFetcher<B, S>>,
    config: Arc<Config>,
) {
    let log = executor.log().new(o!("service" => "scheduler"));
    let task_executor = executor.clone();
    executor.spawn(
        async move {
            let exit = task_executor.exit();
            let result = async {
                let validators = resolve_activation_epochs(
                    &**fetcher.beacon(),
                    &config.validators,
                    config.max_beacon_range,
                    config.bootstrap_concurrency,
                    |remaining| debug!(log, "Bootstrapping validators"; "remaining" => remaining),
                    &log,
                )
                .await?;
                let scheduler = EpochScheduler::new(
                    fetcher,
                    validators,
                    config.max_epoch_tasks,
                    Duration::from_secs(config.poll_interval_secs),
                    log.clone(),
                )?;
                match config.window() {
                    Some(window) => scheduler.run_window(window, config.duties_only, &exit).await,
                    None => scheduler.run(config.duties_only, &exit).await,
                }
            }
            .await;

            match result {
                Ok(()) if config.window().is_some() && !exit.is_cancelled() => task_executor
                    .request_shutdown(ShutdownReason::Success("override window processed")),
                Ok(()) | Err(Error::Cancelled) => {}
                Err(e) => {
                    crit!(log, "Epoch scheduler failed"; "error" => ?e);
                    task_executor.request_shutdown(ShutdownReason::Failure("epoch scheduler failed"));
                }
            }
        },
        "epoch_scheduler",
    );
}

fn spawn_checker<B: BeaconApi, S: KeyValueStore>(
    executor: &TaskExecutor,
    fetcher: Arc<DutyFetcher<B, S>>,
    config: &Config,
) -> Result<(), String> {
    let log = executor.log().new(o!("service" => "consistency"));
    let explorer_url = config
        .explorer_url
        .as_deref()
        .ok_or("The consistency checker requires explorer_url")?;
    let explorer = Arc::new(ExplorerHttpClient::new(
        explorer_url,
        config.explorer_api_key.clone(),
        log.new(o!("service" => "explorer")),
    )?);
    let checker = ConsistencyChecker::new(fetcher, explorer, config.validators.clone(), log.clone());

    let task_executor = executor.clone();
    executor.spawn(
        async move {
            let exit = task_executor.exit();
            if let Err(e) = checker.run(&exit).await {
                crit!(log, "Consistency check failed"; "error" => ?e);
                task_executor.request_shutdown(ShutdownReason::Failure("consistency check failed"));
            }
        },
        "consistency_checker",
    );
    Ok(())
}

fn spawn_fixup<B: BeaconApi, S: KeyValueStore>(
    executor: &TaskExecutor,
    fetcher: Arc<DutyFetcher<B, S>>,
    config: Arc<Config>,
) {
    let log = executor.log().new(o!("service" => "fixup"));
    let task_executor = executor.clone();
    executor.spawn(
        async move {
            let exit = task_executor.exit();
            let fixup = config.fixup.clone().unwrap_or_default();
            info!(
                log,
                "Starting fixup";
                "epochs" => fixup.epochs.len(),
                "validators" => fixup.validators.len(),
            );

            // Fixup units never consult activation epochs, so no bootstrap is needed.
            let result = match EpochScheduler::new(
                fetcher,
                vec![],
                config.max_epoch_tasks,
                Duration::from_secs(config.poll_interval_secs),
                log.clone(),
            ) {
                Ok(scheduler) => {
                    scheduler
                        .run_fixup(&fixup.epochs, &fixup.validators, &exit)
                        .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => task_executor.request_shutdown(ShutdownReason::Success("fixup complete")),
                Err(Error::Cancelled) => {}
                Err(e) => {
                    crit!(log, "Fixup failed"; "error" => ?e);
                    task_executor.request_shutdown(ShutdownReason::Failure("fixup failed"));
                }
            }
        },
        "fixup",
    );
}
