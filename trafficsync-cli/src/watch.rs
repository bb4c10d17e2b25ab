//! Long-running `watch` command.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use log::info;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};
use trafficsync_core::JsonSnapshotParser;
use trafficsync_ingest::{RetryPolicy, SyncConfig, SyncService, SyncStatus};

use crate::{
    ARG_BATCH_SIZE, ARG_DATABASE, ARG_DIRECTORY, ARG_FILE_NAME, ARG_MAX_ATTEMPTS,
    ARG_POLL_INTERVAL_MS, ARG_QUIET_WINDOW_MS, ARG_RETRY_BACKOFF_MS, ARG_SHUTDOWN_GRACE_MS,
    CliError, ENV_WATCH_DATABASE, open_store, require_at_least,
};

/// CLI arguments for the `watch` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "watch",
    long_about = "Load the snapshot once, then watch its directory and \
                 replace the store contents whenever the file settles after \
                 a change. Runs until interrupted with Ctrl-C.",
    about = "Keep the store synchronised with the snapshot"
)]
#[ortho_config(prefix = "TRAFFICSYNC")]
pub(crate) struct WatchArgs {
    /// Path to the SQLite detection store.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
    /// Directory holding the snapshot file.
    #[arg(long = ARG_DIRECTORY, value_name = "dir")]
    #[serde(default)]
    pub(crate) directory: Option<Utf8PathBuf>,
    /// Snapshot file name inside the directory.
    #[arg(long = ARG_FILE_NAME, value_name = "name")]
    #[serde(default)]
    pub(crate) file_name: Option<String>,
    /// Quiet period after the last change before a reload.
    #[arg(long = ARG_QUIET_WINDOW_MS, value_name = "ms")]
    #[serde(default)]
    pub(crate) quiet_window_ms: Option<u64>,
    /// Upper bound on how long the watcher blocks between stop checks.
    #[arg(long = ARG_POLL_INTERVAL_MS, value_name = "ms")]
    #[serde(default)]
    pub(crate) poll_interval_ms: Option<u64>,
    /// Records inserted per batch.
    #[arg(long = ARG_BATCH_SIZE, value_name = "count")]
    #[serde(default)]
    pub(crate) batch_size: Option<u64>,
    /// Delay before a transient failure is retried.
    #[arg(long = ARG_RETRY_BACKOFF_MS, value_name = "ms")]
    #[serde(default)]
    pub(crate) retry_backoff_ms: Option<u64>,
    /// Retries attempted before a transient failure is dropped.
    #[arg(long = ARG_MAX_ATTEMPTS, value_name = "count")]
    #[serde(default)]
    pub(crate) max_attempts: Option<u32>,
    /// Time an in-flight reload is given to finish at shutdown.
    #[arg(long = ARG_SHUTDOWN_GRACE_MS, value_name = "ms")]
    #[serde(default)]
    pub(crate) shutdown_grace_ms: Option<u64>,
}

impl WatchArgs {
    fn into_config(self) -> Result<WatchConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        WatchConfig::try_from(merged)
    }
}

/// Resolved `watch` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WatchConfig {
    pub(crate) database: Utf8PathBuf,
    pub(crate) sync: SyncConfig,
}

impl TryFrom<WatchArgs> for WatchConfig {
    type Error = CliError;

    fn try_from(args: WatchArgs) -> Result<Self, Self::Error> {
        let database = args.database.ok_or(CliError::MissingArgument {
            field: ARG_DATABASE,
            env: ENV_WATCH_DATABASE,
        })?;

        let mut sync = args.directory.map_or_else(SyncConfig::default, SyncConfig::new);
        if let Some(file_name) = args.file_name {
            sync = sync.with_file_name(file_name);
        }
        if let Some(ms) = args.quiet_window_ms {
            sync = sync.with_quiet_window(Duration::from_millis(ms));
        }
        if let Some(ms) = args.poll_interval_ms {
            let checked = require_at_least(ARG_POLL_INTERVAL_MS, ms, 1)?;
            sync = sync.with_poll_interval(Duration::from_millis(checked));
        }
        if let Some(count) = args.batch_size {
            let checked = require_at_least(ARG_BATCH_SIZE, count, 1)?;
            sync = sync.with_batch_size(usize::try_from(checked).unwrap_or(usize::MAX));
        }
        let defaults = RetryPolicy::default();
        sync = sync.with_retry(RetryPolicy {
            backoff: args
                .retry_backoff_ms
                .map_or(defaults.backoff, Duration::from_millis),
            max_attempts: args.max_attempts.unwrap_or(defaults.max_attempts),
        });
        if let Some(ms) = args.shutdown_grace_ms {
            sync = sync.with_shutdown_grace(Duration::from_millis(ms));
        }
        Ok(Self { database, sync })
    }
}

pub(crate) fn run_watch(args: WatchArgs) -> Result<(), CliError> {
    let config = args.into_config()?;
    run_watch_until(&config, wait_for_ctrl_c).map(|_| ())
}

/// Run the pipeline until `shutdown` returns, then stop it.
///
/// Returns the pipeline status observed just before stopping.
pub(crate) fn run_watch_until<F>(config: &WatchConfig, shutdown: F) -> Result<SyncStatus, CliError>
where
    F: FnOnce() -> Result<(), CliError>,
{
    let store = open_store(&config.database)?;
    let service = SyncService::new(config.sync.clone(), store, Arc::new(JsonSnapshotParser))?;
    service.start()?;
    info!(
        "watching {} (store {}), press Ctrl-C to stop",
        config.sync.snapshot_path(),
        config.database
    );

    let waited = shutdown();
    let status = service.status();
    service.stop();
    waited?;
    Ok(status)
}

fn wait_for_ctrl_c() -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(CliError::Signal)?;
    runtime
        .block_on(tokio::signal::ctrl_c())
        .map_err(CliError::Signal)?;
    info!("shutdown requested");
    Ok(())
}
