//! Command-line interface for the trafficsync snapshot pipeline.
//!
//! Subcommands:
//! - `watch`: keep the store synchronised with the snapshot until Ctrl-C.
//! - `sync`: ingest the snapshot once and print the outcome.
//! - `status`: print the store count and the most recent detection.
//! - `clear`: delete every stored detection.
//!
//! Options layer as CLI flags over `TRAFFICSYNC_CMDS_<COMMAND>_*` environment
//! variables over configuration files, courtesy of `ortho_config`.
#![forbid(unsafe_code)]

use std::io::Write;
use std::sync::Arc;

use camino::Utf8Path;
use clap::{Parser, Subcommand};
use serde::Serialize;
use trafficsync_core::SqliteDetectionStore;

mod error;
mod maintenance;
mod sync;
mod watch;

pub use error::CliError;

use maintenance::{ClearArgs, StatusArgs};
use sync::SyncArgs;
use watch::WatchArgs;

const ARG_DATABASE: &str = "database";
const ARG_DIRECTORY: &str = "directory";
const ARG_FILE_NAME: &str = "file-name";
const ARG_BATCH_SIZE: &str = "batch-size";
const ARG_QUIET_WINDOW_MS: &str = "quiet-window-ms";
const ARG_POLL_INTERVAL_MS: &str = "poll-interval-ms";
const ARG_RETRY_BACKOFF_MS: &str = "retry-backoff-ms";
const ARG_MAX_ATTEMPTS: &str = "max-attempts";
const ARG_SHUTDOWN_GRACE_MS: &str = "shutdown-grace-ms";
const ENV_WATCH_DATABASE: &str = "TRAFFICSYNC_CMDS_WATCH_DATABASE";
const ENV_SYNC_DATABASE: &str = "TRAFFICSYNC_CMDS_SYNC_DATABASE";
const ENV_STATUS_DATABASE: &str = "TRAFFICSYNC_CMDS_STATUS_DATABASE";
const ENV_CLEAR_DATABASE: &str = "TRAFFICSYNC_CMDS_CLEAR_DATABASE";

/// Run the trafficsync CLI with the current process arguments and environment.
pub fn run() -> Result<(), CliError> {
    let cli = Cli::try_parse().map_err(CliError::ArgumentParsing)?;
    let mut stdout = std::io::stdout().lock();
    match cli.command {
        Command::Watch(args) => watch::run_watch(args),
        Command::Sync(args) => sync::run_sync_with(args, &mut stdout),
        Command::Status(args) => maintenance::run_status_with(args, &mut stdout),
        Command::Clear(args) => maintenance::run_clear_with(args, &mut stdout),
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "trafficsync",
    about = "Keep a detection store synchronised with a traffic snapshot file",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch the snapshot directory and reload on every change.
    Watch(WatchArgs),
    /// Ingest the snapshot once.
    Sync(SyncArgs),
    /// Report what the store currently holds.
    Status(StatusArgs),
    /// Delete every stored detection.
    Clear(ClearArgs),
}

/// Open the SQLite store at `path`, creating its parent directory.
fn open_store(path: &Utf8Path) -> Result<Arc<SqliteDetectionStore>, CliError> {
    trafficsync_fs::ensure_parent_dir(path).map_err(|source| CliError::PrepareDatabase {
        path: path.to_path_buf(),
        source,
    })?;
    let store =
        SqliteDetectionStore::open(path.as_std_path()).map_err(|source| CliError::OpenStore {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Arc::new(store))
}

/// Write `value` as pretty JSON followed by a newline.
fn write_json<T: Serialize>(writer: &mut dyn Write, value: &T) -> Result<(), CliError> {
    let payload = serde_json::to_string_pretty(value).map_err(CliError::SerialiseOutput)?;
    writer
        .write_all(payload.as_bytes())
        .map_err(CliError::WriteOutput)?;
    writer.write_all(b"\n").map_err(CliError::WriteOutput)?;
    Ok(())
}

/// Reject `value` when it is below `minimum`.
const fn require_at_least(field: &'static str, value: u64, minimum: u64) -> Result<u64, CliError> {
    if value < minimum {
        Err(CliError::OutOfRange {
            field,
            minimum,
            value,
        })
    } else {
        Ok(value)
    }
}

#[cfg(test)]
mod tests;
