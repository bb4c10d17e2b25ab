//! Error types emitted by the trafficsync CLI.
//!
//! Keep this error type reasonably small, as every command helper returns
//! `Result<_, CliError>` and the workspace enables `clippy::result_large_err`.

use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;
use trafficsync_core::StoreError;
use trafficsync_ingest::{IngestError, SyncError};

/// Errors emitted by the trafficsync CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed Clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// Configuration layering failed (files, env, CLI).
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] Arc<ortho_config::OrthoError>),
    /// A required option is missing after configuration merging.
    #[error("missing {field} (set --{field} or {env})")]
    MissingArgument {
        /// Flag name without leading dashes.
        field: &'static str,
        /// Environment variable that can supply the value.
        env: &'static str,
    },
    /// A numeric option is outside its accepted range.
    #[error("{field} must be at least {minimum}, got {value}")]
    OutOfRange {
        /// Flag name without leading dashes.
        field: &'static str,
        /// Smallest accepted value.
        minimum: u64,
        /// Value supplied.
        value: u64,
    },
    /// The database directory could not be prepared.
    #[error("failed to prepare database directory for {path:?}: {source}")]
    PrepareDatabase {
        /// Database path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Opening the detection store failed.
    #[error("failed to open detection store at {path:?}: {source}")]
    OpenStore {
        /// Database path.
        path: Utf8PathBuf,
        /// Store failure.
        #[source]
        source: StoreError,
    },
    /// Querying the detection store failed.
    #[error("failed to query detection store: {0}")]
    QueryStore(#[source] StoreError),
    /// A stored payload could not be decoded for output.
    #[error("failed to decode stored payload: {0}")]
    DecodePayload(#[source] serde_json::Error),
    /// A one-shot ingest failed.
    #[error(transparent)]
    Ingest(#[from] IngestError),
    /// The watch pipeline failed.
    #[error(transparent)]
    Sync(#[from] SyncError),
    /// Waiting for the shutdown signal failed.
    #[error("failed to wait for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),
    /// Serialising command output failed.
    #[error("failed to serialise output: {0}")]
    SerialiseOutput(#[source] serde_json::Error),
    /// Writing command output failed.
    #[error("failed to write output: {0}")]
    WriteOutput(#[source] std::io::Error),
}
