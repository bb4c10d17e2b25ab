//! One-shot `sync` command.

use std::io::Write;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::Parser;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};
use trafficsync_core::JsonSnapshotParser;
use trafficsync_ingest::config::{DEFAULT_BATCH_SIZE, DEFAULT_DIRECTORY, DEFAULT_FILE_NAME};
use trafficsync_ingest::{IngestOutcome, Ingestor};

use crate::{
    ARG_BATCH_SIZE, ARG_DATABASE, ARG_DIRECTORY, ARG_FILE_NAME, CliError, ENV_SYNC_DATABASE,
    open_store, require_at_least, write_json,
};

/// CLI arguments for the `sync` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "sync",
    long_about = "Replace the store contents from the snapshot file once and \
                 print the outcome as JSON. A missing or empty snapshot \
                 leaves the store untouched.",
    about = "Ingest the snapshot once"
)]
#[ortho_config(prefix = "TRAFFICSYNC")]
pub(crate) struct SyncArgs {
    /// Snapshot to ingest; defaults to `<directory>/<file-name>`.
    #[arg(value_name = "path")]
    #[serde(default)]
    pub(crate) snapshot: Option<Utf8PathBuf>,
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
    /// Records inserted per batch.
    #[arg(long = ARG_BATCH_SIZE, value_name = "count")]
    #[serde(default)]
    pub(crate) batch_size: Option<u64>,
}

impl SyncArgs {
    fn into_config(self) -> Result<SyncCommandConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        SyncCommandConfig::try_from(merged)
    }
}

/// Resolved `sync` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SyncCommandConfig {
    pub(crate) database: Utf8PathBuf,
    pub(crate) snapshot: Utf8PathBuf,
    pub(crate) batch_size: usize,
}

impl TryFrom<SyncArgs> for SyncCommandConfig {
    type Error = CliError;

    fn try_from(args: SyncArgs) -> Result<Self, Self::Error> {
        let database = args.database.ok_or(CliError::MissingArgument {
            field: ARG_DATABASE,
            env: ENV_SYNC_DATABASE,
        })?;
        let snapshot = args.snapshot.unwrap_or_else(|| {
            let directory = args
                .directory
                .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_DIRECTORY));
            let file_name = args
                .file_name
                .unwrap_or_else(|| DEFAULT_FILE_NAME.to_owned());
            directory.join(file_name)
        });
        let batch_size = match args.batch_size {
            Some(value) => usize::try_from(require_at_least(ARG_BATCH_SIZE, value, 1)?)
                .unwrap_or(usize::MAX),
            None => DEFAULT_BATCH_SIZE,
        };
        Ok(Self {
            database,
            snapshot,
            batch_size,
        })
    }
}

pub(crate) fn run_sync_with(args: SyncArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let config = args.into_config()?;
    let outcome = execute_sync(&config)?;
    write_json(writer, &outcome)
}

pub(crate) fn execute_sync(config: &SyncCommandConfig) -> Result<IngestOutcome, CliError> {
    let store = open_store(&config.database)?;
    let ingestor = Ingestor::new(store, Arc::new(JsonSnapshotParser), config.batch_size);
    Ok(ingestor.ingest(&config.snapshot)?)
}
