//! Store inspection and maintenance commands: `status` and `clear`.

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use log::info;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use trafficsync_core::{DetectionRecord, DetectionStore, PayloadKind};

use crate::{
    ARG_DATABASE, CliError, ENV_CLEAR_DATABASE, ENV_STATUS_DATABASE, open_store, write_json,
};

/// CLI arguments for the `status` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "status",
    about = "Print the detection count and the most recent detection"
)]
#[ortho_config(prefix = "TRAFFICSYNC")]
pub(crate) struct StatusArgs {
    /// Path to the SQLite detection store.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
}

/// CLI arguments for the `clear` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(name = "clear", about = "Delete every stored detection")]
#[ortho_config(prefix = "TRAFFICSYNC")]
pub(crate) struct ClearArgs {
    /// Path to the SQLite detection store.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
}

impl StatusArgs {
    fn into_database(self) -> Result<Utf8PathBuf, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        merged.database.ok_or(CliError::MissingArgument {
            field: ARG_DATABASE,
            env: ENV_STATUS_DATABASE,
        })
    }
}

impl ClearArgs {
    fn into_database(self) -> Result<Utf8PathBuf, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        merged.database.ok_or(CliError::MissingArgument {
            field: ARG_DATABASE,
            env: ENV_CLEAR_DATABASE,
        })
    }
}

/// Output of the `status` command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct StoreReport {
    pub(crate) database: Utf8PathBuf,
    pub(crate) store_count: u64,
    pub(crate) most_recent: Option<DetectionView>,
}

/// JSON rendering of a stored detection with decoded payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct DetectionView {
    pub(crate) timestamp_ms: u64,
    pub(crate) date: Option<String>,
    pub(crate) objects_total: Value,
    pub(crate) objects_by_lane: Value,
    pub(crate) avg_speed_by_lane: Value,
}

impl TryFrom<&DetectionRecord> for DetectionView {
    type Error = CliError;

    fn try_from(record: &DetectionRecord) -> Result<Self, Self::Error> {
        let decode = |kind| {
            record
                .decode_payload::<Value>(kind)
                .map_err(CliError::DecodePayload)
        };
        Ok(Self {
            timestamp_ms: record.timestamp(),
            date: record.date().map(str::to_owned),
            objects_total: decode(PayloadKind::TotalsByType)?,
            objects_by_lane: decode(PayloadKind::TotalsByLane)?,
            avg_speed_by_lane: decode(PayloadKind::AvgSpeedByLane)?,
        })
    }
}

/// Output of the `clear` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub(crate) struct ClearReport {
    pub(crate) deleted: u64,
}

pub(crate) fn run_status_with(args: StatusArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let database = args.into_database()?;
    let report = store_report(database)?;
    write_json(writer, &report)
}

pub(crate) fn run_clear_with(args: ClearArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let database = args.into_database()?;
    let report = clear_store(&database)?;
    write_json(writer, &report)
}

pub(crate) fn store_report(database: Utf8PathBuf) -> Result<StoreReport, CliError> {
    let store = open_store(&database)?;
    let store_count = store.count().map_err(CliError::QueryStore)?;
    let most_recent = store
        .find_most_recent()
        .map_err(CliError::QueryStore)?
        .as_ref()
        .map(DetectionView::try_from)
        .transpose()?;
    Ok(StoreReport {
        database,
        store_count,
        most_recent,
    })
}

pub(crate) fn clear_store(database: &Utf8Path) -> Result<ClearReport, CliError> {
    let store = open_store(database)?;
    let before = store.count().map_err(CliError::QueryStore)?;
    let deleted = store.delete_all().map_err(CliError::QueryStore)?;
    info!("store cleared: database = {database}, before = {before}, deleted = {deleted}");
    Ok(ClearReport { deleted })
}
