//! Focused unit tests covering CLI configuration resolution.

use super::*;
use crate::sync::SyncCommandConfig;
use crate::watch::WatchConfig;
use camino::Utf8PathBuf;
use clap::CommandFactory;
use rstest::rstest;
use std::time::Duration;
use trafficsync_ingest::config::{DEFAULT_BATCH_SIZE, DEFAULT_FILE_NAME};
use trafficsync_ingest::{RetryPolicy, SyncConfig};

#[rstest]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[rstest]
#[case::watch(&["trafficsync", "watch", "--database", "d.db"])]
#[case::sync(&["trafficsync", "sync", "--database", "d.db", "snapshot.json"])]
#[case::status(&["trafficsync", "status", "--database", "d.db"])]
#[case::clear(&["trafficsync", "clear", "--database", "d.db"])]
fn parses_every_subcommand(#[case] argv: &[&str]) {
    let cli = Cli::try_parse_from(argv).expect("arguments should parse");
    let database = match cli.command {
        Command::Watch(args) => args.database,
        Command::Sync(args) => args.database,
        Command::Status(args) => args.database,
        Command::Clear(args) => args.database,
    };
    assert_eq!(database, Some(Utf8PathBuf::from("d.db")));
}

#[rstest]
fn unknown_subcommand_is_rejected() {
    let err = Cli::try_parse_from(["trafficsync", "frobnicate"]).expect_err("unknown command");
    assert_eq!(err.kind(), clap::error::ErrorKind::InvalidSubcommand);
}

#[rstest]
fn watch_requires_database() {
    let err = WatchConfig::try_from(WatchArgs::default()).expect_err("missing database");
    match err {
        CliError::MissingArgument { field, env } => {
            assert_eq!(field, ARG_DATABASE);
            assert_eq!(env, ENV_WATCH_DATABASE);
        }
        other => panic!("expected MissingArgument, found {other:?}"),
    }
}

#[rstest]
fn watch_defaults_follow_sync_config() {
    let args = WatchArgs {
        database: Some(Utf8PathBuf::from("d.db")),
        ..WatchArgs::default()
    };
    let config = WatchConfig::try_from(args).expect("config should build");
    assert_eq!(config.sync, SyncConfig::default());
}

#[rstest]
fn watch_overrides_apply() {
    let args = WatchArgs {
        database: Some(Utf8PathBuf::from("d.db")),
        directory: Some(Utf8PathBuf::from("/srv/traffic")),
        file_name: Some("latest.json".to_owned()),
        quiet_window_ms: Some(250),
        poll_interval_ms: Some(100),
        batch_size: Some(50),
        retry_backoff_ms: Some(2_000),
        max_attempts: Some(3),
        shutdown_grace_ms: Some(1_000),
    };
    let config = WatchConfig::try_from(args).expect("config should build");
    let expected = SyncConfig::new("/srv/traffic")
        .with_file_name("latest.json")
        .with_quiet_window(Duration::from_millis(250))
        .with_poll_interval(Duration::from_millis(100))
        .with_batch_size(50)
        .with_retry(RetryPolicy {
            backoff: Duration::from_secs(2),
            max_attempts: 3,
        })
        .with_shutdown_grace(Duration::from_secs(1));
    assert_eq!(config.sync, expected);
}

#[rstest]
#[case::zero_batch(Some(0), None, ARG_BATCH_SIZE)]
#[case::zero_poll(None, Some(0), ARG_POLL_INTERVAL_MS)]
fn watch_rejects_zero_values(
    #[case] batch_size: Option<u64>,
    #[case] poll_interval_ms: Option<u64>,
    #[case] expected_field: &'static str,
) {
    let args = WatchArgs {
        database: Some(Utf8PathBuf::from("d.db")),
        batch_size,
        poll_interval_ms,
        ..WatchArgs::default()
    };
    match WatchConfig::try_from(args).expect_err("zero should be rejected") {
        CliError::OutOfRange { field, minimum, .. } => {
            assert_eq!(field, expected_field);
            assert_eq!(minimum, 1);
        }
        other => panic!("expected OutOfRange, found {other:?}"),
    }
}

#[rstest]
fn sync_snapshot_defaults_to_directory_and_file_name() {
    let args = SyncArgs {
        database: Some(Utf8PathBuf::from("d.db")),
        directory: Some(Utf8PathBuf::from("exports")),
        ..SyncArgs::default()
    };
    let config = SyncCommandConfig::try_from(args).expect("config should build");
    assert_eq!(
        config,
        SyncCommandConfig {
            database: Utf8PathBuf::from("d.db"),
            snapshot: Utf8PathBuf::from("exports").join(DEFAULT_FILE_NAME),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    );
}

#[rstest]
fn explicit_snapshot_wins_over_directory() {
    let args = SyncArgs {
        snapshot: Some(Utf8PathBuf::from("other/snap.json")),
        database: Some(Utf8PathBuf::from("d.db")),
        directory: Some(Utf8PathBuf::from("exports")),
        file_name: Some("ignored.json".to_owned()),
        batch_size: Some(5),
    };
    let config = SyncCommandConfig::try_from(args).expect("config should build");
    assert_eq!(config.snapshot, Utf8PathBuf::from("other/snap.json"));
    assert_eq!(config.batch_size, 5);
}

#[rstest]
fn sync_requires_database() {
    match SyncCommandConfig::try_from(SyncArgs::default()).expect_err("missing database") {
        CliError::MissingArgument { env, .. } => assert_eq!(env, ENV_SYNC_DATABASE),
        other => panic!("expected MissingArgument, found {other:?}"),
    }
}
