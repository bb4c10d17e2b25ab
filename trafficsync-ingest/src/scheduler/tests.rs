//! Unit tests for debouncing, serialisation and retry in the scheduler.

use super::*;
use rstest::{fixture, rstest};
use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::thread;
use trafficsync_core::{JsonSnapshotParser, SnapshotParser, StoreError};

use crate::ingest::IngestStatus;

/// Job that records every run and replays queued failures.
#[derive(Default)]
struct RecordingJob {
    runs: Mutex<Vec<Utf8PathBuf>>,
    failures: Mutex<VecDeque<IngestError>>,
    delay: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: AtomicUsize,
    version: AtomicUsize,
    seen_versions: Mutex<Vec<usize>>,
}

impl RecordingJob {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn failing_with(failures: impl IntoIterator<Item = IngestError>) -> Self {
        Self {
            failures: Mutex::new(failures.into_iter().collect()),
            ..Self::default()
        }
    }

    fn runs(&self) -> Vec<Utf8PathBuf> {
        self.runs.lock().expect("runs lock").clone()
    }

    fn run_count(&self) -> usize {
        self.runs.lock().expect("runs lock").len()
    }
}

impl SyncJob for RecordingJob {
    fn run(&self, path: &Utf8Path) -> Result<IngestOutcome, IngestError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.runs.lock().expect("runs lock").push(path.to_owned());
        self.seen_versions
            .lock()
            .expect("versions lock")
            .push(self.version.load(Ordering::SeqCst));
        self.active.fetch_sub(1, Ordering::SeqCst);
        match self.failures.lock().expect("failures lock").pop_front() {
            Some(err) => Err(err),
            None => Ok(IngestOutcome {
                status: IngestStatus::Replaced,
                records_in_file: 1,
                records_persisted: 1,
                errors: 0,
                store_count: 1,
            }),
        }
    }
}

fn locked() -> IngestError {
    IngestError::Store {
        operation: "replace detections",
        source: StoreError::Unavailable {
            message: "database is locked".to_owned(),
        },
    }
}

fn malformed() -> IngestError {
    IngestError::Decode {
        path: Utf8PathBuf::from("detections.json"),
        source: JsonSnapshotParser
            .decode_snapshot(b"[]")
            .expect_err("array snapshot"),
    }
}

#[fixture]
fn config() -> SchedulerConfig {
    SchedulerConfig {
        quiet_window: Duration::from_millis(100),
        retry: RetryPolicy {
            backoff: Duration::from_millis(50),
            max_attempts: 5,
        },
        shutdown_grace: Duration::from_secs(2),
    }
}

fn scheduler(job: &Arc<RecordingJob>, config: SchedulerConfig) -> DebounceScheduler {
    let job: Arc<dyn SyncJob> = job.clone();
    DebounceScheduler::new(job, config).expect("build scheduler")
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn settle(scheduler: &DebounceScheduler) {
    assert!(
        wait_until(Duration::from_secs(5), || scheduler
            .pending_paths()
            .is_empty()),
        "pending work did not drain"
    );
    // Give any stray duplicate run time to surface.
    thread::sleep(Duration::from_millis(300));
}

#[rstest]
fn burst_of_events_runs_once(config: SchedulerConfig) {
    let job = Arc::new(RecordingJob::default());
    let scheduler = scheduler(&job, config);
    let path = Utf8PathBuf::from("detections/detections.json");

    for _ in 0..10 {
        scheduler.schedule(path.clone()).expect("schedule");
        thread::sleep(Duration::from_millis(10));
    }
    settle(&scheduler);

    assert_eq!(job.runs(), vec![path]);
}

#[rstest]
fn single_run_sees_the_state_after_the_last_event(config: SchedulerConfig) {
    let job = Arc::new(RecordingJob::default());
    let scheduler = scheduler(&job, config);
    let path = Utf8PathBuf::from("detections.json");

    for version in [3, 5, 7] {
        job.version.store(version, Ordering::SeqCst);
        scheduler.schedule(path.clone()).expect("schedule");
        thread::sleep(Duration::from_millis(10));
    }
    settle(&scheduler);

    assert_eq!(*job.seen_versions.lock().expect("versions lock"), vec![7]);
}

#[rstest]
fn create_then_modify_within_200ms_runs_once(mut config: SchedulerConfig) {
    config.quiet_window = Duration::from_millis(300);
    let job = Arc::new(RecordingJob::default());
    let scheduler = scheduler(&job, config);
    let path = Utf8PathBuf::from("detections.json");

    scheduler.schedule(path.clone()).expect("schedule create");
    thread::sleep(Duration::from_millis(150));
    scheduler.schedule(path.clone()).expect("schedule modify");
    settle(&scheduler);

    assert_eq!(job.run_count(), 1);
}

#[rstest]
fn distinct_paths_run_independently(config: SchedulerConfig) {
    let job = Arc::new(RecordingJob::default());
    let scheduler = scheduler(&job, config);

    scheduler.schedule("a.json".into()).expect("schedule a");
    scheduler.schedule("b.json".into()).expect("schedule b");
    assert_eq!(
        scheduler.pending_paths(),
        vec![Utf8PathBuf::from("a.json"), Utf8PathBuf::from("b.json")]
    );
    settle(&scheduler);

    let mut runs = job.runs();
    runs.sort();
    assert_eq!(
        runs,
        vec![Utf8PathBuf::from("a.json"), Utf8PathBuf::from("b.json")]
    );
}

#[rstest]
fn lock_error_is_retried_once_then_succeeds(config: SchedulerConfig) {
    let job = Arc::new(RecordingJob::failing_with([locked()]));
    let scheduler = scheduler(&job, config);

    scheduler.schedule("detections.json".into()).expect("schedule");
    settle(&scheduler);

    assert_eq!(job.run_count(), 2);
}

#[rstest]
fn retries_stop_at_the_policy_limit(mut config: SchedulerConfig) {
    config.retry.max_attempts = 2;
    let job = Arc::new(RecordingJob::failing_with((0..5).map(|_| locked())));
    let scheduler = scheduler(&job, config);

    scheduler.schedule("detections.json".into()).expect("schedule");
    settle(&scheduler);

    assert_eq!(job.run_count(), 3);
}

#[rstest]
fn decode_errors_are_not_retried(config: SchedulerConfig) {
    let job = Arc::new(RecordingJob::failing_with([malformed()]));
    let scheduler = scheduler(&job, config);

    scheduler.schedule("detections.json".into()).expect("schedule");
    settle(&scheduler);

    assert_eq!(job.run_count(), 1);
}

#[rstest]
fn event_during_run_keeps_its_own_entry(mut config: SchedulerConfig) {
    config.quiet_window = Duration::from_millis(50);
    let job = Arc::new(RecordingJob::with_delay(Duration::from_millis(300)));
    let scheduler = scheduler(&job, config);
    let path = Utf8PathBuf::from("detections.json");

    scheduler.schedule(path.clone()).expect("schedule first");
    assert!(wait_until(Duration::from_secs(5), || {
        job.started.load(Ordering::SeqCst) == 1
    }));
    scheduler.schedule(path.clone()).expect("schedule during run");
    assert!(wait_until(Duration::from_secs(5), || job.run_count() == 1));
    assert_eq!(scheduler.pending_paths(), vec![path]);

    settle(&scheduler);
    assert_eq!(job.run_count(), 2);
}

#[rstest]
fn force_now_returns_errors_without_retrying(config: SchedulerConfig) {
    let job = Arc::new(RecordingJob::failing_with([locked()]));
    let scheduler = scheduler(&job, config);

    let err = scheduler
        .force_now(Utf8Path::new("detections.json"))
        .expect_err("locked store");
    assert!(err.is_retryable());
    thread::sleep(Duration::from_millis(300));
    assert_eq!(job.run_count(), 1);

    let outcome = scheduler
        .force_now(Utf8Path::new("detections.json"))
        .expect("second forced run");
    assert_eq!(outcome.status, IngestStatus::Replaced);
}

#[rstest]
fn runs_never_overlap(config: SchedulerConfig) {
    let job = Arc::new(RecordingJob::with_delay(Duration::from_millis(50)));
    let scheduler = scheduler(&job, config);

    for name in ["a.json", "b.json", "c.json"] {
        scheduler.schedule(name.into()).expect("schedule");
    }
    thread::sleep(Duration::from_millis(120));
    scheduler
        .force_now(Utf8Path::new("d.json"))
        .expect("forced run");
    settle(&scheduler);

    assert_eq!(job.run_count(), 4);
    assert_eq!(job.max_active.load(Ordering::SeqCst), 1);
}

#[rstest]
fn run_exclusive_returns_the_task_result(config: SchedulerConfig) {
    let job = Arc::new(RecordingJob::default());
    let scheduler = scheduler(&job, config);
    let value = scheduler.run_exclusive(|| 41 + 1).expect("exclusive task");
    assert_eq!(value, 42);
}

#[rstest]
fn shutdown_rejects_new_work(config: SchedulerConfig) {
    let job = Arc::new(RecordingJob::default());
    let scheduler = scheduler(&job, config);
    scheduler.schedule("detections.json".into()).expect("schedule");

    scheduler.shutdown();

    assert!(!scheduler.is_active());
    assert!(scheduler.pending_paths().is_empty());
    assert!(matches!(
        scheduler.schedule("detections.json".into()),
        Err(SchedulerError::ShutDown)
    ));
    assert!(matches!(
        scheduler.force_now(Utf8Path::new("detections.json")),
        Err(SchedulerError::ShutDown)
    ));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(job.run_count(), 0);
}

#[rstest]
fn force_now_inside_a_current_thread_runtime(config: SchedulerConfig) {
    let job = Arc::new(RecordingJob::default());
    let scheduler = scheduler(&job, config);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime");

    let outcome = runtime
        .block_on(async { scheduler.force_now(Utf8Path::new("detections.json")) })
        .expect("forced run");
    let value = runtime
        .block_on(async { scheduler.run_exclusive(|| 7) })
        .expect("exclusive task");

    assert_eq!(outcome.status, IngestStatus::Replaced);
    assert_eq!(value, 7);
    assert_eq!(job.run_count(), 1);
}

#[rstest]
fn force_now_inside_a_multi_thread_runtime(config: SchedulerConfig) {
    let job = Arc::new(RecordingJob::default());
    let scheduler = Arc::new(scheduler(&job, config));
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("build runtime");

    let worker = Arc::clone(&scheduler);
    let outcome = runtime
        .block_on(async move {
            tokio::spawn(async move { worker.force_now(Utf8Path::new("detections.json")) })
                .await
        })
        .expect("join task")
        .expect("forced run");

    assert_eq!(outcome.status, IngestStatus::Replaced);
}

#[rstest]
#[case::current_thread(false)]
#[case::multi_thread(true)]
fn dropping_inside_a_runtime_waits_for_the_running_job(
    config: SchedulerConfig,
    #[case] multi_thread: bool,
) {
    let job = Arc::new(RecordingJob::with_delay(Duration::from_millis(200)));
    let scheduler = scheduler(&job, config);
    scheduler.schedule("detections.json".into()).expect("schedule");
    assert!(wait_until(Duration::from_secs(5), || {
        job.started.load(Ordering::SeqCst) == 1
    }));

    let runtime = if multi_thread {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
    }
    .expect("build runtime");
    runtime.block_on(async move { drop(scheduler) });

    assert_eq!(job.run_count(), 1);
}
