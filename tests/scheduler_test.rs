// Integration tests for the job scheduler driving real backup jobs

use async_trait::async_trait;
use backup_warden::backup::{ArtifactCatalog, BackupProducer, DumpMethod, DatabaseKind};
use backup_warden::database::{Database, RestoreSummary};
use backup_warden::scheduler::{BackupJob, JobSchedule, ScheduledJob, Scheduler, TriggerOutcome};
use backup_warden::storage::ObjectStoreClient;
use backup_warden::Result;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Dump blocks until released so a run can be held in flight
struct SlowDatabase {
    entered: Notify,
    release: Notify,
    dumps: AtomicUsize,
}

impl SlowDatabase {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Notify::new(),
            dumps: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Database for SlowDatabase {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    async fn dump(&self, dest: &Path) -> Result<DumpMethod> {
        self.dumps.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        tokio::fs::write(dest, b"CREATE TABLE bookings (id integer);\n").await?;
        Ok(DumpMethod::PgDump)
    }

    async fn restore(&self, _source: &Path, _at: DateTime<Utc>) -> Result<RestoreSummary> {
        Ok(RestoreSummary::default())
    }
}

#[tokio::test]
async fn test_overlapping_trigger_is_skipped_not_queued() {
    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(SlowDatabase::new());
    let producer = BackupProducer::new(db.clone(), ObjectStoreClient::not_configured(), dir.path().to_path_buf());

    let mut scheduler = Scheduler::new();
    scheduler
        .register(
            Arc::new(BackupJob::new(producer)),
            JobSchedule::new("0 0 2 * * *", "UTC").unwrap(),
        )
        .unwrap();
    let scheduler = Arc::new(scheduler);

    let first = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run_now(BackupJob::NAME).await }
    });
    db.entered.notified().await;

    let second = scheduler.run_now(BackupJob::NAME).await.unwrap();
    assert_eq!(second, TriggerOutcome::Skipped);

    db.release.notify_one();
    assert_eq!(first.await.unwrap().unwrap(), TriggerOutcome::Completed);

    let stats = scheduler.stats(BackupJob::NAME).unwrap();
    assert_eq!(stats.started, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(db.dumps.load(Ordering::SeqCst), 1);

    let catalog = ArtifactCatalog::new(dir.path(), ObjectStoreClient::not_configured());
    assert_eq!(catalog.list_local().await.unwrap().artifacts.len(), 1);
}

struct TickJob {
    runs: AtomicUsize,
}

#[async_trait]
impl ScheduledJob for TickJob {
    fn name(&self) -> &str {
        "tick"
    }

    async fn run(&self) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_timer_fires_until_stopped() {
    let job = Arc::new(TickJob {
        runs: AtomicUsize::new(0),
    });
    let mut scheduler = Scheduler::new();
    scheduler
        .register(job.clone(), JobSchedule::new("* * * * * *", "Europe/Berlin").unwrap())
        .unwrap();

    scheduler.start();
    assert!(scheduler.is_scheduled("tick"));
    tokio::time::sleep(Duration::from_millis(2500)).await;
    scheduler.stop();
    assert!(!scheduler.is_scheduled("tick"));

    // A run spawned just before stop may still land
    tokio::time::sleep(Duration::from_millis(200)).await;
    let fired = job.runs.load(Ordering::SeqCst);
    assert!(fired >= 1, "expected at least one run, got {}", fired);

    // No further runs after stop
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(job.runs.load(Ordering::SeqCst), fired);
}

/// Takes a while and records whether it got to the end
struct SlowJob {
    started: Notify,
    finished: AtomicUsize,
}

#[async_trait]
impl ScheduledJob for SlowJob {
    fn name(&self) -> &str {
        "slow"
    }

    async fn run(&self) -> Result<()> {
        self.started.notify_one();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_run() {
    let job = Arc::new(SlowJob {
        started: Notify::new(),
        finished: AtomicUsize::new(0),
    });
    let mut scheduler = Scheduler::new();
    scheduler
        .register(job.clone(), JobSchedule::new("* * * * * *", "UTC").unwrap())
        .unwrap();

    scheduler.start();
    job.started.notified().await;
    scheduler.shutdown().await;

    assert!(!scheduler.is_scheduled("slow"));
    assert_eq!(job.finished.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.stats("slow").unwrap().completed, 1);
}

#[test]
fn test_invalid_schedule_is_a_configuration_error() {
    assert!(JobSchedule::new("every day at two", "UTC").is_err());
    assert!(JobSchedule::new("0 0 2 * * *", "Mars/Olympus").is_err());
}
