//! Cron-driven job scheduler.
//!
//! Each registered job gets one timer task. Runs are single-flight: a
//! trigger that arrives while the previous run of the same job is still
//! in progress is skipped and logged, never queued.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backup::BackupProducer;
use crate::retention::RetentionSweeper;
use crate::{BackupError, Result};

/// Work the scheduler can trigger
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    /// Unique job name
    fn name(&self) -> &str;

    /// One run; errors are logged by the scheduler
    async fn run(&self) -> Result<()>;
}

/// Six-field cron expression evaluated in an IANA timezone
#[derive(Debug, Clone)]
pub struct JobSchedule {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
}

impl JobSchedule {
    /// Parse `expression` (sec min hour day-of-month month day-of-week)
    pub fn new(expression: &str, timezone: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expression).map_err(|e| {
            BackupError::Configuration(format!("Invalid cron expression '{}': {}", expression, e))
        })?;
        let timezone: Tz = timezone
            .parse()
            .map_err(|e| BackupError::Configuration(format!("Invalid timezone '{}': {}", timezone, e)))?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
            timezone,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.timezone))
            .next()
            .map(|at| at.with_timezone(&Utc))
    }

    /// Next instant after a fire at `fired`; a wall clock still behind `fired` never repeats it
    pub fn following(&self, fired: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_after(fired.max(now))
    }
}

/// Result of one trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Completed,
    Failed(String),
    /// Previous run still in progress
    Skipped,
}

/// Counters for one job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Default)]
struct JobCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl JobCounters {
    fn snapshot(&self) -> JobStats {
        JobStats {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

struct JobEntry {
    job: Arc<dyn ScheduledJob>,
    schedule: JobSchedule,
    running: AtomicBool,
    counters: JobCounters,
    timer: Mutex<Option<JoinHandle<()>>>,
    /// Timer-triggered runs that may still be going
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

/// Clears the in-progress flag even if the run panics
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl JobEntry {
    async fn trigger(&self) -> TriggerOutcome {
        let name = self.job.name();
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            warn!(job = name, "Previous run still in progress, trigger skipped");
            return TriggerOutcome::Skipped;
        }
        let _guard = RunningGuard(&self.running);
        self.counters.started.fetch_add(1, Ordering::Relaxed);

        let run_id = Uuid::new_v4();
        let span = info_span!("job_run", job = name, run_id = %run_id);
        let result = async {
            info!("Job started");
            self.job.run().await
        }
        .instrument(span.clone())
        .await;

        let _entered = span.enter();
        match result {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                info!("Job completed");
                TriggerOutcome::Completed
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %e, "Job failed");
                TriggerOutcome::Failed(e.to_string())
            }
        }
    }

    fn timer_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn in_flight_runs(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owns the registered jobs and their timers
#[derive(Default)]
pub struct Scheduler {
    jobs: HashMap<String, Arc<JobEntry>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job; names must be unique
    pub fn register(&mut self, job: Arc<dyn ScheduledJob>, schedule: JobSchedule) -> Result<()> {
        let name = job.name().to_string();
        if self.jobs.contains_key(&name) {
            return Err(BackupError::Configuration(format!("Job '{}' is already registered", name)));
        }
        info!(job = %name, schedule = schedule.expression(), timezone = %schedule.timezone(), "Job registered");
        self.jobs.insert(
            name,
            Arc::new(JobEntry {
                job,
                schedule,
                running: AtomicBool::new(false),
                counters: JobCounters::default(),
                timer: Mutex::new(None),
                in_flight: Mutex::new(Vec::new()),
            }),
        );
        Ok(())
    }

    /// Registered job names, sorted
    pub fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    fn entry(&self, name: &str) -> Result<&Arc<JobEntry>> {
        self.jobs
            .get(name)
            .ok_or_else(|| BackupError::NotFound(format!("job '{}'", name)))
    }

    /// Start every job's timer
    pub fn start(&self) {
        for entry in self.jobs.values() {
            Self::spawn_timer(entry);
        }
    }

    /// Start one job's timer; a running timer is left alone
    pub fn start_job(&self, name: &str) -> Result<()> {
        Self::spawn_timer(self.entry(name)?);
        Ok(())
    }

    /// Cancel one job's timer; an in-flight run finishes
    pub fn stop_job(&self, name: &str) -> Result<()> {
        let entry = self.entry(name)?;
        if let Some(handle) = entry.timer_slot().take() {
            handle.abort();
            info!(job = name, "Job timer stopped");
        }
        Ok(())
    }

    /// Cancel all timers
    pub fn stop(&self) {
        for name in self.jobs.keys() {
            // Every key is registered
            let _ = self.stop_job(name);
        }
        info!("Scheduler stopped");
    }

    /// Cancel all timers, then wait for runs they already started
    pub async fn shutdown(&self) {
        self.stop();
        for (name, entry) in &self.jobs {
            let runs: Vec<JoinHandle<()>> = entry.in_flight_runs().drain(..).collect();
            if runs.iter().any(|run| !run.is_finished()) {
                info!(job = %name, "Waiting for in-flight run");
            }
            for run in runs {
                if let Err(e) = run.await {
                    error!(job = %name, error = %e, "Run task ended abnormally");
                }
            }
        }
        info!("Scheduler shut down");
    }

    /// Whether the job's timer is active
    pub fn is_scheduled(&self, name: &str) -> bool {
        self.jobs
            .get(name)
            .map(|entry| entry.timer_slot().as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Trigger `name` now through the single-flight gate and wait for it
    pub async fn run_now(&self, name: &str) -> Result<TriggerOutcome> {
        let entry = self.entry(name)?.clone();
        Ok(entry.trigger().await)
    }

    /// Counters for `name`
    pub fn stats(&self, name: &str) -> Option<JobStats> {
        self.jobs.get(name).map(|entry| entry.counters.snapshot())
    }

    fn spawn_timer(entry: &Arc<JobEntry>) {
        let mut slot = entry.timer_slot();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let timer_entry = Arc::clone(entry);
        let handle = tokio::spawn(async move {
            let name = timer_entry.job.name().to_string();
            let mut next = timer_entry.schedule.next_after(Utc::now());
            loop {
                let Some(fire_at) = next else {
                    warn!(job = %name, "Schedule has no upcoming fire time, timer exits");
                    break;
                };
                let wait = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                next = timer_entry.schedule.following(fire_at, Utc::now());

                // Runs outlive the timer so stop() never cancels work mid-flight
                let run_entry = Arc::clone(&timer_entry);
                let run = tokio::spawn(async move {
                    run_entry.trigger().await;
                });
                {
                    let mut runs = timer_entry.in_flight_runs();
                    runs.retain(|handle| !handle.is_finished());
                    runs.push(run);
                }
            }
        });
        *slot = Some(handle);
        info!(job = %entry.job.name(), "Job timer started");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for entry in self.jobs.values() {
            if let Some(handle) = entry.timer_slot().take() {
                handle.abort();
            }
        }
    }
}

/// Scheduled backup
pub struct BackupJob {
    producer: BackupProducer,
}

impl BackupJob {
    pub const NAME: &'static str = "backup";

    pub fn new(producer: BackupProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl ScheduledJob for BackupJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self) -> Result<()> {
        let report = self.producer.produce().await?;
        if let crate::backup::UploadOutcome::Failed(reason) = report.upload {
            return Err(BackupError::Storage(format!(
                "{} kept locally, upload failed: {}",
                report.artifact.name, reason
            )));
        }
        Ok(())
    }
}

/// Scheduled retention sweep
pub struct RetentionJob {
    sweeper: RetentionSweeper,
}

impl RetentionJob {
    pub const NAME: &'static str = "retention";

    pub fn new(sweeper: RetentionSweeper) -> Self {
        Self { sweeper }
    }
}

#[async_trait]
impl ScheduledJob for RetentionJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self) -> Result<()> {
        let report = self.sweeper.sweep(false).await?;
        if !report.is_clean() {
            return Err(BackupError::Storage(format!(
                "{} deletions failed{}",
                report.failed.len(),
                report
                    .remote_error
                    .map(|e| format!(", remote listing failed: {}", e))
                    .unwrap_or_default()
            )));
        }
        Ok(())
    }
}
