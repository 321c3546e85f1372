//! Grandfather-father-son retention.
//!
//! [`apply`] is pure: given a policy, a reference time and a set of
//! artifacts it partitions them into keep and delete. The
//! [`sweep::RetentionSweeper`] feeds it fresh listings and carries out the
//! deletions.

pub mod sweep;

pub use sweep::{RetentionSweeper, SweepReport};

use chrono::{DateTime, Datelike, Duration, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::backup::BackupArtifact;
use crate::{BackupError, Result};

/// Upper bounds accepted from configuration (about a century each)
pub const MAX_DAILY_DAYS: u32 = 36_500;
pub const MAX_WEEKLY_WEEKS: u32 = 5_200;
pub const MAX_MONTHLY_MONTHS: u32 = 1_200;

/// How many daily, weekly and monthly generations to keep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep everything created within this many days
    pub daily_days: u32,
    /// Keep one artifact per 7-day window for this many windows
    pub weekly_weeks: u32,
    /// Keep one artifact per calendar month for this many months
    pub monthly_months: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            daily_days: 7,
            weekly_weeks: 4,
            monthly_months: 12,
        }
    }
}

impl RetentionPolicy {
    /// Reject tier lengths beyond the configured bounds
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("RETENTION_DAILY_DAYS", self.daily_days, MAX_DAILY_DAYS),
            ("RETENTION_WEEKLY_WEEKS", self.weekly_weeks, MAX_WEEKLY_WEEKS),
            ("RETENTION_MONTHLY_MONTHS", self.monthly_months, MAX_MONTHLY_MONTHS),
        ];
        for (name, value, max) in checks {
            if value > max {
                return Err(BackupError::Configuration(format!(
                    "{} must be at most {}, got {}",
                    name, max, value
                )));
            }
        }
        Ok(())
    }
}

/// Why an artifact survived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierReason {
    Daily,
    Weekly,
    Monthly,
    /// Not selected by any tier
    None,
}

/// Per-artifact verdict; computed fresh on every run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionDecision {
    pub artifact: BackupArtifact,
    pub keep: bool,
    pub reason: TierReason,
}

/// Disjoint keep/delete partition, each in input order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionOutcome {
    pub keep: Vec<RetentionDecision>,
    pub delete: Vec<RetentionDecision>,
}

impl RetentionOutcome {
    /// Names of kept artifacts
    pub fn kept_names(&self) -> Vec<&str> {
        self.keep.iter().map(|d| d.artifact.name.as_str()).collect()
    }

    /// Names of artifacts to delete
    pub fn deleted_names(&self) -> Vec<&str> {
        self.delete.iter().map(|d| d.artifact.name.as_str()).collect()
    }
}

/// Partition `artifacts` according to `policy` as of `now`
pub fn apply(policy: &RetentionPolicy, now: DateTime<Utc>, artifacts: &[BackupArtifact]) -> RetentionOutcome {
    let reasons = select(policy, now, artifacts);

    let mut outcome = RetentionOutcome::default();
    for (artifact, reason) in artifacts.iter().zip(reasons) {
        let keep = reason != TierReason::None;
        let decision = RetentionDecision {
            artifact: artifact.clone(),
            keep,
            reason,
        };
        if keep {
            outcome.keep.push(decision);
        } else {
            outcome.delete.push(decision);
        }
    }
    outcome
}

/// Tier reason per artifact index
fn select(policy: &RetentionPolicy, now: DateTime<Utc>, artifacts: &[BackupArtifact]) -> Vec<TierReason> {
    let mut reasons = vec![TierReason::None; artifacts.len()];
    let mut mark = |index: usize, reason: TierReason| {
        if reasons[index] == TierReason::None {
            reasons[index] = reason;
        }
    };

    let Some(oldest) = artifacts.iter().map(|a| a.created_at).min() else {
        return reasons;
    };

    // Out of chrono's range means the window reaches back past every artifact
    let daily_cutoff = days_before(now, i64::from(policy.daily_days));
    for (i, artifact) in artifacts.iter().enumerate() {
        if daily_cutoff.map_or(true, |cutoff| artifact.created_at >= cutoff) {
            mark(i, TierReason::Daily);
        }
    }

    for w in 0..i64::from(policy.weekly_weeks) {
        let Some(end) = days_before(now, 7 * w) else { break };
        if end <= oldest {
            break;
        }
        let start = days_before(now, 7 * (w + 1));
        let in_window: Vec<usize> = (0..artifacts.len())
            .filter(|&i| {
                let created = artifacts[i].created_at;
                start.map_or(true, |start| created >= start) && created < end
            })
            .collect();
        let sundays: Vec<usize> = in_window
            .iter()
            .copied()
            .filter(|&i| artifacts[i].created_at.weekday() == Weekday::Sun)
            .collect();
        let pool = if sundays.is_empty() { in_window } else { sundays };
        if let Some(pick) = pool.into_iter().max_by(|&a, &b| newer(&artifacts[a], &artifacts[b])) {
            mark(pick, TierReason::Weekly);
        }
    }

    let anchor = month_index(&now);
    let earliest_month = month_index(&oldest);
    for m in 0..i64::from(policy.monthly_months) {
        let target = anchor - m;
        if target < earliest_month {
            break;
        }
        let in_month: Vec<usize> = (0..artifacts.len())
            .filter(|&i| month_index(&artifacts[i].created_at) == target)
            .collect();
        let firsts: Vec<usize> = in_month
            .iter()
            .copied()
            .filter(|&i| artifacts[i].created_at.day() == 1)
            .collect();
        let pick = if firsts.is_empty() {
            in_month.into_iter().min_by(|&a, &b| newer(&artifacts[a], &artifacts[b]))
        } else {
            firsts.into_iter().max_by(|&a, &b| newer(&artifacts[a], &artifacts[b]))
        };
        if let Some(pick) = pick {
            mark(pick, TierReason::Monthly);
        }
    }

    reasons
}

/// Creation order with the name as tie-break, independent of input order
fn newer(a: &BackupArtifact, b: &BackupArtifact) -> Ordering {
    a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name))
}

fn days_before(now: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    Duration::try_days(days).and_then(|delta| now.checked_sub_signed(delta))
}

fn month_index(at: &DateTime<Utc>) -> i64 {
    i64::from(at.year()) * 12 + i64::from(at.month0())
}
