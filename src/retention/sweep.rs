// Retention sweep - list, partition per (tier, kind), delete

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, instrument, warn};

use super::{apply, RetentionPolicy};
use crate::backup::{
    manifest_path, ArtifactCatalog, ArtifactLocation, BackupArtifact, DatabaseKind, Listing, StorageTier,
    MANIFEST_SUFFIX,
};
use crate::Result;

/// What one sweep did (or would do, for a dry run)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub dry_run: bool,
    /// Artifacts kept across all groups
    pub kept: usize,
    /// Deleted, or selected for deletion on a dry run
    pub deleted: Vec<ArtifactLocation>,
    /// Deletions that failed; the sweep carried on
    pub failed: Vec<ArtifactLocation>,
    /// Entries left alone because their names do not parse
    pub unclassified: usize,
    /// Remote tier not swept because object storage is not configured
    pub remote_skipped: bool,
    /// Remote listing failure, if any
    pub remote_error: Option<String>,
}

impl SweepReport {
    /// No deletion or listing failed
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.remote_error.is_none()
    }
}

/// Applies the retention policy to fresh listings of both tiers
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    catalog: ArtifactCatalog,
    policy: RetentionPolicy,
}

impl RetentionSweeper {
    pub fn new(catalog: ArtifactCatalog, policy: RetentionPolicy) -> Self {
        Self { catalog, policy }
    }

    /// Sweep as of now
    pub async fn sweep(&self, dry_run: bool) -> Result<SweepReport> {
        self.sweep_at(Utc::now(), dry_run).await
    }

    /// Sweep as of `now`
    #[instrument(skip(self), fields(policy = ?self.policy))]
    pub async fn sweep_at(&self, now: DateTime<Utc>, dry_run: bool) -> Result<SweepReport> {
        let mut report = SweepReport {
            dry_run,
            ..SweepReport::default()
        };

        let local = self.catalog.list_local().await?;
        self.sweep_listing(local, now, &mut report).await;

        if self.catalog.store().is_configured() {
            match self.catalog.list_remote().await {
                Ok(remote) => self.sweep_listing(remote, now, &mut report).await,
                Err(e) => {
                    warn!(error = %e, "Remote listing failed, remote tier not swept");
                    report.remote_error = Some(e.to_string());
                }
            }
        } else {
            info!("Object storage not configured, skipping remote sweep");
            report.remote_skipped = true;
        }

        info!(
            dry_run,
            kept = report.kept,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            unclassified = report.unclassified,
            "Retention sweep finished"
        );
        Ok(report)
    }

    async fn sweep_listing(&self, listing: Listing, now: DateTime<Utc>, report: &mut SweepReport) {
        report.unclassified += listing.unclassified.len();

        // Safety backups get their own slots so they never displace a regular pick
        let mut groups: BTreeMap<(StorageTier, DatabaseKind, bool), Vec<BackupArtifact>> = BTreeMap::new();
        for artifact in listing.artifacts {
            groups
                .entry((artifact.tier, artifact.kind, artifact.safety))
                .or_default()
                .push(artifact);
        }

        for ((tier, kind, safety), artifacts) in groups {
            let outcome = apply(&self.policy, now, &artifacts);
            info!(
                tier = %tier,
                kind = %kind,
                safety,
                keep = outcome.keep.len(),
                delete = outcome.delete.len(),
                "Retention partition computed"
            );
            report.kept += outcome.keep.len();

            for decision in outcome.delete {
                let location = decision.artifact.location.clone();
                if report.dry_run {
                    info!(artifact = %decision.artifact.name, "Would delete");
                    report.deleted.push(location);
                    continue;
                }
                match self.delete(&decision.artifact).await {
                    Ok(()) => {
                        info!(artifact = %decision.artifact.name, location = %location, "Deleted");
                        report.deleted.push(location);
                    }
                    Err(e) => {
                        warn!(artifact = %decision.artifact.name, error = %e, "Deletion failed");
                        report.failed.push(location);
                    }
                }
            }
        }
    }

    /// Remove an artifact and its manifest sidecar
    async fn delete(&self, artifact: &BackupArtifact) -> Result<()> {
        match &artifact.location {
            ArtifactLocation::Local(path) => {
                tokio::fs::remove_file(path).await?;
                match tokio::fs::remove_file(manifest_path(path)).await {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                    _ => Ok(()),
                }
            }
            ArtifactLocation::Remote(key) => {
                let store = self.catalog.store();
                store.delete(key).await?;
                store.delete(&format!("{}{}", key, MANIFEST_SUFFIX)).await
            }
        }
    }
}
