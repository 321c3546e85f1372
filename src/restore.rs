//! Restore orchestration.
//!
//! Resolve the artifact, refuse a kind mismatch before any file is touched,
//! take a safety backup, then decompress, verify and apply. Temporary files
//! live in a hidden staging directory removed on every exit path.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::backup::catalog::{read_local_manifest, PARTIAL_PREFIX};
use crate::backup::compression::{decompress_file, sha256_file};
use crate::backup::{
    ArtifactCatalog, ArtifactLocation, ArtifactManifest, ArtifactName, BackupArtifact, BackupProducer,
    IntegrityVerifier, MANIFEST_SUFFIX,
};
use crate::database::Database;
pub use crate::database::RestoreSummary;
use crate::{BackupError, Result};

/// Which artifact to restore
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    /// Local artifact file
    Path(PathBuf),
    /// Newest artifact across local and remote listings
    Latest,
    /// Object key `backups/{kind}/{file}`
    Remote(String),
}

/// Restore switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Do not take a safety backup of the live database first
    pub skip_safety: bool,
}

/// What a restore did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreReport {
    pub artifact: BackupArtifact,
    pub safety_backup: Option<BackupArtifact>,
    pub summary: RestoreSummary,
}

/// Runs at most one restore at a time
pub struct RestoreOrchestrator {
    db: Arc<dyn Database>,
    producer: BackupProducer,
    catalog: ArtifactCatalog,
    verifier: IntegrityVerifier,
    in_progress: Mutex<()>,
}

impl RestoreOrchestrator {
    pub fn new(db: Arc<dyn Database>, producer: BackupProducer, catalog: ArtifactCatalog) -> Self {
        Self {
            db,
            producer,
            catalog,
            verifier: IntegrityVerifier::new(),
            in_progress: Mutex::new(()),
        }
    }

    /// Restore `source` into the configured database.
    ///
    /// Fails with [`BackupError::Busy`] if another restore is running.
    #[instrument(skip(self), fields(kind = %self.db.kind()))]
    pub async fn restore(&self, source: RestoreSource, options: RestoreOptions) -> Result<RestoreReport> {
        let _guard = self
            .in_progress
            .try_lock()
            .map_err(|_| BackupError::Busy("a restore is already running".to_string()))?;

        let (artifact, local_manifest) = self.resolve(&source).await?;
        self.check_kind(&artifact)?;
        info!(artifact = %artifact.name, location = %artifact.location, "Restoring");

        match self.apply(&artifact, local_manifest, options).await {
            Ok(report) => Ok(report),
            Err(e) => {
                error!(artifact = %artifact.name, error = %e, "Restore failed");
                Err(e)
            }
        }
    }

    /// Find the artifact without touching any file
    async fn resolve(&self, source: &RestoreSource) -> Result<(BackupArtifact, Option<ArtifactManifest>)> {
        match source {
            RestoreSource::Path(path) => {
                let file_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let mut name = ArtifactName::parse(&file_name).ok_or_else(|| {
                    BackupError::Configuration(format!("'{}' is not a backup artifact name", path.display()))
                })?;
                let metadata = tokio::fs::metadata(path).await.map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => BackupError::NotFound(format!("{}", path.display())),
                    _ => e.into(),
                })?;
                let manifest = read_local_manifest(path).await?;
                if let Some(manifest) = &manifest {
                    name.kind = manifest.kind;
                }
                Ok((BackupArtifact::local(&name, path.clone(), metadata.len()), manifest))
            }
            RestoreSource::Latest => {
                let artifact = self
                    .catalog
                    .latest()
                    .await?
                    .ok_or_else(|| BackupError::NotFound("no backup artifacts found".to_string()))?;
                let manifest = match &artifact.location {
                    ArtifactLocation::Local(path) => read_local_manifest(path).await?,
                    ArtifactLocation::Remote(_) => None,
                };
                Ok((artifact, manifest))
            }
            RestoreSource::Remote(key) => {
                let name = ArtifactName::parse_remote_key(key).ok_or_else(|| {
                    BackupError::Configuration(format!("'{}' is not a backup object key", key))
                })?;
                Ok((BackupArtifact::remote(&name, key.clone(), 0), None))
            }
        }
    }

    fn check_kind(&self, artifact: &BackupArtifact) -> Result<()> {
        let configured = self.db.kind();
        if artifact.kind != configured {
            error!(artifact = %artifact.name, artifact_kind = %artifact.kind, configured_kind = %configured, "Kind mismatch");
            return Err(BackupError::Configuration(format!(
                "artifact {} is a {} backup but this environment is configured for {}",
                artifact.name, artifact.kind, configured
            )));
        }
        Ok(())
    }

    async fn apply(
        &self,
        artifact: &BackupArtifact,
        local_manifest: Option<ArtifactManifest>,
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        let staging_root = self.catalog.backup_dir();
        tokio::fs::create_dir_all(staging_root).await?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{}restore-", PARTIAL_PREFIX))
            .tempdir_in(staging_root)?;

        let (compressed, manifest) = match &artifact.location {
            ArtifactLocation::Local(path) => (path.clone(), local_manifest),
            ArtifactLocation::Remote(key) => self.download(key, staging.path()).await?,
        };

        let safety_backup = if options.skip_safety {
            warn!("Safety backup skipped on request");
            None
        } else {
            let report = self.producer.produce_safety().await?;
            info!(safety = %report.artifact.name, "Safety backup taken");
            Some(report.artifact)
        };

        if let Some(manifest) = &manifest {
            let actual = sha256_file(&compressed).await?;
            if actual != manifest.sha256 {
                return Err(BackupError::CorruptArtifact(format!(
                    "checksum mismatch for {}: manifest {}, file {}",
                    artifact.name, manifest.sha256, actual
                )));
            }
        }

        let raw = staging.path().join(format!("restore.{}", artifact.kind.extension()));
        decompress_file(&compressed, &raw)
            .await
            .map_err(|e| BackupError::CorruptArtifact(format!("cannot decompress {}: {}", artifact.name, e)))?;
        if !self.verifier.verify(&raw, artifact.kind).await? {
            return Err(BackupError::CorruptArtifact(format!(
                "{} failed integrity verification",
                artifact.name
            )));
        }

        let summary = self.db.restore(&raw, Utc::now()).await?;
        info!(
            artifact = %artifact.name,
            applied = summary.statements_applied,
            failed = summary.statements_failed,
            "Restore finished"
        );

        Ok(RestoreReport {
            artifact: artifact.clone(),
            safety_backup,
            summary,
        })
    }

    async fn download(&self, key: &str, staging: &Path) -> Result<(PathBuf, Option<ArtifactManifest>)> {
        let store = self.catalog.store();
        let body = store.download(key).await?;
        let path = staging.join("artifact.gz");
        tokio::fs::write(&path, body).await?;

        let manifest = match store.download(&format!("{}{}", key, MANIFEST_SUFFIX)).await {
            Ok(raw) => Some(serde_json::from_slice(&raw)?),
            Err(BackupError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        Ok((path, manifest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::compression::compress_bytes;
    use crate::backup::{DatabaseKind, DumpMethod};
    use crate::storage::ObjectStoreClient;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records restores; restores block until released when `hold` is set
    struct RecordingDatabase {
        kind: DatabaseKind,
        restores: AtomicUsize,
        hold: Option<Arc<tokio::sync::Notify>>,
    }

    #[async_trait]
    impl Database for RecordingDatabase {
        fn kind(&self) -> DatabaseKind {
            self.kind
        }

        async fn dump(&self, dest: &Path) -> Result<DumpMethod> {
            tokio::fs::write(dest, b"INSERT INTO guests VALUES (1);").await?;
            Ok(DumpMethod::PgDump)
        }

        async fn restore(&self, _source: &Path, _at: DateTime<Utc>) -> Result<RestoreSummary> {
            if let Some(hold) = &self.hold {
                hold.notified().await;
            }
            self.restores.fetch_add(1, Ordering::SeqCst);
            Ok(RestoreSummary {
                statements_applied: 1,
                ..RestoreSummary::default()
            })
        }
    }

    fn orchestrator(dir: &Path, db: Arc<RecordingDatabase>) -> RestoreOrchestrator {
        let store = ObjectStoreClient::not_configured();
        let producer = BackupProducer::new(db.clone(), store.clone(), dir.to_path_buf());
        RestoreOrchestrator::new(db, producer, ArtifactCatalog::new(dir, store))
    }

    fn recording(kind: DatabaseKind) -> Arc<RecordingDatabase> {
        Arc::new(RecordingDatabase {
            kind,
            restores: AtomicUsize::new(0),
            hold: None,
        })
    }

    async fn write_sql_artifact(dir: &Path, body: &[u8]) -> PathBuf {
        let name = ArtifactName::new(DatabaseKind::Postgres, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let path = dir.join(name.file_name());
        tokio::fs::write(&path, compress_bytes(body).unwrap()).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_restore_takes_safety_backup_first() {
        let dir = tempfile::tempdir().unwrap();
        let db = recording(DatabaseKind::Postgres);
        let path = write_sql_artifact(dir.path(), b"CREATE TABLE guests (id int);").await;

        let report = orchestrator(dir.path(), db.clone())
            .restore(RestoreSource::Path(path), RestoreOptions::default())
            .await
            .unwrap();

        assert_eq!(report.summary.statements_applied, 1);
        let safety = report.safety_backup.unwrap();
        assert!(safety.safety);
        assert!(matches!(safety.location, ArtifactLocation::Local(ref p) if p.exists()));
        assert_eq!(db.restores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_refused_before_any_side_effect() {
        let dir = tempfile::tempdir().unwrap();
        let db = recording(DatabaseKind::Sqlite);
        let path = write_sql_artifact(dir.path(), b"CREATE TABLE guests (id int);").await;

        let result = orchestrator(dir.path(), db.clone())
            .restore(RestoreSource::Path(path), RestoreOptions::default())
            .await;

        assert!(matches!(result, Err(BackupError::Configuration(_))));
        assert_eq!(db.restores.load(Ordering::SeqCst), 0);
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let db = recording(DatabaseKind::Postgres);
        let path = write_sql_artifact(dir.path(), b"CREATE TABLE guests (id int);").await;
        let manifest = ArtifactManifest {
            name: path.file_name().unwrap().to_string_lossy().into_owned(),
            kind: DatabaseKind::Postgres,
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
            size_bytes: 0,
            sha256: "00".repeat(32),
            dump_method: DumpMethod::PgDump,
            safety: false,
        };
        tokio::fs::write(crate::backup::manifest_path(&path), serde_json::to_vec(&manifest).unwrap())
            .await
            .unwrap();

        let result = orchestrator(dir.path(), db.clone())
            .restore(RestoreSource::Path(path), RestoreOptions { skip_safety: true })
            .await;

        assert!(matches!(result, Err(BackupError::CorruptArtifact(msg)) if msg.contains("checksum")));
        assert_eq!(db.restores.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unverifiable_content_is_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        let db = recording(DatabaseKind::Postgres);
        let path = write_sql_artifact(dir.path(), b"just some notes").await;

        let result = orchestrator(dir.path(), db.clone())
            .restore(RestoreSource::Path(path), RestoreOptions { skip_safety: true })
            .await;

        assert!(matches!(result, Err(BackupError::CorruptArtifact(_))));
        assert_eq!(db.restores.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_latest_with_no_artifacts_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = orchestrator(dir.path(), recording(DatabaseKind::Postgres))
            .restore(RestoreSource::Latest, RestoreOptions::default())
            .await;
        assert!(matches!(result, Err(BackupError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_remote_source_without_store_is_not_configured() {
        let dir = tempfile::tempdir().unwrap();
        let result = orchestrator(dir.path(), recording(DatabaseKind::Postgres))
            .restore(
                RestoreSource::Remote("backups/postgres/postgres-backup-2025-01-01_00-00-00.sql.gz".into()),
                RestoreOptions { skip_safety: true },
            )
            .await;
        assert!(matches!(result, Err(BackupError::NotConfigured)));
    }

    #[tokio::test]
    async fn test_concurrent_restore_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let hold = Arc::new(tokio::sync::Notify::new());
        let db = Arc::new(RecordingDatabase {
            kind: DatabaseKind::Postgres,
            restores: AtomicUsize::new(0),
            hold: Some(hold.clone()),
        });
        let path = write_sql_artifact(dir.path(), b"CREATE TABLE guests (id int);").await;
        let orchestrator = Arc::new(orchestrator(dir.path(), db.clone()));

        let first = {
            let orchestrator = orchestrator.clone();
            let path = path.clone();
            tokio::spawn(async move {
                orchestrator
                    .restore(RestoreSource::Path(path), RestoreOptions { skip_safety: true })
                    .await
            })
        };

        // Wait until the first restore holds the lock
        while orchestrator.in_progress.try_lock().is_ok() {
            tokio::task::yield_now().await;
        }

        let second = orchestrator
            .restore(RestoreSource::Path(path), RestoreOptions { skip_safety: true })
            .await;
        assert!(matches!(second, Err(BackupError::Busy(_))));

        hold.notify_one();
        assert!(first.await.unwrap().is_ok());
        assert_eq!(db.restores.load(Ordering::SeqCst), 1);
    }
}
