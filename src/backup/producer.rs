// Backup production - dump, verify, compress, atomically publish, upload

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{error, info, instrument, warn};

use super::catalog::PARTIAL_PREFIX;
use super::compression::{compress_file, sha256_file};
use super::types::{
    manifest_path, ArtifactManifest, ArtifactName, BackupArtifact, DatabaseKind, SAFETY_PREFIX,
};
use super::verify::IntegrityVerifier;
use crate::database::Database;
use crate::storage::{ObjectStoreClient, GZIP_CONTENT_TYPE, JSON_CONTENT_TYPE};
use crate::{BackupError, Result};

/// What happened to the remote copy of a new artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum UploadOutcome {
    /// Stored under this key
    Uploaded(String),
    /// Not attempted
    Skipped(String),
    /// Attempted and failed; the local artifact is kept
    Failed(String),
}

impl UploadOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, UploadOutcome::Failed(_))
    }
}

/// Result of a successful [`BackupProducer::produce`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupReport {
    pub artifact: BackupArtifact,
    pub manifest: ArtifactManifest,
    pub upload: UploadOutcome,
}

/// Dry-run description of the next backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPlan {
    pub name: String,
    pub kind: DatabaseKind,
    pub directory: PathBuf,
    /// Key the artifact would be uploaded to, `None` in local-only mode
    pub remote_key: Option<String>,
}

/// Turns the live database into a compressed, verified artifact.
///
/// Nothing carries the final name until the artifact is complete: the dump
/// and the compressed output live in hidden temp files in the backup
/// directory and the compressed file is renamed into place last.
#[derive(Clone)]
pub struct BackupProducer {
    db: Arc<dyn Database>,
    store: ObjectStoreClient,
    backup_dir: PathBuf,
    upload_enabled: bool,
    verifier: IntegrityVerifier,
}

impl BackupProducer {
    pub fn new(db: Arc<dyn Database>, store: ObjectStoreClient, backup_dir: PathBuf) -> Self {
        Self {
            db,
            store,
            backup_dir,
            upload_enabled: true,
            verifier: IntegrityVerifier::new(),
        }
    }

    /// Enable or disable uploads of new artifacts
    pub fn with_upload(mut self, enabled: bool) -> Self {
        self.upload_enabled = enabled;
        self
    }

    pub fn kind(&self) -> DatabaseKind {
        self.db.kind()
    }

    fn uploads(&self) -> bool {
        self.upload_enabled && self.store.is_configured()
    }

    /// Describe the backup `produce` would create now, touching nothing
    pub fn plan(&self) -> BackupPlan {
        let name = ArtifactName::new(self.kind(), Utc::now());
        BackupPlan {
            name: name.file_name(),
            kind: name.kind,
            directory: self.backup_dir.clone(),
            remote_key: self.uploads().then(|| name.remote_key()),
        }
    }

    /// Regular backup, uploaded when configured
    #[instrument(skip(self), fields(kind = %self.kind()))]
    pub async fn produce(&self) -> Result<BackupReport> {
        let name = ArtifactName::new(self.kind(), Utc::now());
        self.produce_named(name, self.uploads()).await
    }

    /// Local-only safety backup taken right before a restore
    #[instrument(skip(self), fields(kind = %self.kind()))]
    pub async fn produce_safety(&self) -> Result<BackupReport> {
        let name = ArtifactName::with_prefix(SAFETY_PREFIX, self.kind(), Utc::now());
        self.produce_named(name, false).await
    }

    async fn produce_named(&self, name: ArtifactName, upload: bool) -> Result<BackupReport> {
        let file_name = name.file_name();
        tokio::fs::create_dir_all(&self.backup_dir).await?;

        let raw = self.temp_file(name.kind.extension())?;
        let dump_method = match self.db.dump(raw.path()).await {
            Ok(method) => method,
            Err(e) => {
                error!(artifact = %file_name, error = %e, "Dump failed");
                return Err(e);
            }
        };

        if !self.verifier.verify(raw.path(), name.kind).await? {
            error!(artifact = %file_name, method = %dump_method, "Dump failed integrity verification");
            return Err(BackupError::CorruptArtifact(format!(
                "{} dump of {} failed verification",
                dump_method, file_name
            )));
        }

        let compressed = self.temp_file("gz")?;
        let size_bytes = compress_file(raw.path(), compressed.path()).await?;
        drop(raw);

        let final_path = self.backup_dir.join(&file_name);
        compressed
            .persist_noclobber(&final_path)
            .map_err(|e| BackupError::Io(e.error))?;

        let manifest = ArtifactManifest {
            name: file_name.clone(),
            kind: name.kind,
            created_at: name.created_at,
            size_bytes,
            sha256: sha256_file(&final_path).await?,
            dump_method,
            safety: name.is_safety(),
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        self.write_manifest(&final_path, &manifest_json)?;

        let artifact = BackupArtifact::local(&name, final_path.clone(), size_bytes);
        info!(artifact = %file_name, size_bytes, method = %dump_method, "Backup created");

        let upload = if upload {
            self.upload(&name, &final_path, manifest_json).await
        } else if !self.store.is_configured() {
            UploadOutcome::Skipped("object storage not configured".to_string())
        } else {
            UploadOutcome::Skipped("upload disabled".to_string())
        };

        Ok(BackupReport {
            artifact,
            manifest,
            upload,
        })
    }

    async fn upload(&self, name: &ArtifactName, path: &Path, manifest_json: Vec<u8>) -> UploadOutcome {
        let key = name.remote_key();
        let result: Result<()> = async {
            let body = tokio::fs::read(path).await?;
            self.store.upload(&key, body, GZIP_CONTENT_TYPE).await?;
            self.store
                .upload(&format!("{}{}", key, super::MANIFEST_SUFFIX), manifest_json, JSON_CONTENT_TYPE)
                .await
        }
        .await;

        match result {
            Ok(()) => {
                info!(key = %key, "Backup uploaded");
                UploadOutcome::Uploaded(key)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Upload failed, local artifact kept");
                UploadOutcome::Failed(e.to_string())
            }
        }
    }

    fn temp_file(&self, extension: &str) -> Result<NamedTempFile> {
        let file = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .suffix(&format!(".{}", extension))
            .tempfile_in(&self.backup_dir)?;
        Ok(file)
    }

    fn write_manifest(&self, artifact: &Path, json: &[u8]) -> Result<()> {
        let mut tmp = self.temp_file("json")?;
        tmp.write_all(json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(manifest_path(artifact)).map_err(|e| BackupError::Io(e.error))?;
        Ok(())
    }
}
