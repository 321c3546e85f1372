// Artifact listing - local directory and remote prefixes, re-read on every call

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::types::{
    manifest_path, ArtifactLocation, ArtifactManifest, ArtifactName, BackupArtifact, DatabaseKind,
    StorageTier, MANIFEST_SUFFIX,
};
use crate::storage::ObjectStoreClient;
use crate::Result;

/// Prefix of in-progress temporary files inside the backup directory
pub const PARTIAL_PREFIX: &str = ".partial-";

/// A file or object whose name does not follow the artifact convention.
///
/// Never deleted by retention and never picked by `--latest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnclassifiedEntry {
    pub tier: StorageTier,
    pub location: ArtifactLocation,
    pub size_bytes: u64,
}

/// Classified artifacts plus everything that failed to parse
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub artifacts: Vec<BackupArtifact>,
    pub unclassified: Vec<UnclassifiedEntry>,
}

impl Listing {
    /// Append another listing
    pub fn merge(&mut self, other: Listing) {
        self.artifacts.extend(other.artifacts);
        self.unclassified.extend(other.unclassified);
    }
}

/// Lists artifacts in the backup directory and the bucket
#[derive(Debug, Clone)]
pub struct ArtifactCatalog {
    backup_dir: PathBuf,
    store: ObjectStoreClient,
}

impl ArtifactCatalog {
    pub fn new(backup_dir: impl Into<PathBuf>, store: ObjectStoreClient) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            store,
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn store(&self) -> &ObjectStoreClient {
        &self.store
    }

    /// Local directory listing; a missing directory lists as empty
    pub async fn list_local(&self) -> Result<Listing> {
        let mut listing = Listing::default();
        let mut entries = match fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(listing),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.ends_with(MANIFEST_SUFFIX) || file_name.starts_with(PARTIAL_PREFIX) {
                continue;
            }

            let path = entry.path();
            let size_bytes = entry.metadata().await?.len();
            match ArtifactName::parse(&file_name) {
                Some(mut name) => {
                    if let Some(kind) = manifest_kind(&path).await {
                        if kind != name.kind {
                            warn!(artifact = %file_name, manifest_kind = %kind, "Manifest kind overrides extension");
                            name.kind = kind;
                        }
                    }
                    listing.artifacts.push(BackupArtifact::local(&name, path, size_bytes));
                }
                None => listing.unclassified.push(UnclassifiedEntry {
                    tier: StorageTier::Local,
                    location: ArtifactLocation::Local(path),
                    size_bytes,
                }),
            }
        }

        debug!(
            dir = %self.backup_dir.display(),
            artifacts = listing.artifacts.len(),
            unclassified = listing.unclassified.len(),
            "Listed local artifacts"
        );
        Ok(listing)
    }

    /// Remote listing, one bounded page per kind prefix
    pub async fn list_remote(&self) -> Result<Listing> {
        let mut listing = Listing::default();
        for kind in [DatabaseKind::Sqlite, DatabaseKind::Postgres] {
            let objects = self.store.list(&kind.remote_prefix(), self.store.list_max_keys()).await?;
            for object in objects {
                if object.key.ends_with(MANIFEST_SUFFIX) {
                    continue;
                }
                match ArtifactName::parse_remote_key(&object.key) {
                    Some(name) => listing
                        .artifacts
                        .push(BackupArtifact::remote(&name, object.key, object.size_bytes)),
                    None => listing.unclassified.push(UnclassifiedEntry {
                        tier: StorageTier::Remote,
                        location: ArtifactLocation::Remote(object.key),
                        size_bytes: object.size_bytes,
                    }),
                }
            }
        }
        Ok(listing)
    }

    /// Local plus remote (when configured)
    pub async fn list_all(&self) -> Result<Listing> {
        let mut listing = self.list_local().await?;
        if self.store.is_configured() {
            listing.merge(self.list_remote().await?);
        }
        newest_first(&mut listing.artifacts);
        Ok(listing)
    }

    /// Most recent classified artifact across both tiers, safety backups excluded
    pub async fn latest(&self) -> Result<Option<BackupArtifact>> {
        let listing = self.list_all().await?;
        Ok(listing.artifacts.into_iter().find(|a| !a.safety))
    }
}

/// Sort by creation time descending; equal names prefer the local copy
pub fn newest_first(artifacts: &mut [BackupArtifact]) {
    artifacts.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.name.cmp(&a.name))
            .then_with(|| a.tier.cmp(&b.tier))
    });
}

async fn manifest_kind(artifact: &Path) -> Option<DatabaseKind> {
    let raw = fs::read(manifest_path(artifact)).await.ok()?;
    match serde_json::from_slice::<ArtifactManifest>(&raw) {
        Ok(manifest) => Some(manifest.kind),
        Err(e) => {
            warn!(artifact = %artifact.display(), error = %e, "Ignoring unreadable manifest");
            None
        }
    }
}

/// Manifest stored next to a local artifact, if any
pub async fn read_local_manifest(artifact: &Path) -> Result<Option<ArtifactManifest>> {
    match fs::read(manifest_path(artifact)).await {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
