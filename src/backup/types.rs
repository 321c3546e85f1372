// Backup artifact model - names, kinds, locations and manifests

use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::BackupError;

/// Key prefix under which all remote artifacts live
pub const REMOTE_ROOT: &str = "backups";

/// Suffix of the JSON sidecar written next to every artifact
pub const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Prefix used for safety backups taken right before a restore
pub const SAFETY_PREFIX: &str = "safety";

const NAME_MARKER: &str = "-backup-";
const COMPRESSED_SUFFIX: &str = ".gz";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// The two database flavours the system knows how to back up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    /// Embedded single-file database
    Sqlite,
    /// Relational server restored statement by statement
    Postgres,
}

impl DatabaseKind {
    /// Stable lowercase label, also used as the default name prefix
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Sqlite => "sqlite",
            DatabaseKind::Postgres => "postgres",
        }
    }

    /// Extension of the uncompressed dump
    pub fn extension(&self) -> &'static str {
        match self {
            DatabaseKind::Sqlite => "db",
            DatabaseKind::Postgres => "sql",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "db" => Some(DatabaseKind::Sqlite),
            "sql" => Some(DatabaseKind::Postgres),
            _ => None,
        }
    }

    /// Remote prefix holding artifacts of this kind
    pub fn remote_prefix(&self) -> String {
        format!("{}/{}/", REMOTE_ROOT, self.as_str())
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseKind {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(DatabaseKind::Sqlite),
            "postgres" | "postgresql" | "pg" => Ok(DatabaseKind::Postgres),
            other => Err(BackupError::Configuration(format!(
                "Unknown database kind '{}', expected 'sqlite' or 'postgres'",
                other
            ))),
        }
    }
}

/// Where an artifact is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageTier {
    /// Local backup directory
    Local,
    /// Object storage bucket
    Remote,
}

impl fmt::Display for StorageTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageTier::Local => f.write_str("local"),
            StorageTier::Remote => f.write_str("remote"),
        }
    }
}

/// Path or object key of an artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "tier", content = "at", rename_all = "lowercase")]
pub enum ArtifactLocation {
    /// File in the local backup directory
    Local(PathBuf),
    /// Object key in the bucket
    Remote(String),
}

impl fmt::Display for ArtifactLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactLocation::Local(path) => write!(f, "{}", path.display()),
            ArtifactLocation::Remote(key) => f.write_str(key),
        }
    }
}

/// Structured form of `{prefix}-backup-{YYYY-MM-DD_HH-MM-SS}.{ext}.gz`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactName {
    /// Free-form prefix (kind label or `safety`)
    pub prefix: String,
    /// Kind carried by the extension
    pub kind: DatabaseKind,
    /// Creation time, second precision, UTC
    pub created_at: DateTime<Utc>,
}

impl ArtifactName {
    /// Name for a regular backup of `kind` created at `created_at`
    pub fn new(kind: DatabaseKind, created_at: DateTime<Utc>) -> Self {
        Self::with_prefix(kind.as_str(), kind, created_at)
    }

    /// Name with an explicit prefix
    pub fn with_prefix(prefix: impl Into<String>, kind: DatabaseKind, created_at: DateTime<Utc>) -> Self {
        Self {
            prefix: prefix.into(),
            kind,
            created_at: created_at.trunc_subsecs(0),
        }
    }

    /// Parse a bare file name; `None` means the file is unclassified
    pub fn parse(file_name: &str) -> Option<Self> {
        let rest = file_name.strip_suffix(COMPRESSED_SUFFIX)?;
        let (stem, ext) = rest.rsplit_once('.')?;
        let kind = DatabaseKind::from_extension(ext)?;
        let (prefix, stamp) = stem.rsplit_once(NAME_MARKER)?;
        if prefix.is_empty() {
            return None;
        }
        let created_at = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
            .ok()?
            .and_utc();

        Some(Self {
            prefix: prefix.to_string(),
            kind,
            created_at,
        })
    }

    /// Parse `backups/{kind}/{file}`; the key segment must agree with the extension
    pub fn parse_remote_key(key: &str) -> Option<Self> {
        let mut segments = key.split('/');
        if segments.next()? != REMOTE_ROOT {
            return None;
        }
        let kind: DatabaseKind = segments.next()?.parse().ok()?;
        let file_name = segments.next()?;
        if segments.next().is_some() {
            return None;
        }
        Self::parse(file_name).filter(|name| name.kind == kind)
    }

    /// Rendered file name
    pub fn file_name(&self) -> String {
        format!(
            "{}{}{}.{}{}",
            self.prefix,
            NAME_MARKER,
            self.created_at.format(TIMESTAMP_FORMAT),
            self.kind.extension(),
            COMPRESSED_SUFFIX
        )
    }

    /// Object key `backups/{kind}/{file}`
    pub fn remote_key(&self) -> String {
        format!("{}{}", self.kind.remote_prefix(), self.file_name())
    }

    /// Whether this is a pre-restore safety backup
    pub fn is_safety(&self) -> bool {
        self.prefix == SAFETY_PREFIX
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Format used for human-facing timestamps in file names (`pre-restore` copies)
pub fn format_stamp(at: &DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// A single immutable backup file plus its derived metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupArtifact {
    /// File name (identity)
    pub name: String,
    /// Creation time parsed from the name
    pub created_at: DateTime<Utc>,
    /// Size of the compressed artifact
    pub size_bytes: u64,
    /// Local directory or bucket
    pub tier: StorageTier,
    /// Database kind the artifact restores into
    pub kind: DatabaseKind,
    /// Path or key
    pub location: ArtifactLocation,
    /// Taken automatically before a restore
    pub safety: bool,
}

impl BackupArtifact {
    /// Local artifact at `path`
    pub fn local(name: &ArtifactName, path: PathBuf, size_bytes: u64) -> Self {
        Self {
            name: name.file_name(),
            created_at: name.created_at,
            size_bytes,
            tier: StorageTier::Local,
            kind: name.kind,
            location: ArtifactLocation::Local(path),
            safety: name.is_safety(),
        }
    }

    /// Remote artifact at `key`
    pub fn remote(name: &ArtifactName, key: String, size_bytes: u64) -> Self {
        Self {
            name: name.file_name(),
            created_at: name.created_at,
            size_bytes,
            tier: StorageTier::Remote,
            kind: name.kind,
            location: ArtifactLocation::Remote(key),
            safety: name.is_safety(),
        }
    }

    /// Manifest location matching this artifact
    pub fn manifest_location(&self) -> ArtifactLocation {
        match &self.location {
            ArtifactLocation::Local(path) => ArtifactLocation::Local(manifest_path(path)),
            ArtifactLocation::Remote(key) => ArtifactLocation::Remote(format!("{}{}", key, MANIFEST_SUFFIX)),
        }
    }
}

/// How the uncompressed dump was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DumpMethod {
    /// External `pg_dump` tool
    PgDump,
    /// Per-table SELECT rendered as INSERT statements
    InsertFallback,
    /// SQLite `VACUUM INTO`
    VacuumInto,
    /// Raw copy of the SQLite file
    FileCopy,
}

impl fmt::Display for DumpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DumpMethod::PgDump => "pg_dump",
            DumpMethod::InsertFallback => "insert_fallback",
            DumpMethod::VacuumInto => "vacuum_into",
            DumpMethod::FileCopy => "file_copy",
        };
        f.write_str(label)
    }
}

/// JSON sidecar stored next to each artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub name: String,
    pub kind: DatabaseKind,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Hex SHA-256 of the compressed bytes
    pub sha256: String,
    pub dump_method: DumpMethod,
    #[serde(default)]
    pub safety: bool,
}

/// `{artifact}.manifest.json` next to `artifact`
pub fn manifest_path(artifact: &Path) -> PathBuf {
    let mut raw = artifact.as_os_str().to_os_string();
    raw.push(MANIFEST_SUFFIX);
    PathBuf::from(raw)
}
