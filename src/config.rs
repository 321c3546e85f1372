// Environment-driven settings, loaded once at startup

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::backup::DatabaseKind;
use crate::retention::RetentionPolicy;
use crate::{BackupError, Result};

/// Everything the CLI and scheduler need
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Database to back up and restore into
    pub database: DatabaseSettings,
    /// Local backup directory
    pub backup_dir: PathBuf,
    /// Upload new artifacts when object storage is configured
    pub upload_enabled: bool,
    /// Remote storage
    pub object_store: ObjectStoreSettings,
    /// GFS retention policy
    pub retention: RetentionPolicy,
    /// Cron schedules
    pub scheduler: SchedulerSettings,
}

/// Connection descriptor of the operational database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// `postgres://...`, `sqlite:path` or a plain file path
    pub url: String,
    /// Kind the environment is configured for
    pub kind: DatabaseKind,
    /// Binary used for relational dumps
    pub pg_dump_path: String,
}

impl DatabaseSettings {
    /// Settings for `url`, inferring the kind from its scheme
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        let kind = infer_kind(&url)?;
        Ok(Self {
            url,
            kind,
            pg_dump_path: "pg_dump".to_string(),
        })
    }

    /// Settings for a SQLite file
    pub fn sqlite(path: &Path) -> Self {
        Self {
            url: format!("sqlite:{}", path.display()),
            kind: DatabaseKind::Sqlite,
            pg_dump_path: "pg_dump".to_string(),
        }
    }

    /// File path of a SQLite database, `None` for server URLs
    pub fn sqlite_path(&self) -> Option<PathBuf> {
        if self.kind != DatabaseKind::Sqlite {
            return None;
        }
        let raw = self
            .url
            .strip_prefix("sqlite://")
            .or_else(|| self.url.strip_prefix("sqlite:"))
            .unwrap_or(&self.url);
        // Drop connection options such as `?mode=rwc`
        let raw = raw.split('?').next().unwrap_or(raw);
        if raw.is_empty() {
            None
        } else {
            Some(PathBuf::from(raw))
        }
    }
}

/// Object storage settings; all of bucket and credentials must be set to
/// enable remote mode
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectStoreSettings {
    pub bucket: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub list_max_keys: usize,
    pub timeout_secs: u64,
}

impl ObjectStoreSettings {
    /// Whether bucket and credentials are all present
    pub fn is_configured(&self) -> bool {
        self.bucket.is_some() && self.access_key_id.is_some() && self.secret_access_key.is_some()
    }

    /// Per-call timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Cron expressions for the built-in jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub backup_schedule: String,
    pub retention_schedule: String,
    /// IANA timezone name
    pub timezone: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            backup_schedule: "0 0 2 * * *".to_string(),
            retention_schedule: "0 30 3 * * *".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

impl Settings {
    /// Load from the process environment, reading `.env` first when present
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let url = var("DATABASE_URL")
            .ok_or_else(|| BackupError::Configuration("DATABASE_URL is not set".to_string()))?;
        let kind = match var("DATABASE_KIND") {
            Some(kind) => kind.parse()?,
            None => infer_kind(&url)?,
        };
        let database = DatabaseSettings {
            url,
            kind,
            pg_dump_path: var("PG_DUMP_PATH").unwrap_or_else(|| "pg_dump".to_string()),
        };

        let object_store = ObjectStoreSettings {
            bucket: var("S3_BUCKET"),
            region: var("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            access_key_id: var("AWS_ACCESS_KEY_ID"),
            secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
            endpoint_url: var("S3_ENDPOINT_URL"),
            force_path_style: parse_or("S3_FORCE_PATH_STYLE", var("S3_FORCE_PATH_STYLE"), false)?,
            list_max_keys: parse_or("S3_LIST_MAX_KEYS", var("S3_LIST_MAX_KEYS"), 1000usize)?,
            timeout_secs: parse_or("S3_TIMEOUT_SECS", var("S3_TIMEOUT_SECS"), 60u64)?,
        };
        if object_store.list_max_keys == 0 {
            return Err(BackupError::Configuration("S3_LIST_MAX_KEYS must be at least 1".to_string()));
        }

        let defaults = RetentionPolicy::default();
        let retention = RetentionPolicy {
            daily_days: parse_or("RETENTION_DAILY_DAYS", var("RETENTION_DAILY_DAYS"), defaults.daily_days)?,
            weekly_weeks: parse_or("RETENTION_WEEKLY_WEEKS", var("RETENTION_WEEKLY_WEEKS"), defaults.weekly_weeks)?,
            monthly_months: parse_or(
                "RETENTION_MONTHLY_MONTHS",
                var("RETENTION_MONTHLY_MONTHS"),
                defaults.monthly_months,
            )?,
        };
        retention.validate()?;

        let scheduler_defaults = SchedulerSettings::default();
        let scheduler = SchedulerSettings {
            backup_schedule: var("BACKUP_SCHEDULE").unwrap_or(scheduler_defaults.backup_schedule),
            retention_schedule: var("RETENTION_SCHEDULE").unwrap_or(scheduler_defaults.retention_schedule),
            timezone: var("SCHEDULER_TIMEZONE").unwrap_or(scheduler_defaults.timezone),
        };

        Ok(Self {
            database,
            backup_dir: var("BACKUP_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./backups")),
            upload_enabled: parse_or("BACKUP_UPLOAD", var("BACKUP_UPLOAD"), true)?,
            object_store,
            retention,
            scheduler,
        })
    }
}

/// Kind implied by a connection URL
pub fn infer_kind(url: &str) -> Result<DatabaseKind> {
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        Ok(DatabaseKind::Postgres)
    } else if lower.starts_with("sqlite:") || lower.ends_with(".db") || lower.ends_with(".sqlite") || lower.ends_with(".sqlite3") {
        Ok(DatabaseKind::Sqlite)
    } else if !lower.contains("://") {
        // Plain file path
        Ok(DatabaseKind::Sqlite)
    } else {
        Err(BackupError::Configuration(format!(
            "Cannot infer database kind from '{}', set DATABASE_KIND",
            url
        )))
    }
}

fn parse_or<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| BackupError::Configuration(format!("{} has invalid value '{}'", key, raw))),
    }
}
