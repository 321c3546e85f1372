//! Database capability.
//!
//! Backup and restore never branch on environment flags; they go through a
//! [`Database`] trait object whose [`DatabaseKind`] is fixed at construction.

mod postgres;
mod sqlite;
pub mod sql;

pub use postgres::PostgresDatabase;
pub use sqlite::SqliteDatabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backup::{DatabaseKind, DumpMethod};
use crate::config::DatabaseSettings;
use crate::{BackupError, Result};

/// Outcome of applying an artifact to the live database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    /// Statements executed successfully (relational kind)
    pub statements_applied: usize,
    /// Statements skipped because the object or row already existed
    pub duplicates_ignored: usize,
    /// Statements that failed for any other reason
    pub statements_failed: usize,
    /// Live files renamed aside before the copy (embedded-file kind)
    pub moved_aside: Vec<PathBuf>,
}

/// Dump and restore operations for one configured database
#[async_trait]
pub trait Database: Send + Sync {
    /// Kind of the live database
    fn kind(&self) -> DatabaseKind;

    /// Write an uncompressed dump to `dest`, an existing empty file.
    ///
    /// Tries the primary method then the fallback; fails with
    /// [`BackupError::Dump`] only when both fail.
    async fn dump(&self, dest: &Path) -> Result<DumpMethod>;

    /// Apply the uncompressed dump at `source`; `at` stamps moved-aside files
    async fn restore(&self, source: &Path, at: DateTime<Utc>) -> Result<RestoreSummary>;
}

/// Database capability for `settings`. Does not open a connection yet.
pub fn connect(settings: &DatabaseSettings) -> Result<Arc<dyn Database>> {
    match settings.kind {
        DatabaseKind::Sqlite => {
            let path = settings.sqlite_path().ok_or_else(|| {
                BackupError::Configuration(format!("'{}' does not name a SQLite file", settings.url))
            })?;
            Ok(Arc::new(SqliteDatabase::new(path)))
        }
        DatabaseKind::Postgres => Ok(Arc::new(PostgresDatabase::connect_lazy(
            &settings.url,
            &settings.pg_dump_path,
        )?)),
    }
}
