// Embedded single-file database: VACUUM INTO snapshots, file swap restore

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use super::{Database, RestoreSummary};
use crate::backup::{format_stamp, DatabaseKind, DumpMethod};
use crate::{BackupError, Result};

const COMPANION_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

/// SQLite database file
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    path: PathBuf,
}

impl SqliteDatabase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the live database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn vacuum_into(&self, dest: &Path) -> Result<()> {
        let mut conn = SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(false)
            .connect()
            .await?;
        sqlx::query("VACUUM INTO ?")
            .bind(dest.to_string_lossy().into_owned())
            .execute(&mut conn)
            .await?;
        conn.close().await?;
        Ok(())
    }

    async fn copy_file(&self, dest: &Path) -> Result<()> {
        tokio::fs::copy(&self.path, dest).await?;
        Ok(())
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Sqlite
    }

    async fn dump(&self, dest: &Path) -> Result<DumpMethod> {
        let primary = match self.vacuum_into(dest).await {
            Ok(()) => return Ok(DumpMethod::VacuumInto),
            Err(e) => e,
        };
        warn!(db = %self.path.display(), error = %primary, "VACUUM INTO failed, falling back to file copy");

        // VACUUM INTO needs an empty target; a raw copy overwrites whatever it left
        match self.copy_file(dest).await {
            Ok(()) => Ok(DumpMethod::FileCopy),
            Err(fallback) => Err(BackupError::Dump(format!(
                "VACUUM INTO failed ({}); file copy failed ({})",
                primary, fallback
            ))),
        }
    }

    async fn restore(&self, source: &Path, at: DateTime<Utc>) -> Result<RestoreSummary> {
        let stamp = format_stamp(&at);
        let staging = with_suffix(&self.path, ".restoring");
        let mut moved: Vec<(PathBuf, PathBuf)> = Vec::new();

        let outcome: Result<()> = async {
            let mut live_files = vec![self.path.clone()];
            live_files.extend(COMPANION_SUFFIXES.iter().map(|suffix| with_suffix(&self.path, suffix)));

            for live in live_files {
                if tokio::fs::try_exists(&live).await? {
                    let aside = with_suffix(&live, &format!(".pre-restore-{}", stamp));
                    tokio::fs::rename(&live, &aside).await?;
                    info!(from = %live.display(), to = %aside.display(), "Moved live file aside");
                    moved.push((live, aside));
                }
            }

            // Copy next to the target first so the final step is a rename
            tokio::fs::copy(source, &staging).await?;
            tokio::fs::rename(&staging, &self.path).await?;
            Ok(())
        }
        .await;

        if let Err(e) = outcome {
            error!(db = %self.path.display(), error = %e, "File swap failed, putting the live files back");
            roll_back(&staging, &moved).await;
            return Err(e);
        }

        info!(db = %self.path.display(), "Database file replaced");
        Ok(RestoreSummary {
            moved_aside: moved.into_iter().map(|(_, aside)| aside).collect(),
            ..RestoreSummary::default()
        })
    }
}

/// Undo a partial swap: drop the staging copy, rename moved files back
async fn roll_back(staging: &Path, moved: &[(PathBuf, PathBuf)]) {
    if let Err(e) = tokio::fs::remove_file(staging).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = %staging.display(), error = %e, "Could not remove staging copy");
        }
    }
    for (live, aside) in moved.iter().rev() {
        match tokio::fs::rename(aside, live).await {
            Ok(()) => info!(file = %live.display(), "Live file put back"),
            Err(e) => error!(from = %aside.display(), to = %live.display(), error = %e, "Could not put live file back"),
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::verify::SQLITE_MAGIC;
    use chrono::TimeZone;
    use sqlx::sqlite::SqliteConnection;

    async fn seed(path: &Path, guests: &[&str]) {
        let mut conn: SqliteConnection = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .connect()
            .await
            .unwrap();
        sqlx::query("CREATE TABLE IF NOT EXISTS guests (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .execute(&mut conn)
            .await
            .unwrap();
        for name in guests {
            sqlx::query("INSERT INTO guests (name) VALUES (?)")
                .bind(*name)
                .execute(&mut conn)
                .await
                .unwrap();
        }
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dump_uses_vacuum_into() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("hotel.db");
        seed(&live, &["Ada"]).await;

        let dest = dir.path().join("snapshot.db");
        tokio::fs::File::create(&dest).await.unwrap();

        let method = SqliteDatabase::new(&live).dump(&dest).await.unwrap();
        assert_eq!(method, DumpMethod::VacuumInto);
        let bytes = tokio::fs::read(&dest).await.unwrap();
        assert_eq!(&bytes[..16], SQLITE_MAGIC);
    }

    #[tokio::test]
    async fn test_dump_of_missing_file_fails_both_paths() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("snapshot.db");
        tokio::fs::File::create(&dest).await.unwrap();

        let result = SqliteDatabase::new(dir.path().join("missing.db")).dump(&dest).await;
        assert!(matches!(result, Err(BackupError::Dump(msg)) if msg.contains("VACUUM INTO") && msg.contains("file copy")));
    }

    #[tokio::test]
    async fn test_restore_moves_live_files_aside() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("hotel.db");
        seed(&live, &["Ada"]).await;
        tokio::fs::write(with_suffix(&live, "-wal"), b"wal").await.unwrap();

        let replacement = dir.path().join("replacement.db");
        seed(&replacement, &["Grace", "Linus"]).await;

        let at = Utc.with_ymd_and_hms(2025, 1, 31, 4, 5, 6).unwrap();
        let summary = SqliteDatabase::new(&live).restore(&replacement, at).await.unwrap();

        assert_eq!(
            summary.moved_aside,
            vec![
                dir.path().join("hotel.db.pre-restore-2025-01-31_04-05-06"),
                dir.path().join("hotel.db-wal.pre-restore-2025-01-31_04-05-06"),
            ]
        );
        assert!(!with_suffix(&live, "-wal").exists());
        assert_eq!(tokio::fs::read(&live).await.unwrap(), tokio::fs::read(&replacement).await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_swap_puts_live_files_back() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("hotel.db");
        tokio::fs::write(&live, b"live database bytes").await.unwrap();
        tokio::fs::write(with_suffix(&live, "-wal"), b"wal").await.unwrap();

        let at = Utc.with_ymd_and_hms(2025, 1, 31, 4, 5, 6).unwrap();
        let result = SqliteDatabase::new(&live).restore(&dir.path().join("gone.db"), at).await;
        assert!(result.is_err());

        assert_eq!(tokio::fs::read(&live).await.unwrap(), b"live database bytes");
        assert_eq!(tokio::fs::read(with_suffix(&live, "-wal")).await.unwrap(), b"wal");

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        assert_eq!(names, vec!["hotel.db", "hotel.db-wal"]);
    }
}
