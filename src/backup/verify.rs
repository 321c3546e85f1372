// Integrity verification - structural checks run before an artifact is trusted

use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::debug;

use super::types::DatabaseKind;
use crate::Result;

/// Magic header every SQLite 3 database file starts with
pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

const SQL_MARKERS: [&[u8]; 2] = [b"CREATE TABLE", b"INSERT INTO"];

/// Fail-closed structural checks on uncompressed dumps.
///
/// Returns `Ok(false)` for any structural mismatch; only I/O errors
/// (missing file, permissions) surface as `Err`. The file is opened
/// read-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Check `path` against the format expected for `kind`
    pub async fn verify(&self, path: &Path, kind: DatabaseKind) -> Result<bool> {
        let valid = match kind {
            DatabaseKind::Sqlite => Self::has_sqlite_header(path).await?,
            DatabaseKind::Postgres => Self::has_sql_markers(path).await?,
        };
        debug!(path = %path.display(), kind = %kind, valid, "Integrity check finished");
        Ok(valid)
    }

    async fn has_sqlite_header(path: &Path) -> Result<bool> {
        let mut file = File::open(path).await?;
        let mut header = [0u8; 16];
        let mut filled = 0;
        while filled < header.len() {
            let n = file.read(&mut header[filled..]).await?;
            if n == 0 {
                return Ok(false);
            }
            filled += n;
        }
        Ok(&header == SQLITE_MAGIC)
    }

    async fn has_sql_markers(path: &Path) -> Result<bool> {
        let mut reader = BufReader::new(File::open(path).await?);
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                return Ok(false);
            }
            if SQL_MARKERS.iter().any(|marker| contains(&line, marker)) {
                return Ok(true);
            }
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}
