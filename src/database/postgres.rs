// Relational database: pg_dump with an INSERT-generating fallback, statement-wise restore

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::sql::{self, ColumnDef};
use super::{Database, RestoreSummary};
use crate::backup::{DatabaseKind, DumpMethod};
use crate::{BackupError, Result};

const LIST_TABLES_SQL: &str = "SELECT table_name::text FROM information_schema.tables \
     WHERE table_schema = 'public' AND table_type = 'BASE TABLE' ORDER BY table_name";

const LIST_COLUMNS_SQL: &str = "SELECT column_name::text, data_type::text, udt_name::text, is_nullable::text \
     FROM information_schema.columns \
     WHERE table_schema = 'public' AND table_name = $1 ORDER BY ordinal_position";

/// PostgreSQL server reached through a lazily connected pool
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
    url: String,
    pg_dump_path: PathBuf,
}

impl PostgresDatabase {
    /// Pool for `url`; connections are opened on first use
    pub fn connect_lazy(url: &str, pg_dump_path: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect_lazy(url)?;

        Ok(Self {
            pool,
            url: url.to_string(),
            pg_dump_path: PathBuf::from(pg_dump_path),
        })
    }

    async fn pg_dump(&self, dest: &Path) -> Result<()> {
        let output = Command::new(&self.pg_dump_path)
            .arg("--inserts")
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--file")
            .arg(dest)
            .arg("--dbname")
            .arg(&self.url)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| BackupError::Dump(format!("cannot run {}: {}", self.pg_dump_path.display(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::Dump(format!(
                "{} exited with {}: {}",
                self.pg_dump_path.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    /// Per-table CREATE + INSERT dump built from the information schema
    async fn insert_fallback(&self, dest: &Path) -> Result<()> {
        // Truncates whatever a failed pg_dump left behind
        let mut out = BufWriter::new(tokio::fs::File::create(dest).await?);
        out.write_all(b"-- Generated by backup-warden (INSERT fallback)\n\n").await?;

        let tables: Vec<String> = sqlx::query_scalar(LIST_TABLES_SQL).fetch_all(&self.pool).await?;
        for table in &tables {
            let columns = self.columns(table).await?;
            out.write_all(sql::render_create_table(table, &columns).as_bytes()).await?;
            out.write_all(b"\n").await?;

            let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
            let select = format!("SELECT row_to_json(t)::text FROM {} t", sql::quote_ident(table));
            let rows: Vec<String> = sqlx::query_scalar(&select).fetch_all(&self.pool).await?;
            for raw in &rows {
                let row: Map<String, Value> = serde_json::from_str(raw)?;
                out.write_all(sql::render_insert(table, &names, &row).as_bytes()).await?;
                out.write_all(b"\n").await?;
            }
            out.write_all(b"\n").await?;
            debug!(table = %table, rows = rows.len(), "Dumped table");
        }

        out.flush().await?;
        out.into_inner().sync_all().await?;
        info!(tables = tables.len(), "INSERT fallback dump written");
        Ok(())
    }

    async fn columns(&self, table: &str) -> Result<Vec<ColumnDef>> {
        let rows = sqlx::query(LIST_COLUMNS_SQL).bind(table).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<ColumnDef> {
                let nullable: String = row.try_get("is_nullable")?;
                Ok(ColumnDef {
                    name: row.try_get("column_name")?,
                    data_type: row.try_get("data_type")?,
                    udt_name: row.try_get("udt_name")?,
                    nullable: nullable == "YES",
                })
            })
            .collect()
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    fn kind(&self) -> DatabaseKind {
        DatabaseKind::Postgres
    }

    async fn dump(&self, dest: &Path) -> Result<DumpMethod> {
        let primary = match self.pg_dump(dest).await {
            Ok(()) => return Ok(DumpMethod::PgDump),
            Err(e) => e,
        };
        warn!(error = %primary, "pg_dump unavailable, falling back to INSERT generation");

        match self.insert_fallback(dest).await {
            Ok(()) => Ok(DumpMethod::InsertFallback),
            Err(fallback) => Err(BackupError::Dump(format!(
                "pg_dump failed ({}); INSERT fallback failed ({})",
                primary, fallback
            ))),
        }
    }

    async fn restore(&self, source: &Path, _at: DateTime<Utc>) -> Result<RestoreSummary> {
        let bytes = tokio::fs::read(source).await?;
        let text = String::from_utf8_lossy(&bytes);
        let statements = sql::split_statements(&text);
        info!(statements = statements.len(), "Applying dump");

        let mut conn = self.pool.acquire().await?;
        let summary = apply_statements(&mut conn, &statements).await;

        info!(
            applied = summary.statements_applied,
            duplicates = summary.duplicates_ignored,
            failed = summary.statements_failed,
            "Relational restore finished"
        );
        Ok(summary)
    }
}

/// A statement the server rejected
#[derive(Debug, Clone)]
struct StatementFailure {
    /// SQLSTATE, when the server sent one
    code: Option<String>,
    message: String,
}

/// Runs one SQL statement at a time
#[async_trait]
trait StatementExecutor: Send {
    async fn execute(&mut self, statement: &str) -> std::result::Result<(), StatementFailure>;
}

#[async_trait]
impl StatementExecutor for PoolConnection<Postgres> {
    async fn execute(&mut self, statement: &str) -> std::result::Result<(), StatementFailure> {
        let conn: &mut sqlx::PgConnection = &mut **self;
        sqlx::Executor::execute(conn, sqlx::raw_sql(statement))
            .await
            .map(|_| ())
            .map_err(|e| StatementFailure {
                code: e.as_database_error().and_then(|db| db.code()).map(|c| c.into_owned()),
                message: e.to_string(),
            })
    }
}

/// Execute every statement in order; failures are counted, never fatal
async fn apply_statements<E: StatementExecutor>(executor: &mut E, statements: &[String]) -> RestoreSummary {
    let mut summary = RestoreSummary::default();
    for statement in statements {
        match executor.execute(statement).await {
            Ok(()) => summary.statements_applied += 1,
            Err(failure) if sql::is_duplicate_conflict(failure.code.as_deref()) => {
                summary.duplicates_ignored += 1;
                debug!(code = ?failure.code, statement = %sql::statement_prefix(statement), "Already exists, skipped");
            }
            Err(failure) => {
                summary.statements_failed += 1;
                warn!(
                    code = ?failure.code,
                    error = %failure.message,
                    statement = %sql::statement_prefix(statement),
                    "Statement failed during restore"
                );
            }
        }
    }
    summary
}
