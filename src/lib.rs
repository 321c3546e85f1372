//! # backup-warden
//!
//! Backup production, grandfather-father-son retention and disaster-recovery
//! restore for the operational database (guests, bookings, financial records).
//!
//! ## Overview
//!
//! The crate dumps the live database into a compressed, immutable artifact,
//! optionally mirrors it to S3-compatible object storage, prunes old artifacts
//! with a daily/weekly/monthly policy and restores any artifact back into the
//! configured database after taking a safety backup of the current state.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use backup_warden::backup::BackupProducer;
//! use backup_warden::config::Settings;
//! use backup_warden::database;
//! use backup_warden::storage::ObjectStoreClient;
//!
//! # async fn example() -> backup_warden::Result<()> {
//! let settings = Settings::from_env()?;
//! let db = database::connect(&settings.database)?;
//! let store = ObjectStoreClient::from_settings(&settings.object_store).await?;
//!
//! let producer = BackupProducer::new(db, store, settings.backup_dir.clone());
//! let report = producer.produce().await?;
//! println!("created {}", report.artifact.name);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`backup`]: artifact model, producer, verifier, listing
//! - [`database`]: the `Database` capability for SQLite and PostgreSQL
//! - [`storage`]: object storage client
//! - [`retention`]: GFS policy engine and sweeper
//! - [`restore`]: restore orchestration
//! - [`scheduler`]: single-flight cron jobs
//! - [`config`]: environment-driven settings

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for backup, retention and restore operations
#[derive(Error, Debug)]
pub enum BackupError {
    /// Missing or invalid settings, or a backup/environment kind mismatch
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Object storage was requested but no bucket or credentials are set
    #[error("Object storage is not configured")]
    NotConfigured,

    /// Network failure or timeout talking to object storage
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Artifact failed integrity verification
    #[error("Corrupt artifact: {0}")]
    CorruptArtifact(String),

    /// Both the primary and the fallback dump paths failed
    #[error("Dump failed: {0}")]
    Dump(String),

    /// Requested artifact or object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// An exclusive operation is already running
    #[error("Operation already in progress: {0}")]
    Busy(String),

    /// Object storage rejected a request for a non-transient reason
    #[error("Storage error: {0}")]
    Storage(String),

    /// Local filesystem error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Database driver error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Manifest serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Join error from blocking tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl BackupError {
    /// Whether a retry has a chance of succeeding
    pub fn is_transient(&self) -> bool {
        matches!(self, BackupError::TransientIo(_))
    }
}

/// Artifact model, production, verification and listing
pub mod backup;

/// Database capability (SQLite file, PostgreSQL)
pub mod database;

/// Object storage client
pub mod storage;

/// Timeout and retry wrapper for network calls
pub mod resilience;

/// GFS retention engine and sweeper
pub mod retention;

/// Restore orchestration
pub mod restore;

/// Cron-driven single-flight job scheduler
pub mod scheduler;

/// Environment-driven settings
pub mod config;

/// Command-line surface
pub mod cli;
