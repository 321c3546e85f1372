// Integration tests for backup and restore against a real SQLite file
// Object storage is the in-memory backend

use backup_warden::backup::compression::compress_bytes;
use backup_warden::backup::{
    manifest_path, ArtifactCatalog, ArtifactLocation, BackupProducer, DatabaseKind, UploadOutcome,
};
use backup_warden::database::{self, Database};
use backup_warden::config::DatabaseSettings;
use backup_warden::resilience::RetryPolicy;
use backup_warden::restore::{RestoreOptions, RestoreOrchestrator, RestoreSource};
use backup_warden::storage::{InMemoryObjectStore, ObjectStoreClient, GZIP_CONTENT_TYPE};
use backup_warden::BackupError;
use pretty_assertions::assert_eq;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use std::sync::Arc;

async fn open(path: &Path) -> SqliteConnection {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .connect()
        .await
        .expect("Failed to open SQLite file")
}

async fn add_guests(path: &Path, names: &[&str]) {
    let mut conn = open(path).await;
    sqlx::query("CREATE TABLE IF NOT EXISTS guests (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
        .execute(&mut conn)
        .await
        .unwrap();
    for name in names {
        sqlx::query("INSERT INTO guests (name) VALUES (?)")
            .bind(*name)
            .execute(&mut conn)
            .await
            .unwrap();
    }
    conn.close().await.unwrap();
}

async fn guest_names(path: &Path) -> Vec<String> {
    let mut conn = open(path).await;
    let names: Vec<String> = sqlx::query_scalar("SELECT name FROM guests ORDER BY id")
        .fetch_all(&mut conn)
        .await
        .unwrap();
    conn.close().await.unwrap();
    names
}

struct Fixture {
    _dir: tempfile::TempDir,
    live: PathBuf,
    backup_dir: PathBuf,
    db: Arc<dyn Database>,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let live = dir.path().join("hotel.db");
    add_guests(&live, &["Ada", "Grace"]).await;
    let db = database::connect(&DatabaseSettings::sqlite(&live)).unwrap();
    Fixture {
        backup_dir: dir.path().join("backups"),
        live,
        db,
        _dir: dir,
    }
}

fn memory_store() -> (Arc<InMemoryObjectStore>, ObjectStoreClient) {
    let store = Arc::new(InMemoryObjectStore::new());
    let client = ObjectStoreClient::new(store.clone(), RetryPolicy::default());
    (store, client)
}

#[tokio::test]
async fn test_backup_then_restore_brings_rows_back() {
    let fx = fixture().await;
    let store = ObjectStoreClient::not_configured();
    let producer = BackupProducer::new(fx.db.clone(), store.clone(), fx.backup_dir.clone());

    let report = producer.produce().await.expect("Backup failed");
    assert_eq!(report.artifact.kind, DatabaseKind::Sqlite);
    assert!(matches!(report.upload, UploadOutcome::Skipped(_)));
    let ArtifactLocation::Local(artifact_path) = report.artifact.location.clone() else {
        panic!("fresh artifact must be local");
    };
    assert!(manifest_path(&artifact_path).exists());

    // Changes after the backup are lost on restore
    add_guests(&fx.live, &["Mallory"]).await;
    assert_eq!(guest_names(&fx.live).await, vec!["Ada", "Grace", "Mallory"]);

    let catalog = ArtifactCatalog::new(fx.backup_dir.clone(), store);
    let orchestrator = RestoreOrchestrator::new(fx.db.clone(), producer, catalog.clone());
    let restored = orchestrator
        .restore(RestoreSource::Path(artifact_path), RestoreOptions::default())
        .await
        .expect("Restore failed");

    assert_eq!(guest_names(&fx.live).await, vec!["Ada", "Grace"]);
    assert_eq!(restored.artifact.name, report.artifact.name);

    // The pre-restore state survives twice: as a safety artifact and as a moved-aside file
    let safety = restored.safety_backup.expect("safety backup expected");
    assert!(safety.safety);
    assert!(!restored.summary.moved_aside.is_empty());
    assert_eq!(guest_names(&restored.summary.moved_aside[0]).await, vec!["Ada", "Grace", "Mallory"]);

    // --latest never picks the safety artifact
    let latest = catalog.latest().await.unwrap().unwrap();
    assert_eq!(latest.name, report.artifact.name);
}

#[tokio::test]
async fn test_kind_mismatch_is_rejected_before_any_side_effect() {
    let fx = fixture().await;
    tokio::fs::create_dir_all(&fx.backup_dir).await.unwrap();
    let foreign = fx.backup_dir.join("postgres-backup-2025-01-01_02-00-00.sql.gz");
    let dump = compress_bytes(b"CREATE TABLE guests (id integer);\n").unwrap();
    tokio::fs::write(&foreign, dump).await.unwrap();

    let store = ObjectStoreClient::not_configured();
    let producer = BackupProducer::new(fx.db.clone(), store.clone(), fx.backup_dir.clone());
    let catalog = ArtifactCatalog::new(fx.backup_dir.clone(), store);
    let orchestrator = RestoreOrchestrator::new(fx.db.clone(), producer, catalog.clone());

    let err = orchestrator
        .restore(RestoreSource::Path(foreign.clone()), RestoreOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::Configuration(_)), "got {:?}", err);

    // No safety backup, no moved-aside file, live data intact
    let listing = catalog.list_local().await.unwrap();
    assert_eq!(listing.artifacts.len(), 1);
    assert_eq!(guest_names(&fx.live).await, vec!["Ada", "Grace"]);
    let mut entries = tokio::fs::read_dir(fx.live.parent().unwrap()).await.unwrap();
    while let Some(entry) = entries.next_entry().await.unwrap() {
        assert!(!entry.file_name().to_string_lossy().contains("pre-restore"));
    }
}

#[tokio::test]
async fn test_restore_from_remote_after_local_copy_is_gone() {
    let fx = fixture().await;
    let (store, client) = memory_store();
    let producer = BackupProducer::new(fx.db.clone(), client.clone(), fx.backup_dir.clone());

    let report = producer.produce().await.unwrap();
    let UploadOutcome::Uploaded(key) = report.upload.clone() else {
        panic!("expected upload, got {:?}", report.upload);
    };
    assert_eq!(key, format!("backups/sqlite/{}", report.artifact.name));
    assert_eq!(store.content_type(&key).as_deref(), Some(GZIP_CONTENT_TYPE));

    // Lose the local copy and the live rows
    if let ArtifactLocation::Local(path) = &report.artifact.location {
        tokio::fs::remove_file(path).await.unwrap();
        tokio::fs::remove_file(manifest_path(path)).await.unwrap();
    }
    add_guests(&fx.live, &["Eve"]).await;

    let catalog = ArtifactCatalog::new(fx.backup_dir.clone(), client);
    let orchestrator = RestoreOrchestrator::new(fx.db.clone(), producer, catalog);
    let restored = orchestrator
        .restore(RestoreSource::Remote(key), RestoreOptions { skip_safety: true })
        .await
        .unwrap();

    assert!(restored.safety_backup.is_none());
    assert_eq!(guest_names(&fx.live).await, vec!["Ada", "Grace"]);
}

#[tokio::test]
async fn test_tampered_remote_artifact_fails_checksum() {
    let fx = fixture().await;
    let (_store, client) = memory_store();
    let producer = BackupProducer::new(fx.db.clone(), client.clone(), fx.backup_dir.clone());
    let report = producer.produce().await.unwrap();
    let UploadOutcome::Uploaded(key) = report.upload else {
        panic!("expected upload");
    };

    let forged = compress_bytes(b"SQLite format 3\0not really a database").unwrap();
    client.upload(&key, forged, GZIP_CONTENT_TYPE).await.unwrap();

    let catalog = ArtifactCatalog::new(fx.backup_dir.clone(), client);
    let orchestrator = RestoreOrchestrator::new(fx.db.clone(), producer, catalog);
    let err = orchestrator
        .restore(RestoreSource::Remote(key), RestoreOptions { skip_safety: true })
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::CorruptArtifact(_)), "got {:?}", err);
    assert_eq!(guest_names(&fx.live).await, vec!["Ada", "Grace"]);
}

#[tokio::test]
async fn test_latest_with_no_artifacts_is_not_found() {
    let fx = fixture().await;
    let store = ObjectStoreClient::not_configured();
    let producer = BackupProducer::new(fx.db.clone(), store.clone(), fx.backup_dir.clone());
    let catalog = ArtifactCatalog::new(fx.backup_dir.clone(), store);
    let orchestrator = RestoreOrchestrator::new(fx.db.clone(), producer, catalog);

    let err = orchestrator
        .restore(RestoreSource::Latest, RestoreOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BackupError::NotFound(_)));
    assert!(!fx.backup_dir.exists());
}
