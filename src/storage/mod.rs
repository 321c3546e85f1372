//! Object storage for remote artifacts.
//!
//! [`ObjectStoreClient`] is what the rest of the crate talks to. It wraps an
//! optional [`ObjectStore`] backend: without a bucket or credentials the
//! client is *not configured* and callers fall back to local-only mode.

mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use memory::InMemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::config::ObjectStoreSettings;
use crate::resilience::RetryPolicy;
use crate::{BackupError, Result};

/// Content type used for compressed artifacts
pub const GZIP_CONTENT_TYPE: &str = "application/gzip";

/// Content type used for manifest sidecars
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// One entry of a remote listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub key: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Raw object storage operations. Every operation is idempotent.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `body` under `key`, overwriting any existing object
    async fn upload(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;

    /// Fetch the bytes stored under `key`
    async fn download(&self, key: &str) -> Result<Vec<u8>>;

    /// Single page of at most `max_keys` objects under `prefix`
    async fn list(&self, prefix: &str, max_keys: usize) -> Result<Vec<RemoteObject>>;

    /// Remove `key`; removing a missing key succeeds
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Configured-or-not object storage with timeout and single retry
#[derive(Clone)]
pub struct ObjectStoreClient {
    backend: Option<Arc<dyn ObjectStore>>,
    retry: RetryPolicy,
    list_max_keys: usize,
}

impl std::fmt::Debug for ObjectStoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStoreClient")
            .field("configured", &self.is_configured())
            .field("retry", &self.retry)
            .field("list_max_keys", &self.list_max_keys)
            .finish()
    }
}

impl ObjectStoreClient {
    /// Default page size for listings
    pub const DEFAULT_LIST_MAX_KEYS: usize = 1000;

    /// Client backed by `backend`
    pub fn new(backend: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self {
            backend: Some(backend),
            retry,
            list_max_keys: Self::DEFAULT_LIST_MAX_KEYS,
        }
    }

    /// Client in local-only mode
    pub fn not_configured() -> Self {
        Self {
            backend: None,
            retry: RetryPolicy::default(),
            list_max_keys: Self::DEFAULT_LIST_MAX_KEYS,
        }
    }

    /// Override the listing page size
    pub fn with_list_max_keys(mut self, max_keys: usize) -> Self {
        self.list_max_keys = max_keys.max(1);
        self
    }

    /// Build the client described by `settings`
    pub async fn from_settings(settings: &ObjectStoreSettings) -> Result<Self> {
        if !settings.is_configured() {
            info!("Object storage not configured, running in local-only mode");
            return Ok(Self::not_configured());
        }

        let backend = connect_backend(settings).await?;
        info!(
            bucket = settings.bucket.as_deref().unwrap_or_default(),
            region = %settings.region,
            "Object storage configured"
        );
        Ok(Self::new(backend, RetryPolicy::with_timeout(settings.timeout()))
            .with_list_max_keys(settings.list_max_keys))
    }

    /// Whether a backend is present
    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    /// Page size used by callers that list without an explicit bound
    pub fn list_max_keys(&self) -> usize {
        self.list_max_keys
    }

    fn backend(&self) -> Result<&Arc<dyn ObjectStore>> {
        self.backend.as_ref().ok_or(BackupError::NotConfigured)
    }

    /// Upload `body` to `key`
    #[instrument(skip(self, body), fields(size = body.len()))]
    pub async fn upload(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        let backend = self.backend()?;
        self.retry
            .execute("upload", || backend.upload(key, body.clone(), content_type))
            .await?;
        debug!(key, "Uploaded object");
        Ok(())
    }

    /// Download the object at `key`
    #[instrument(skip(self))]
    pub async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let backend = self.backend()?;
        self.retry.execute("download", || backend.download(key)).await
    }

    /// Single page listing; no auto-pagination beyond `max_keys`
    #[instrument(skip(self))]
    pub async fn list(&self, prefix: &str, max_keys: usize) -> Result<Vec<RemoteObject>> {
        let backend = self.backend()?;
        let objects = self.retry.execute("list", || backend.list(prefix, max_keys)).await?;
        if objects.len() >= max_keys {
            info!(prefix, max_keys, "Remote listing hit the page bound, older objects may be missing");
        }
        Ok(objects)
    }

    /// Delete `key` (missing keys are fine)
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        let backend = self.backend()?;
        self.retry.execute("delete", || backend.delete(key)).await
    }
}

#[cfg(feature = "s3")]
async fn connect_backend(settings: &ObjectStoreSettings) -> Result<Arc<dyn ObjectStore>> {
    Ok(Arc::new(S3ObjectStore::new(settings).await?))
}

#[cfg(not(feature = "s3"))]
async fn connect_backend(_settings: &ObjectStoreSettings) -> Result<Arc<dyn ObjectStore>> {
    Err(BackupError::Configuration(
        "Object storage credentials are set but the `s3` feature is disabled".to_string(),
    ))
}
