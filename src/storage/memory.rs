use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{ObjectStore, RemoteObject};
use crate::{BackupError, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    body: Vec<u8>,
    content_type: String,
    modified_at: DateTime<Utc>,
}

/// Process-local object store.
///
/// Used by tests and for dry experiments without a bucket. `fail_next`
/// injects transient failures into the next calls.
#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<DashMap<String, StoredObject>>,
    pending_failures: Arc<AtomicUsize>,
}

impl InMemoryObjectStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `calls` operations fail with a transient error
    pub fn fail_next(&self, calls: usize) {
        self.pending_failures.store(calls, Ordering::SeqCst);
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the store holds no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Content type recorded for `key`
    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.get(key).map(|o| o.content_type.clone())
    }

    fn injected_failure(&self, operation: &str) -> Result<()> {
        let consumed = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(BackupError::TransientIo(format!("injected {} failure", operation)));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn upload(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.injected_failure("upload")?;
        self.objects.insert(
            key.to_string(),
            StoredObject {
                body,
                content_type: content_type.to_string(),
                modified_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        self.injected_failure("download")?;
        self.objects
            .get(key)
            .map(|o| o.body.clone())
            .ok_or_else(|| BackupError::NotFound(format!("Object {} not found", key)))
    }

    async fn list(&self, prefix: &str, max_keys: usize) -> Result<Vec<RemoteObject>> {
        self.injected_failure("list")?;
        let mut objects: Vec<RemoteObject> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| RemoteObject {
                key: entry.key().clone(),
                size_bytes: entry.value().body.len() as u64,
                modified_at: Some(entry.value().modified_at),
            })
            .collect();

        // S3 lists in ascending key order
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        objects.truncate(max_keys);
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.injected_failure("delete")?;
        self.objects.remove(key);
        Ok(())
    }
}
