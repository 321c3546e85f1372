// S3 object store - real AWS S3 or any S3-compatible service (MinIO, LocalStack)

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use chrono::DateTime;
use tracing::debug;

use super::{ObjectStore, RemoteObject};
use crate::config::ObjectStoreSettings;
use crate::{BackupError, Result};

/// Object store backed by an S3 bucket
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client for the bucket described by `settings`
    pub async fn new(settings: &ObjectStoreSettings) -> Result<Self> {
        let bucket = settings
            .bucket
            .clone()
            .ok_or_else(|| BackupError::Configuration("S3_BUCKET is not set".to_string()))?;

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&settings.access_key_id, &settings.secret_access_key)
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "backup-warden",
            ));
        }

        // Custom endpoint for S3-compatible services
        if let Some(ref endpoint) = settings.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
        if settings.force_path_style {
            s3_config = s3_config.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config.build()),
            bucket,
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| sdk_error("upload", key, e))?;
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let response = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                    return Err(BackupError::NotFound(format!("Object {} not found", key)));
                }
                return Err(sdk_error("download", key, e));
            }
        };

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| BackupError::TransientIo(format!("Failed to read body of {}: {}", key, e)))?
            .into_bytes();
        Ok(body.to_vec())
    }

    async fn list(&self, prefix: &str, max_keys: usize) -> Result<Vec<RemoteObject>> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .max_keys(i32::try_from(max_keys).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(|e| sdk_error("list", prefix, e))?;

        let objects: Vec<RemoteObject> = response
            .contents()
            .iter()
            .filter_map(|object| {
                object.key().map(|key| RemoteObject {
                    key: key.to_string(),
                    size_bytes: object.size().unwrap_or(0).max(0) as u64,
                    modified_at: object
                        .last_modified()
                        .and_then(|t| DateTime::from_timestamp(t.secs(), 0)),
                })
            })
            .collect();

        debug!(prefix, count = objects.len(), truncated = response.is_truncated().unwrap_or(false), "Listed objects");
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("delete", key, e))?;
        Ok(())
    }
}

/// Dispatch failures, timeouts and 5xx responses are transient; everything
/// else is a structural storage error.
fn sdk_error<E>(operation: &str, key: &str, error: SdkError<E, HttpResponse>) -> BackupError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let transient = match &error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(context) => context.raw().status().is_server_error(),
        _ => false,
    };
    let message = format!("S3 {} of {} failed: {}", operation, key, DisplayErrorContext(&error));
    if transient {
        BackupError::TransientIo(message)
    } else {
        BackupError::Storage(message)
    }
}
