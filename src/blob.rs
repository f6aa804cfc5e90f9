use std::{collections::HashMap, env, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

/// Fetches opaque model artifacts by key from an external object store.
/// Pure I/O; errors are retried at the implementation's discretion and
/// surfaced to the cache as [`BlobError`].
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, artifact_key: &str) -> Result<Vec<u8>, BlobError>;
    async fn exists(&self, artifact_key: &str) -> Result<bool, BlobError>;
}

/// In-memory fake used by tests and by default when no blob endpoint is
/// configured, mirroring the teacher's in-memory fallback for its response
/// cache and rate limiter when `REDIS_URL` is absent.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
    artificial_delay: Duration,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            artifacts: Mutex::new(HashMap::new()),
            artificial_delay: delay,
        }
    }

    pub async fn put(&self, artifact_key: impl Into<String>, bytes: Vec<u8>) {
        self.artifacts.lock().await.insert(artifact_key.into(), bytes);
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, artifact_key: &str) -> Result<Vec<u8>, BlobError> {
        if !self.artificial_delay.is_zero() {
            tokio::time::sleep(self.artificial_delay).await;
        }
        self.artifacts
            .lock()
            .await
            .get(artifact_key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(artifact_key.to_owned()))
    }

    async fn exists(&self, artifact_key: &str) -> Result<bool, BlobError> {
        Ok(self.artifacts.lock().await.contains_key(artifact_key))
    }
}

/// Object-store-backed client speaking to an S3/MinIO-shaped HTTP endpoint.
/// Presence of `SERVING_BLOB_ENDPOINT` selects this implementation at
/// startup; absence falls back to [`InMemoryBlobStore`], the same selection
/// shape the teacher uses for `ResponseCache`/`RateLimiter` against Redis.
#[derive(Clone)]
pub struct HttpBlobStore {
    client: reqwest::Client,
    endpoint: String,
    bucket: String,
    access_key: String,
    secret_key: String,
}

impl HttpBlobStore {
    pub fn from_env() -> Option<Self> {
        let endpoint = env::var("SERVING_BLOB_ENDPOINT").ok()?;
        if endpoint.trim().is_empty() {
            return None;
        }
        let bucket = env::var("SERVING_BLOB_BUCKET").unwrap_or_else(|_| "models".to_owned());
        let access_key = env::var("SERVING_BLOB_ACCESS_KEY").unwrap_or_default();
        let secret_key = env::var("SERVING_BLOB_SECRET_KEY").unwrap_or_default();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .ok()?;

        Some(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            bucket,
            access_key,
            secret_key,
        })
    }

    fn object_url(&self, artifact_key: &str) -> String {
        format!(
            "{}/{}/{}",
            self.endpoint,
            self.bucket,
            artifact_key.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn get(&self, artifact_key: &str) -> Result<Vec<u8>, BlobError> {
        let response = self
            .client
            .get(self.object_url(artifact_key))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .send()
            .await
            .map_err(|error| BlobError::Unavailable(error.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BlobError::NotFound(artifact_key.to_owned()));
        }
        if !response.status().is_success() {
            return Err(BlobError::Unavailable(format!(
                "status {}",
                response.status().as_u16()
            )));
        }

        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|error| BlobError::Unavailable(error.to_string()))
    }

    async fn exists(&self, artifact_key: &str) -> Result<bool, BlobError> {
        let response = self
            .client
            .head(self.object_url(artifact_key))
            .basic_auth(&self.access_key, Some(&self.secret_key))
            .send()
            .await
            .map_err(|error| {
                warn!(error = %error, "blob existence check failed");
                BlobError::Unavailable(error.to_string())
            })?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_returns_not_found_for_missing_artifact() {
        let store = InMemoryBlobStore::new();
        let error = store.get("missing.pkl").await.expect_err("should miss");
        matches!(error, BlobError::NotFound(_));
    }

    #[tokio::test]
    async fn get_returns_stored_bytes() {
        let store = InMemoryBlobStore::new();
        store.put("models/iris_v1.pkl", vec![1, 2, 3]).await;
        let bytes = store.get("models/iris_v1.pkl").await.expect("hit");
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn exists_reflects_presence() {
        let store = InMemoryBlobStore::new();
        assert!(!store.exists("models/iris_v1.pkl").await.unwrap());
        store.put("models/iris_v1.pkl", vec![1]).await;
        assert!(store.exists("models/iris_v1.pkl").await.unwrap());
    }
}
