use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::model_key::ModelKey;

/// Immutable catalog record: at most one per [`ModelKey`].
#[derive(Debug, Clone)]
pub struct RegistryRecord {
    pub key: ModelKey,
    pub artifact_key: String,
    pub framework: String,
    pub metadata: Value,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry backend unavailable: {0}")]
    Unavailable(String),
}

/// Read-only catalog lookup. Production deployments back this with the
/// relational store's `model_metadata` table; this crate ships only the
/// narrow trait plus an in-memory fake used by tests.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn lookup(&self, key: &ModelKey) -> Result<Option<RegistryRecord>, RegistryError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    records: Mutex<HashMap<ModelKey, RegistryRecord>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as the out-of-scope registration tooling would.
    pub async fn register(&self, record: RegistryRecord) {
        self.records.lock().await.insert(record.key.clone(), record);
    }
}

#[async_trait]
impl RegistryClient for InMemoryRegistry {
    async fn lookup(&self, key: &ModelKey) -> Result<Option<RegistryRecord>, RegistryError> {
        Ok(self.records.lock().await.get(key).cloned())
    }
}

/// Registry backed by the `model_metadata` table of the relational store
/// named in the specification's persisted-state layout. Selected at startup
/// when `SERVING_REGISTRY_URL` is set; connects lazily (§6: "registry
/// unreachable at init is fatal only if the operator requires eager
/// validation; default is lazy") so a down database surfaces as
/// `RegistryError::Unavailable` on first `lookup`, not a startup panic.
pub struct SqlRegistryClient {
    pool: PgPool,
}

impl SqlRegistryClient {
    pub fn connect_lazy(database_url: &str) -> Result<Self, RegistryError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_lazy(database_url)
            .map_err(|error| RegistryError::Unavailable(error.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl RegistryClient for SqlRegistryClient {
    async fn lookup(&self, key: &ModelKey) -> Result<Option<RegistryRecord>, RegistryError> {
        let row = sqlx::query(
            "SELECT artifact_key, framework, metadata_json FROM model_metadata WHERE name = $1 AND version = $2",
        )
        .bind(key.name())
        .bind(key.version())
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| RegistryError::Unavailable(error.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let artifact_key: String = row.try_get("artifact_key").map_err(|error| RegistryError::Unavailable(error.to_string()))?;
        let framework: String = row.try_get("framework").map_err(|error| RegistryError::Unavailable(error.to_string()))?;
        let metadata: Value = row
            .try_get::<Option<Value>, _>("metadata_json")
            .map_err(|error| RegistryError::Unavailable(error.to_string()))?
            .unwrap_or(Value::Null);

        Ok(Some(RegistryRecord { key: key.clone(), artifact_key, framework, metadata }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_returns_none_for_unregistered_key() {
        let registry = InMemoryRegistry::new();
        let key = ModelKey::new("iris", "v1").unwrap();
        assert!(registry.lookup(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lookup_returns_registered_record() {
        let registry = InMemoryRegistry::new();
        let key = ModelKey::new("iris", "v1").unwrap();
        registry
            .register(RegistryRecord {
                key: key.clone(),
                artifact_key: "models/iris_v1.pkl".to_owned(),
                framework: "sklearn".to_owned(),
                metadata: serde_json::json!({"accuracy": 0.97}),
            })
            .await;

        let record = registry.lookup(&key).await.unwrap().expect("record present");
        assert_eq!(record.framework, "sklearn");
    }
}
