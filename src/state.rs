use std::sync::Arc;

use crate::{
    auth::ApiKeyRegistry,
    blob::{BlobStore, InMemoryBlobStore},
    cache::ModelCache,
    config::ServingConfig,
    log_pipeline::{InMemoryLogSink, LogSink, PredictionLogPipeline},
    metrics::AppMetrics,
    registry::{InMemoryRegistry, RegistryClient},
};

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<ModelCache>,
    pub log_pipeline: Arc<PredictionLogPipeline>,
    pub registry: Arc<dyn RegistryClient>,
    pub blob_store: Arc<dyn BlobStore>,
    pub metrics: Arc<AppMetrics>,
    pub auth: Arc<ApiKeyRegistry>,
    pub config: ServingConfig,
}

impl AppState {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        blob_store: Arc<dyn BlobStore>,
        log_sink: Arc<dyn LogSink>,
        config: ServingConfig,
    ) -> Self {
        let metrics = Arc::new(AppMetrics::new());
        let cache = Arc::new(ModelCache::new(
            config.max_resident_models,
            registry.clone(),
            blob_store.clone(),
            metrics.clone(),
        ));
        let log_pipeline = Arc::new(PredictionLogPipeline::with_capacity(
            log_sink,
            metrics.clone(),
            config.log_queue_capacity,
        ));
        let auth = Arc::new(ApiKeyRegistry::from_env());

        Self { cache, log_pipeline, registry, blob_store, metrics, auth, config }
    }

    /// Same wiring as [`AppState::new`] but always in-memory, mirroring the
    /// teacher's `new_for_tests` split for its Redis-backed collaborators.
    pub fn new_for_tests() -> Self {
        let registry: Arc<dyn RegistryClient> = Arc::new(InMemoryRegistry::new());
        let blob_store: Arc<dyn BlobStore> = Arc::new(InMemoryBlobStore::new());
        let log_sink: Arc<dyn LogSink> = Arc::new(InMemoryLogSink::new());
        Self::new(registry, blob_store, log_sink, ServingConfig::from_env())
    }
}
