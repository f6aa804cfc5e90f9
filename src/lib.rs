pub mod auth;
pub mod blob;
pub mod cache;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod log_pipeline;
pub mod metrics;
pub mod model_key;
pub mod models;
pub mod predictor;
pub mod registry;
pub mod scheduler;
pub mod state;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tracing::info;

use blob::{BlobStore, HttpBlobStore, InMemoryBlobStore};
use config::ServingConfig;
use log_pipeline::{InMemoryLogSink, LogSink, SqlLogSink};
use registry::{InMemoryRegistry, RegistryClient, SqlRegistryClient};
use state::AppState;

/// Assembles the two process singletons (Model Cache, Log Pipeline) from
/// the environment. Blob store selection mirrors the teacher's
/// Redis-vs-memory fallback: presence of `SERVING_BLOB_ENDPOINT` selects
/// the networked implementation, absence falls back to an in-memory fake
/// suitable for local runs and tests. The registry and log sink follow the
/// same shape against `SERVING_REGISTRY_URL`, the connection string for the
/// relational store backing `model_metadata` and `prediction_logs` (§6);
/// both connect lazily, so an unreachable database surfaces as
/// `RegistryMissing`/`LoadFailure` on first use, not a fatal startup error
/// (§6: "registry unreachable at init is fatal only if the operator
/// requires eager validation; default is lazy").
pub fn build_state() -> AppState {
    let config = ServingConfig::from_env();

    let blob_store: Arc<dyn BlobStore> = match HttpBlobStore::from_env() {
        Some(store) => {
            info!("blob store configured against SERVING_BLOB_ENDPOINT");
            Arc::new(store)
        }
        None => {
            info!("no SERVING_BLOB_ENDPOINT set; using in-memory blob store");
            Arc::new(InMemoryBlobStore::new())
        }
    };

    let (registry, log_sink): (Arc<dyn RegistryClient>, Arc<dyn LogSink>) = match &config.registry_url {
        Some(database_url) => {
            info!("registry and log pipeline configured against SERVING_REGISTRY_URL");
            let registry = SqlRegistryClient::connect_lazy(database_url)
                .expect("SERVING_REGISTRY_URL must be a well-formed connection string");
            let log_sink = SqlLogSink::connect_lazy(database_url)
                .expect("SERVING_REGISTRY_URL must be a well-formed connection string");
            (Arc::new(registry), Arc::new(log_sink))
        }
        None => {
            info!("no SERVING_REGISTRY_URL set; using in-memory registry and log sink");
            (Arc::new(InMemoryRegistry::new()), Arc::new(InMemoryLogSink::new()))
        }
    };

    AppState::new(registry, blob_store, log_sink, config)
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/models/load", post(handlers::load_model))
        .route("/models/unload", post(handlers::unload_model))
        .route("/models", get(handlers::list_models))
        .route("/models/:name/versions/:version/predict", post(handlers::predict))
        .with_state(state)
}
