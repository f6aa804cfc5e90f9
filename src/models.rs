use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{LoadOutcome, LoadStatus, ResidentDescriptor, UnloadOutcome, UnloadStatus};

#[derive(Debug, Clone, Deserialize)]
pub struct LoadRequest {
    pub model_name: String,
    pub version: String,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub batch_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadResponse {
    pub status: &'static str,
    pub cache_size: usize,
}

impl LoadResponse {
    pub fn from_outcome(outcome: LoadOutcome) -> Self {
        let status = match outcome.status {
            LoadStatus::Loaded => "loaded",
            LoadStatus::AlreadyLoaded => "already_loaded",
        };
        Self { status, cache_size: outcome.cache_size }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnloadRequest {
    pub model_name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnloadResponse {
    pub status: &'static str,
    pub cache_size: usize,
}

impl UnloadResponse {
    pub fn from_outcome(outcome: UnloadOutcome) -> Self {
        let status = match outcome.status {
            UnloadStatus::Unloaded => "unloaded",
            UnloadStatus::NotLoaded => "not_loaded",
        };
        Self { status, cache_size: outcome.cache_size }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadedModelSummary {
    pub model_name: String,
    pub version: String,
    pub framework: String,
    pub metadata: Value,
}

impl From<&ResidentDescriptor> for LoadedModelSummary {
    fn from(descriptor: &ResidentDescriptor) -> Self {
        Self {
            model_name: descriptor.key.name().to_owned(),
            version: descriptor.key.version().to_owned(),
            framework: descriptor.framework.clone(),
            metadata: descriptor.metadata.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelsListResponse {
    pub loaded_models: Vec<LoadedModelSummary>,
    pub count: usize,
    pub max_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PredictRequest {
    pub features: Vec<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictResponse {
    pub prediction: i64,
    pub model_name: String,
    pub model_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub loaded_models_count: usize,
    pub max_capacity: usize,
    pub models: Vec<LoadedModelSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_request_defaults_batch_params_to_none() {
        let request: LoadRequest =
            serde_json::from_str(r#"{"model_name":"iris","version":"v1"}"#).unwrap();
        assert!(request.batch_size.is_none());
        assert!(request.batch_wait_ms.is_none());
    }

    #[test]
    fn load_response_maps_status_label() {
        let response = LoadResponse::from_outcome(LoadOutcome { status: LoadStatus::Loaded, cache_size: 1 });
        assert_eq!(response.status, "loaded");
    }
}
