use axum::{
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::{cache::CacheError, model_key::ModelKey};

/// Request-handler-facing error taxonomy. `Cancelled` has no HTTP mapping
/// by design: the client that would receive it is already gone.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("no such model registered: {0}")]
    RegistryMissing(ModelKey),
    #[error("model artifact could not be loaded: {0}")]
    LoadFailure(String),
    #[error("model {0} is not loaded")]
    NotLoaded(ModelKey),
    #[error("predictor raised: {0}")]
    PredictorFailure(String),
    #[error("scheduler for {0} is shutting down")]
    Shutdown(ModelKey),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
}

impl AppError {
    /// Auto-load-then-retry-once policy (§4.5): a `NotLoaded` surfaced from
    /// the cache after that retry becomes a genuine 404 for the client.
    pub fn from_cache_error(error: CacheError) -> Self {
        match error {
            CacheError::RegistryMissing(key) => AppError::RegistryMissing(key),
            CacheError::LoadFailure(message) => AppError::LoadFailure(message),
            CacheError::NotLoaded(key) => AppError::NotLoaded(key),
            CacheError::PredictorFailure(message) => AppError::PredictorFailure(message),
            CacheError::Shutdown(key) => AppError::Shutdown(key),
            CacheError::Cancelled => AppError::PredictorFailure("request cancelled before delivery".to_owned()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, detail) = match &self {
            AppError::RegistryMissing(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::NotLoaded(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::LoadFailure(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::PredictorFailure(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
            AppError::Shutdown(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
        };

        (status, Json(ErrorEnvelope { detail })).into_response()
    }
}

pub fn apply_header(headers: &mut axum::http::HeaderMap, name: &str, value: &str) {
    let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
        return;
    };
    let Ok(header_value) = HeaderValue::from_str(value) else {
        return;
    };
    headers.insert(header_name, header_value);
}
