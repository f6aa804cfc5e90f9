use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    cache::CacheError,
    errors::{apply_header, AppError},
    log_pipeline::PendingLog,
    model_key::ModelKey,
    models::{
        HealthResponse, LoadRequest, LoadResponse, LoadedModelSummary, ModelsListResponse,
        PredictRequest, PredictResponse, UnloadRequest, UnloadResponse,
    },
    state::AppState,
};

const REQUEST_ID_HEADER: &str = "x-request-id";

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

async fn finish(
    state: &AppState,
    path: &str,
    method: &str,
    started: Instant,
    request_id: String,
    mut response: Response,
) -> Response {
    apply_header(response.headers_mut(), REQUEST_ID_HEADER, &request_id);
    state
        .metrics
        .observe_request(path, method, response.status().as_u16(), started.elapsed());
    response
}

pub async fn metrics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let started = Instant::now();
    let request_id = correlation_id(&headers);

    let response = match state.metrics.render() {
        Ok(body) => ([(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], body).into_response(),
        Err(error) => AppError::LoadFailure(format!("metrics render failed: {error}")).into_response(),
    };

    finish(&state, "/metrics", "GET", started, request_id, response).await
}

pub async fn health(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let started = Instant::now();
    let request_id = correlation_id(&headers);

    let models = state.cache.list().await;
    let payload = HealthResponse {
        status: "ok",
        loaded_models_count: models.len(),
        max_capacity: state.cache.capacity(),
        models: models.iter().map(LoadedModelSummary::from).collect(),
    };
    let response = Json(payload).into_response();

    finish(&state, "/health", "GET", started, request_id, response).await
}

pub async fn load_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<LoadRequest>,
) -> Response {
    let started = Instant::now();
    let request_id = correlation_id(&headers);

    let response = match state.auth.authenticate(&headers) {
        Err(error) => error.into_response(),
        Ok(()) => {
            let _inflight = state.metrics.inflight_guard();
            match process_load(&state, request).await {
                Ok(response) => Json(response).into_response(),
                Err(error) => error.into_response(),
            }
        }
    };

    finish(&state, "/models/load", "POST", started, request_id, response).await
}

async fn process_load(state: &AppState, request: LoadRequest) -> Result<LoadResponse, AppError> {
    let key = ModelKey::new(request.model_name, request.version).map_err(AppError::BadRequest)?;
    let batch_size = request.batch_size.unwrap_or(state.config.default_batch_size);
    let max_wait = request
        .batch_wait_ms
        .map(std::time::Duration::from_millis)
        .unwrap_or(state.config.default_batch_wait);

    let outcome = state
        .cache
        .load(key, batch_size, max_wait)
        .await
        .map_err(AppError::from_cache_error)?;

    Ok(LoadResponse::from_outcome(outcome))
}

pub async fn unload_model(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<UnloadRequest>,
) -> Response {
    let started = Instant::now();
    let request_id = correlation_id(&headers);

    let response = match state.auth.authenticate(&headers) {
        Err(error) => error.into_response(),
        Ok(()) => match ModelKey::new(request.model_name, request.version) {
            Ok(key) => {
                let outcome = state.cache.unload(&key).await;
                Json(UnloadResponse::from_outcome(outcome)).into_response()
            }
            Err(message) => AppError::BadRequest(message).into_response(),
        },
    };

    finish(&state, "/models/unload", "POST", started, request_id, response).await
}

pub async fn list_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let started = Instant::now();
    let request_id = correlation_id(&headers);

    let models = state.cache.list().await;
    let payload = ModelsListResponse {
        count: models.len(),
        max_capacity: state.cache.capacity(),
        loaded_models: models.iter().map(LoadedModelSummary::from).collect(),
    };
    let response = Json(payload).into_response();

    finish(&state, "/models", "GET", started, request_id, response).await
}

pub async fn predict(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<PredictRequest>,
) -> Response {
    let started = Instant::now();
    let request_id = correlation_id(&headers);

    let response = match state.auth.authenticate(&headers) {
        Err(error) => error.into_response(),
        Ok(()) => {
            let _inflight = state.metrics.inflight_guard();
            match process_predict(&state, name, version, request, started, request_id.clone()).await {
                Ok(response) => Json(response).into_response(),
                Err(error) => error.into_response(),
            }
        }
    };

    finish(&state, "/models/:name/versions/:version/predict", "POST", started, request_id, response).await
}

async fn process_predict(
    state: &AppState,
    name: String,
    version: String,
    request: PredictRequest,
    started: Instant,
    request_id: String,
) -> Result<PredictResponse, AppError> {
    let key = ModelKey::new(name, version).map_err(AppError::BadRequest)?;

    let prediction = match state.cache.predict(&key, request.features.clone()).await {
        Ok(prediction) => prediction,
        Err(CacheError::NotLoaded(_)) => {
            info!(model = %key, "predict miss; attempting one auto-load");
            if let Err(error) = state
                .cache
                .load(key.clone(), state.config.default_batch_size, state.config.default_batch_wait)
                .await
            {
                warn!(model = %key, error = %error, "auto-load failed");
                return Err(AppError::from_cache_error(CacheError::NotLoaded(key)));
            }
            state.cache.predict(&key, request.features.clone()).await.map_err(AppError::from_cache_error)?
        }
        Err(error) => return Err(AppError::from_cache_error(error)),
    };

    let log_record = PendingLog {
        correlation_id: request_id,
        key: key.clone(),
        features: request.features,
        prediction,
        latency_ms: started.elapsed().as_millis() as u64,
        client_addr: None,
        created_at: std::time::SystemTime::now(),
    };
    state.log_pipeline.submit(log_record);

    Ok(PredictResponse { prediction, model_name: key.name().to_owned(), model_version: key.version().to_owned() })
}
