use std::time::Duration;

use prometheus::{
    opts, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct AppMetrics {
    registry: Registry,
    request_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    inflight_requests: IntGauge,
    model_loads_total: IntCounter,
    model_load_failures_total: IntCounter,
    model_load_duration_seconds: HistogramVec,
    model_unloads_total: IntCounter,
    models_loaded: IntGauge,
    cache_hits_total: IntCounter,
    cache_misses_total: IntCounter,
    cache_evictions_total: IntCounter,
    batch_size: HistogramVec,
    predictor_errors_total: IntCounter,
    log_records_flushed_total: IntCounter,
    log_records_dropped_total: IntCounter,
    log_flush_failures_total: IntCounter,
}

pub struct InflightGuard<'a> {
    metrics: &'a AppMetrics,
}

impl AppMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let request_total = IntCounterVec::new(
            opts!("serving_http_requests_total", "Total HTTP requests processed"),
            &["path", "method", "status"],
        )
        .expect("valid request_total metric");

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("serving_http_request_duration_seconds", "HTTP request latency in seconds"),
            &["path", "method"],
        )
        .expect("valid request_duration_seconds metric");

        let inflight_requests = IntGauge::new("serving_inflight_requests", "Current in-flight HTTP requests")
            .expect("valid inflight_requests metric");

        let model_loads_total = IntCounter::new("serving_model_loads_total", "Total successful model loads")
            .expect("valid model_loads_total metric");

        let model_load_failures_total = IntCounter::new(
            "serving_model_load_failures_total",
            "Total model load attempts that ended in RegistryMissing or LoadFailure",
        )
        .expect("valid model_load_failures_total metric");

        let model_load_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "serving_model_load_duration_seconds",
                "Time spent downloading and deserializing a model artifact",
            ),
            &["framework"],
        )
        .expect("valid model_load_duration_seconds metric");

        let model_unloads_total = IntCounter::new("serving_model_unloads_total", "Total explicit unload calls that found a resident entry")
            .expect("valid model_unloads_total metric");

        let models_loaded = IntGauge::new("serving_models_loaded", "Number of models currently resident in the cache")
            .expect("valid models_loaded metric");

        let cache_hits_total = IntCounter::new("serving_cache_hits_total", "Predict calls served by an already-resident model")
            .expect("valid cache_hits_total metric");

        let cache_misses_total = IntCounter::new("serving_cache_misses_total", "Predict calls that required an auto-load")
            .expect("valid cache_misses_total metric");

        let cache_evictions_total = IntCounter::new("serving_cache_evictions_total", "Total LRU evictions")
            .expect("valid cache_evictions_total metric");

        let batch_size = HistogramVec::new(
            HistogramOpts::new("serving_batch_size", "Number of rows coalesced into one predictor.predict call")
                .buckets(vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0]),
            &["model"],
        )
        .expect("valid batch_size metric");

        let predictor_errors_total = IntCounter::new("serving_predictor_errors_total", "Total PredictorFailure outcomes")
            .expect("valid predictor_errors_total metric");

        let log_records_flushed_total = IntCounter::new("serving_log_records_flushed_total", "Prediction log records successfully bulk-inserted")
            .expect("valid log_records_flushed_total metric");

        let log_records_dropped_total = IntCounter::new(
            "serving_log_records_dropped_total",
            "Prediction log records dropped by the overflow policy or a failed final flush",
        )
        .expect("valid log_records_dropped_total metric");

        let log_flush_failures_total = IntCounter::new("serving_log_flush_failures_total", "Bulk insert attempts that failed")
            .expect("valid log_flush_failures_total metric");

        registry.register(Box::new(request_total.clone())).expect("register request_total");
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .expect("register request_duration_seconds");
        registry.register(Box::new(inflight_requests.clone())).expect("register inflight_requests");
        registry.register(Box::new(model_loads_total.clone())).expect("register model_loads_total");
        registry
            .register(Box::new(model_load_failures_total.clone()))
            .expect("register model_load_failures_total");
        registry
            .register(Box::new(model_load_duration_seconds.clone()))
            .expect("register model_load_duration_seconds");
        registry.register(Box::new(model_unloads_total.clone())).expect("register model_unloads_total");
        registry.register(Box::new(models_loaded.clone())).expect("register models_loaded");
        registry.register(Box::new(cache_hits_total.clone())).expect("register cache_hits_total");
        registry.register(Box::new(cache_misses_total.clone())).expect("register cache_misses_total");
        registry.register(Box::new(cache_evictions_total.clone())).expect("register cache_evictions_total");
        registry.register(Box::new(batch_size.clone())).expect("register batch_size");
        registry
            .register(Box::new(predictor_errors_total.clone()))
            .expect("register predictor_errors_total");
        registry
            .register(Box::new(log_records_flushed_total.clone()))
            .expect("register log_records_flushed_total");
        registry
            .register(Box::new(log_records_dropped_total.clone()))
            .expect("register log_records_dropped_total");
        registry
            .register(Box::new(log_flush_failures_total.clone()))
            .expect("register log_flush_failures_total");

        Self {
            registry,
            request_total,
            request_duration_seconds,
            inflight_requests,
            model_loads_total,
            model_load_failures_total,
            model_load_duration_seconds,
            model_unloads_total,
            models_loaded,
            cache_hits_total,
            cache_misses_total,
            cache_evictions_total,
            batch_size,
            predictor_errors_total,
            log_records_flushed_total,
            log_records_dropped_total,
            log_flush_failures_total,
        }
    }

    pub fn inflight_guard(&self) -> InflightGuard<'_> {
        self.inflight_requests.inc();
        InflightGuard { metrics: self }
    }

    pub fn observe_request(&self, path: &str, method: &str, status: u16, duration: Duration) {
        let status_label = status.to_string();
        self.request_total.with_label_values(&[path, method, &status_label]).inc();
        self.request_duration_seconds.with_label_values(&[path, method]).observe(duration.as_secs_f64());
    }

    pub fn record_model_load(&self, framework: &str, duration: Duration) {
        self.model_loads_total.inc();
        self.model_load_duration_seconds.with_label_values(&[framework]).observe(duration.as_secs_f64());
    }

    pub fn record_model_load_failure(&self) {
        self.model_load_failures_total.inc();
    }

    pub fn record_model_unload(&self) {
        self.model_unloads_total.inc();
    }

    pub fn set_models_loaded(&self, count: usize) {
        self.models_loaded.set(count as i64);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits_total.inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses_total.inc();
    }

    pub fn record_eviction(&self) {
        self.cache_evictions_total.inc();
    }

    pub fn record_batch(&self, model: &str, size: usize) {
        self.batch_size.with_label_values(&[model]).observe(size as f64);
    }

    pub fn record_predictor_error(&self) {
        self.predictor_errors_total.inc();
    }

    pub fn record_log_flush(&self, flushed: usize) {
        self.log_records_flushed_total.inc_by(flushed as u64);
    }

    pub fn record_log_flush_failure(&self, lost: usize) {
        self.log_flush_failures_total.inc();
        self.log_records_dropped_total.inc_by(lost as u64);
    }

    pub fn record_log_drop(&self, dropped: usize) {
        self.log_records_dropped_total.inc_by(dropped as u64);
    }

    pub fn render(&self) -> Result<String, String> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode(&families, &mut buffer).map_err(|error| error.to_string())?;
        String::from_utf8(buffer).map_err(|error| error.to_string())
    }
}

impl Default for AppMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.inflight_requests.dec();
    }
}
