use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, QueryBuilder};
use tokio::sync::{Mutex, Notify};
use tracing::error;

use crate::{metrics::AppMetrics, model_key::ModelKey};

pub const FLUSH_COUNT: usize = 100;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// One durable record of a successful prediction, queued for a bulk insert
/// into the relational store's `prediction_logs` table.
#[derive(Debug, Clone)]
pub struct PendingLog {
    pub correlation_id: String,
    pub key: ModelKey,
    pub features: Vec<f32>,
    pub prediction: i64,
    pub latency_ms: u64,
    pub client_addr: Option<String>,
    pub created_at: SystemTime,
}

/// Sink for a flushed batch of [`PendingLog`] records. Production wires
/// this to the relational store's bulk insert; tests use an in-memory fake,
/// the same trait+fake shape as [`crate::registry::RegistryClient`].
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn insert_batch(&self, records: &[PendingLog]) -> Result<(), String>;
}

#[derive(Debug, Default)]
pub struct InMemoryLogSink {
    rows: Mutex<Vec<PendingLog>>,
}

impl InMemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn rows(&self) -> Vec<PendingLog> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl LogSink for InMemoryLogSink {
    async fn insert_batch(&self, records: &[PendingLog]) -> Result<(), String> {
        self.rows.lock().await.extend_from_slice(records);
        Ok(())
    }
}

/// A sink that always fails, for exercising the failure-handling path:
/// bulk insert failure is logged and the buffer discarded rather than
/// retried indefinitely.
#[derive(Debug, Default)]
pub struct FailingLogSink;

#[async_trait]
impl LogSink for FailingLogSink {
    async fn insert_batch(&self, _records: &[PendingLog]) -> Result<(), String> {
        Err("simulated sink outage".to_owned())
    }
}

/// Sink backed by the `prediction_logs` table of the relational store
/// named in the specification's persisted-state layout. Selected at startup
/// alongside [`crate::registry::SqlRegistryClient`] when `SERVING_REGISTRY_URL`
/// is set; a failed bulk insert is reported up to [`run_worker`]'s existing
/// "log and discard" policy unchanged.
pub struct SqlLogSink {
    pool: PgPool,
}

impl SqlLogSink {
    pub fn connect_lazy(database_url: &str) -> Result<Self, String> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|error| error.to_string())?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl LogSink for SqlLogSink {
    async fn insert_batch(&self, records: &[PendingLog]) -> Result<(), String> {
        if records.is_empty() {
            return Ok(());
        }

        let mut builder = QueryBuilder::new(
            "INSERT INTO prediction_logs (name, version, correlation_id, latency_ms, features_json, prediction, created_at) ",
        );
        builder.push_values(records, |mut row, record| {
            row.push_bind(record.key.name().to_owned())
                .push_bind(record.key.version().to_owned())
                .push_bind(record.correlation_id.clone())
                .push_bind(record.latency_ms as i64)
                .push_bind(features_as_json(&record.features))
                .push_bind(record.prediction)
                .push_bind(chrono::DateTime::<chrono::Utc>::from(record.created_at));
        });

        builder
            .build()
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|error| error.to_string())
    }
}

struct Shared {
    queue: StdMutex<VecDeque<PendingLog>>,
    capacity: usize,
    wake: Notify,
    stopped: Notify,
    stop_requested: AtomicBool,
    dropped: AtomicU64,
    metrics: Arc<AppMetrics>,
}

/// Background batching pipeline: records are enqueued non-blockingly and
/// flushed to the sink either every [`FLUSH_COUNT`] records or every
/// [`FLUSH_INTERVAL`], whichever comes first. The queue is bounded; on
/// overflow the oldest unflushed record is dropped and counted rather than
/// applying backpressure to the request path.
pub struct PredictionLogPipeline {
    shared: Arc<Shared>,
}

impl PredictionLogPipeline {
    pub fn new(sink: Arc<dyn LogSink>, metrics: Arc<AppMetrics>) -> Self {
        Self::with_capacity(sink, metrics, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(sink: Arc<dyn LogSink>, metrics: Arc<AppMetrics>, capacity: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: StdMutex::new(VecDeque::new()),
            capacity,
            wake: Notify::new(),
            stopped: Notify::new(),
            stop_requested: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            metrics: metrics.clone(),
        });
        tokio::spawn(run_worker(shared.clone(), sink, metrics));
        Self { shared }
    }

    /// Idempotent no-op: the drainer task is already running by the time the
    /// pipeline is constructed. Kept as an explicit step so startup code can
    /// treat both process singletons (this and the Model Cache) uniformly.
    pub fn start(&self) {}

    /// Non-blocking enqueue. Never fails observably to the caller; at
    /// capacity the oldest queued record is dropped to make room.
    pub fn submit(&self, record: PendingLog) {
        let mut queue = self.shared.queue.lock().expect("log queue mutex poisoned");
        if queue.len() >= self.shared.capacity {
            queue.pop_front();
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            self.shared.metrics.record_log_drop(1);
        }
        queue.push_back(record);
        drop(queue);
        self.shared.wake.notify_one();
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Signal shutdown, wait for the drainer's final best-effort flush, then
    /// return.
    pub async fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
        self.shared.stopped.notified().await;
    }
}

async fn run_worker(shared: Arc<Shared>, sink: Arc<dyn LogSink>, metrics: Arc<AppMetrics>) {
    let mut buffer: Vec<PendingLog> = Vec::with_capacity(FLUSH_COUNT);
    let mut deadline = tokio::time::Instant::now() + FLUSH_INTERVAL;

    loop {
        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep_until(deadline) => {}
        }

        drain_into(&shared, &mut buffer);

        let interval_elapsed = tokio::time::Instant::now() >= deadline;
        if buffer.len() >= FLUSH_COUNT || (interval_elapsed && !buffer.is_empty()) {
            flush(&sink, &metrics, &mut buffer).await;
            deadline = tokio::time::Instant::now() + FLUSH_INTERVAL;
        }

        if shared.stop_requested.load(Ordering::SeqCst) {
            drain_into(&shared, &mut buffer);
            flush(&sink, &metrics, &mut buffer).await;
            shared.stopped.notify_one();
            return;
        }
    }
}

fn drain_into(shared: &Arc<Shared>, buffer: &mut Vec<PendingLog>) {
    let mut queue = shared.queue.lock().expect("log queue mutex poisoned");
    while buffer.len() < FLUSH_COUNT {
        match queue.pop_front() {
            Some(record) => buffer.push(record),
            None => break,
        }
    }
}

async fn flush(sink: &Arc<dyn LogSink>, metrics: &Arc<AppMetrics>, buffer: &mut Vec<PendingLog>) {
    if buffer.is_empty() {
        return;
    }
    let batch = std::mem::take(buffer);
    let count = batch.len();
    match sink.insert_batch(&batch).await {
        Ok(()) => metrics.record_log_flush(count),
        Err(error) => {
            error!(error = %error, dropped = count, "prediction log bulk insert failed; buffer discarded");
            metrics.record_log_flush_failure(count);
        }
    }
}

/// JSON-friendly view of feature vectors for diagnostics; the relational
/// schema itself lives outside this core (see `prediction_logs` in the
/// external interfaces table).
pub fn features_as_json(features: &[f32]) -> Value {
    Value::Array(features.iter().map(|value| Value::from(*value as f64)).collect())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sample(correlation_id: &str) -> PendingLog {
        PendingLog {
            correlation_id: correlation_id.to_owned(),
            key: ModelKey::new("iris", "v1").unwrap(),
            features: vec![5.1, 3.5, 1.4, 0.2],
            prediction: 0,
            latency_ms: 4,
            client_addr: Some("127.0.0.1".to_owned()),
            created_at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn flush_triggers_at_flush_count() {
        let sink = Arc::new(InMemoryLogSink::new());
        let pipeline = PredictionLogPipeline::new(sink.clone(), Arc::new(AppMetrics::new()));
        pipeline.start();

        for i in 0..FLUSH_COUNT {
            pipeline.submit(sample(&format!("req-{i}")));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sink.rows().await.len(), FLUSH_COUNT);
        pipeline.stop().await;
    }

    #[tokio::test]
    async fn stop_flushes_remaining_buffer_below_flush_count() {
        let sink = Arc::new(InMemoryLogSink::new());
        let pipeline = PredictionLogPipeline::new(sink.clone(), Arc::new(AppMetrics::new()));
        pipeline.start();

        for i in 0..37 {
            pipeline.submit(sample(&format!("req-{i}")));
        }
        pipeline.stop().await;

        assert_eq!(sink.rows().await.len(), 37);
    }

    #[tokio::test]
    async fn failed_flush_is_logged_and_buffer_discarded_not_retried() {
        let sink: Arc<dyn LogSink> = Arc::new(FailingLogSink);
        let pipeline = PredictionLogPipeline::new(sink, Arc::new(AppMetrics::new()));
        pipeline.start();

        for i in 0..5 {
            pipeline.submit(sample(&format!("req-{i}")));
        }
        pipeline.stop().await;
        // No panic, no hang: the worker discarded the buffer and returned.
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts_them() {
        let sink = Arc::new(InMemoryLogSink::new());
        let pipeline = PredictionLogPipeline::with_capacity(sink.clone(), Arc::new(AppMetrics::new()), 2);
        pipeline.start();

        for i in 0..20 {
            pipeline.submit(sample(&format!("req-{i}")));
        }
        pipeline.stop().await;

        assert!(pipeline.dropped_count() > 0);
        assert!(sink.rows().await.len() <= 2);
    }
}
