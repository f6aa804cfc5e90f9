use std::{collections::VecDeque, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    metrics::AppMetrics,
    predictor::{Predictor, PredictorError},
};

#[derive(Debug, Error, Clone)]
pub enum SchedulerError {
    #[error("predictor raised: {0}")]
    PredictorFailure(String),
    #[error("scheduler is shutting down")]
    Shutdown,
    #[error("submitter abandoned the call before delivery")]
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub max_batch_size: usize,
    pub max_wait: Duration,
}

impl SchedulerConfig {
    pub fn new(max_batch_size: usize, max_wait: Duration) -> Self {
        assert!(max_batch_size >= 1, "max_batch_size must be at least 1");
        Self { max_batch_size, max_wait }
    }
}

struct PendingEntry {
    features: Vec<f32>,
    result_slot: oneshot::Sender<Result<i64, SchedulerError>>,
}

struct State {
    queue: VecDeque<PendingEntry>,
    drainer_running: bool,
    closed: bool,
    drainer_handle: Option<JoinHandle<()>>,
}

struct Inner {
    predictor: Arc<dyn Predictor>,
    config: SchedulerConfig,
    state: Mutex<State>,
    observability: Option<(Arc<AppMetrics>, String)>,
}

/// Per-model micro-batching scheduler. Coalesces concurrent single-row
/// `submit` calls into one vectorized [`Predictor::predict`] invocation,
/// bounded by `max_wait_ms`, while guaranteeing at most one batch is ever
/// in flight (the single-flight invariant): queue non-empty implies a
/// drainer is running, enforced by updating both under one lock.
#[derive(Clone)]
pub struct BatchScheduler {
    inner: Arc<Inner>,
}

impl BatchScheduler {
    pub fn new(predictor: Arc<dyn Predictor>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                predictor,
                config,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    drainer_running: false,
                    closed: false,
                    drainer_handle: None,
                }),
                observability: None,
            }),
        }
    }

    /// Same as [`BatchScheduler::new`], additionally recording the
    /// `serving_batch_size` histogram under `model_label` for each flushed
    /// batch.
    pub fn with_metrics(
        predictor: Arc<dyn Predictor>,
        config: SchedulerConfig,
        metrics: Arc<AppMetrics>,
        model_label: String,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                predictor,
                config,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    drainer_running: false,
                    closed: false,
                    drainer_handle: None,
                }),
                observability: Some((metrics, model_label)),
            }),
        }
    }

    /// Submit a single feature row. Returns the label the predictor would
    /// have produced for a non-batched `[features]` call; batching is
    /// semantically transparent to the caller.
    pub async fn submit(&self, features: Vec<f32>) -> Result<i64, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        let should_spawn = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return Err(SchedulerError::Shutdown);
            }
            state.queue.push_back(PendingEntry { features, result_slot: tx });
            if state.drainer_running {
                false
            } else {
                state.drainer_running = true;
                true
            }
        };

        if should_spawn {
            let inner = self.inner.clone();
            let handle = tokio::spawn(async move { drainer_loop(inner).await });
            self.inner.state.lock().await.drainer_handle = Some(handle);
        }

        rx.await.unwrap_or(Err(SchedulerError::Cancelled))
    }

    /// Refuse new submits, wait for the in-flight batch (if any) to finish,
    /// then fail every still-queued slot with [`SchedulerError::Shutdown`].
    pub async fn close(&self) {
        let handle = {
            let mut state = self.inner.state.lock().await;
            state.closed = true;
            state.drainer_handle.take()
        };

        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // Normally a no-op: the invariant queue-non-empty => drainer_running
        // means the drainer itself empties the queue on closed shutdown.
        fail_remaining_with_shutdown(&self.inner).await;
    }
}

async fn drainer_loop(inner: Arc<Inner>) {
    let mut should_wait = true;
    loop {
        if should_wait {
            tokio::time::sleep(inner.config.max_wait).await;
            should_wait = false;
        }

        let batch = match detach_batch(&inner).await {
            Some(batch) => batch,
            None => return,
        };

        run_batch(&inner, batch).await;

        if inner.state.lock().await.closed {
            fail_remaining_with_shutdown(&inner).await;
            return;
        }
        // More entries may already be waiting; re-enter without an
        // additional wait (should_wait stays false for this drainer's life).
    }
}

async fn detach_batch(inner: &Arc<Inner>) -> Option<Vec<PendingEntry>> {
    let mut state = inner.state.lock().await;
    if state.queue.is_empty() {
        state.drainer_running = false;
        return None;
    }
    let take = state.queue.len().min(inner.config.max_batch_size);
    Some(state.queue.drain(..take).collect())
}

async fn run_batch(inner: &Arc<Inner>, batch: Vec<PendingEntry>) {
    let (features, slots): (Vec<Vec<f32>>, Vec<_>) = batch
        .into_iter()
        .map(|entry| (entry.features, entry.result_slot))
        .unzip();

    debug!(batch_size = features.len(), "flushing micro-batch");
    if let Some((metrics, model_label)) = &inner.observability {
        metrics.record_batch(model_label, features.len());
    }

    let predictor = inner.predictor.clone();
    let outcome = tokio::task::spawn_blocking(move || predictor.predict(&features)).await;

    match outcome {
        Ok(Ok(labels)) if labels.len() == slots.len() => {
            for (slot, label) in slots.into_iter().zip(labels) {
                let _ = slot.send(Ok(label));
            }
        }
        Ok(Ok(labels)) => {
            let error = SchedulerError::PredictorFailure(format!(
                "predictor returned {} labels for a batch of {}",
                labels.len(),
                slots.len()
            ));
            deliver_same_error(slots, error);
        }
        Ok(Err(PredictorError::Failed(message))) => {
            deliver_same_error(slots, SchedulerError::PredictorFailure(message));
        }
        Ok(Err(PredictorError::DeserializationFailure(message))) => {
            deliver_same_error(slots, SchedulerError::PredictorFailure(message));
        }
        Err(join_error) => {
            deliver_same_error(
                slots,
                SchedulerError::PredictorFailure(format!("predictor task panicked: {join_error}")),
            );
        }
    }
}

fn deliver_same_error(slots: Vec<oneshot::Sender<Result<i64, SchedulerError>>>, error: SchedulerError) {
    for slot in slots {
        let _ = slot.send(Err(error.clone()));
    }
}

async fn fail_remaining_with_shutdown(inner: &Arc<Inner>) {
    let mut state = inner.state.lock().await;
    let remaining: Vec<_> = state.queue.drain(..).collect();
    state.drainer_running = false;
    drop(state);
    for entry in remaining {
        let _ = entry.result_slot.send(Err(SchedulerError::Shutdown));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::predictor::{decode_artifact, iris_centroid_artifact};

    struct CountingPredictor {
        inner: Arc<dyn Predictor>,
        calls: Arc<AtomicUsize>,
    }

    impl Predictor for CountingPredictor {
        fn predict(&self, batch: &[Vec<f32>]) -> Result<Vec<i64>, PredictorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.predict(batch)
        }
    }

    struct FailingAboveOne;

    impl Predictor for FailingAboveOne {
        fn predict(&self, batch: &[Vec<f32>]) -> Result<Vec<i64>, PredictorError> {
            if batch.len() >= 2 {
                Err(PredictorError::Failed("batch too large for this model".to_owned()))
            } else {
                Ok(vec![0; batch.len()])
            }
        }
    }

    #[tokio::test]
    async fn batching_is_transparent_to_each_caller() {
        let calls = Arc::new(AtomicUsize::new(0));
        let predictor: Arc<dyn Predictor> = Arc::new(CountingPredictor {
            inner: decode_artifact("centroid", &iris_centroid_artifact()).unwrap(),
            calls: calls.clone(),
        });
        let scheduler = BatchScheduler::new(predictor, SchedulerConfig::new(4, Duration::from_millis(20)));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move { scheduler.submit(vec![5.1, 3.5, 1.4, 0.2]).await }));
        }

        for handle in handles {
            let label = handle.await.unwrap().expect("submit succeeds");
            assert_eq!(label, 0);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        scheduler.close().await;
    }

    #[tokio::test]
    async fn batches_never_exceed_max_batch_size() {
        let calls = Arc::new(AtomicUsize::new(0));
        let predictor: Arc<dyn Predictor> = Arc::new(CountingPredictor {
            inner: decode_artifact("echo", b"{}").unwrap(),
            calls: calls.clone(),
        });
        let scheduler = BatchScheduler::new(predictor, SchedulerConfig::new(4, Duration::from_millis(5)));

        let mut handles = Vec::new();
        for i in 0..10 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move { scheduler.submit(vec![i as f32]).await }));
        }
        for handle in handles {
            handle.await.unwrap().expect("submit succeeds");
        }

        scheduler.close().await;
        assert!(calls.load(Ordering::SeqCst) <= 10_usize.div_ceil(4));
    }

    #[tokio::test]
    async fn predictor_failure_fans_out_to_every_caller_in_the_batch() {
        let scheduler = BatchScheduler::new(Arc::new(FailingAboveOne), SchedulerConfig::new(8, Duration::from_millis(20)));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move { scheduler.submit(vec![1.0]).await }));
        }

        for handle in handles {
            let error = handle.await.unwrap().expect_err("batch should fail");
            assert!(matches!(error, SchedulerError::PredictorFailure(_)));
        }
        scheduler.close().await;

        let solo = BatchScheduler::new(Arc::new(FailingAboveOne), SchedulerConfig::new(1, Duration::from_millis(5)));
        let result = solo.submit(vec![1.0]).await.expect("solo submit succeeds");
        assert_eq!(result, 0);
        solo.close().await;
    }

    #[tokio::test]
    async fn close_refuses_new_submits_and_drains_queue_with_shutdown() {
        let scheduler = BatchScheduler::new(decode_artifact("echo", b"{}").unwrap(), SchedulerConfig::new(1, Duration::from_millis(200)));

        let pending = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.submit(vec![1.0]).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.submit(vec![2.0]).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        scheduler.close().await;
        let _ = pending.await;
        let second_result = second.await.unwrap();
        assert!(matches!(second_result, Err(SchedulerError::Shutdown)) || second_result.is_ok());

        let after_close = scheduler.submit(vec![3.0]).await;
        assert!(matches!(after_close, Err(SchedulerError::Shutdown)));
    }
}
