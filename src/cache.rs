use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use crate::{
    blob::{BlobError, BlobStore},
    metrics::AppMetrics,
    model_key::ModelKey,
    predictor::{decode_artifact, PredictorError},
    registry::{RegistryClient, RegistryError},
    scheduler::{BatchScheduler, SchedulerConfig, SchedulerError},
};

#[derive(Debug, Error, Clone)]
pub enum CacheError {
    #[error("no such model registered: {0}")]
    RegistryMissing(ModelKey),
    #[error("model artifact could not be loaded: {0}")]
    LoadFailure(String),
    #[error("model not resident: {0}")]
    NotLoaded(ModelKey),
    #[error("predictor raised: {0}")]
    PredictorFailure(String),
    #[error("scheduler for {0} is shutting down")]
    Shutdown(ModelKey),
    #[error("request was cancelled before delivery")]
    Cancelled,
}

impl CacheError {
    fn from_scheduler_error(key: &ModelKey, error: SchedulerError) -> Self {
        match error {
            SchedulerError::PredictorFailure(message) => CacheError::PredictorFailure(message),
            SchedulerError::Shutdown => CacheError::Shutdown(key.clone()),
            SchedulerError::Cancelled => CacheError::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Loaded,
    AlreadyLoaded,
}

#[derive(Debug, Clone, Copy)]
pub struct LoadOutcome {
    pub status: LoadStatus,
    pub cache_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadStatus {
    Unloaded,
    NotLoaded,
}

#[derive(Debug, Clone, Copy)]
pub struct UnloadOutcome {
    pub status: UnloadStatus,
    pub cache_size: usize,
}

/// Resident-model descriptor returned by [`ModelCache::list`]; does not
/// expose the scheduler or predictor handles themselves.
#[derive(Debug, Clone)]
pub struct ResidentDescriptor {
    pub key: ModelKey,
    pub framework: String,
    pub metadata: Value,
    pub loaded_at: SystemTime,
    pub last_used_at: SystemTime,
}

struct CacheEntry {
    framework: String,
    metadata: Value,
    scheduler: BatchScheduler,
    loaded_at: SystemTime,
    last_used_at: SystemTime,
}

/// Coordinates concurrent loaders of the same key so exactly one of them
/// performs the download and deserialization; the rest observe the result.
struct InProgress {
    waiters: Vec<oneshot::Sender<Result<(), CacheError>>>,
}

struct State {
    entries: IndexMap<ModelKey, CacheEntry>,
    in_progress: HashMap<ModelKey, InProgress>,
}

/// Bounded multi-model cache with strict LRU eviction and single-flight
/// loading. The [`IndexMap`]'s own element order doubles as the LRU order:
/// every touch moves a key to the back, so the front is always the
/// least-recently-used entry, which is exactly the §4.2 tie-break rule
/// (smallest `last_used_at`, ties by insertion order) without tracking a
/// separate ordering key.
pub struct ModelCache {
    capacity: usize,
    registry: Arc<dyn RegistryClient>,
    blob_store: Arc<dyn BlobStore>,
    metrics: Arc<AppMetrics>,
    state: Mutex<State>,
}

impl ModelCache {
    pub fn new(
        capacity: usize,
        registry: Arc<dyn RegistryClient>,
        blob_store: Arc<dyn BlobStore>,
        metrics: Arc<AppMetrics>,
    ) -> Self {
        assert!(capacity >= 1, "cache capacity must be at least 1");
        Self {
            capacity,
            registry,
            blob_store,
            metrics,
            state: Mutex::new(State {
                entries: IndexMap::new(),
                in_progress: HashMap::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn load(
        &self,
        key: ModelKey,
        batch_size: usize,
        max_wait: Duration,
    ) -> Result<LoadOutcome, CacheError> {
        // Fast path: already resident. Touch to MRU and return without
        // reconfiguring the scheduler (open question: the source ignores a
        // changed batch_size/batch_wait_ms on re-load; this follows suit).
        {
            let mut state = self.state.lock().await;
            if state.entries.contains_key(&key) {
                touch(&mut state.entries, &key);
                let cache_size = state.entries.len();
                return Ok(LoadOutcome { status: LoadStatus::AlreadyLoaded, cache_size });
            }
        }

        let mut rx = None;
        {
            let mut state = self.state.lock().await;
            // Re-check under the lock: another loader may have finished
            // between the fast path above and here.
            if state.entries.contains_key(&key) {
                touch(&mut state.entries, &key);
                let cache_size = state.entries.len();
                return Ok(LoadOutcome { status: LoadStatus::AlreadyLoaded, cache_size });
            }
            if let Some(in_progress) = state.in_progress.get_mut(&key) {
                let (tx, waiter_rx) = oneshot::channel();
                in_progress.waiters.push(tx);
                rx = Some(waiter_rx);
            } else {
                state.in_progress.insert(key.clone(), InProgress { waiters: Vec::new() });
            }
        }

        if let Some(rx) = rx {
            rx.await.unwrap_or(Err(CacheError::Cancelled))?;
            let mut state = self.state.lock().await;
            touch(&mut state.entries, &key);
            let cache_size = state.entries.len();
            return Ok(LoadOutcome { status: LoadStatus::AlreadyLoaded, cache_size });
        }

        self.load_as_leader(key, batch_size, max_wait).await
    }

    async fn load_as_leader(
        &self,
        key: ModelKey,
        batch_size: usize,
        max_wait: Duration,
    ) -> Result<LoadOutcome, CacheError> {
        let result = self.fetch_and_build(&key, batch_size, max_wait).await;

        let waiters = {
            let mut state = self.state.lock().await;
            state.in_progress.remove(&key).map(|marker| marker.waiters).unwrap_or_default()
        };

        match result {
            Ok(entry) => {
                let evicted = {
                    let mut state = self.state.lock().await;
                    let evicted = if state.entries.len() >= self.capacity {
                        evict_lru(&mut state.entries)
                    } else {
                        None
                    };
                    state.entries.insert(key.clone(), entry);
                    evicted
                };

                if let Some((evicted_key, evicted_entry)) = evicted {
                    info!(model = %evicted_key, "evicting least-recently-used model to make room");
                    evicted_entry.scheduler.close().await;
                    self.metrics.record_eviction();
                }

                let cache_size = self.state.lock().await.entries.len();
                self.metrics.set_models_loaded(cache_size);
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                Ok(LoadOutcome { status: LoadStatus::Loaded, cache_size })
            }
            Err(error) => {
                self.metrics.record_model_load_failure();
                for waiter in waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                Err(error)
            }
        }
    }

    async fn fetch_and_build(
        &self,
        key: &ModelKey,
        batch_size: usize,
        max_wait: Duration,
    ) -> Result<CacheEntry, CacheError> {
        let record = self
            .registry
            .lookup(key)
            .await
            .map_err(|RegistryError::Unavailable(message)| CacheError::LoadFailure(message))?
            .ok_or_else(|| CacheError::RegistryMissing(key.clone()))?;

        let started = Instant::now();
        let bytes = self.blob_store.get(&record.artifact_key).await.map_err(|error| match error {
            BlobError::NotFound(artifact) => CacheError::LoadFailure(format!("artifact not found: {artifact}")),
            BlobError::Unavailable(message) => CacheError::LoadFailure(message),
        })?;

        let predictor = decode_artifact(&record.framework, &bytes).map_err(|error| match error {
            PredictorError::DeserializationFailure(message) => CacheError::LoadFailure(message),
            PredictorError::Failed(message) => CacheError::LoadFailure(message),
        })?;

        self.metrics.record_model_load(&record.framework, started.elapsed());

        let scheduler = BatchScheduler::with_metrics(
            predictor,
            SchedulerConfig::new(batch_size, max_wait),
            self.metrics.clone(),
            key.to_string(),
        );
        let now = SystemTime::now();
        Ok(CacheEntry {
            framework: record.framework,
            metadata: record.metadata,
            scheduler,
            loaded_at: now,
            last_used_at: now,
        })
    }

    pub async fn unload(&self, key: &ModelKey) -> UnloadOutcome {
        let removed = {
            let mut state = self.state.lock().await;
            state.entries.shift_remove(key)
        };

        match removed {
            Some(entry) => {
                entry.scheduler.close().await;
                self.metrics.record_model_unload();
                let cache_size = self.state.lock().await.entries.len();
                self.metrics.set_models_loaded(cache_size);
                UnloadOutcome { status: UnloadStatus::Unloaded, cache_size }
            }
            None => {
                let cache_size = self.state.lock().await.entries.len();
                UnloadOutcome { status: UnloadStatus::NotLoaded, cache_size }
            }
        }
    }

    pub async fn predict(&self, key: &ModelKey, features: Vec<f32>) -> Result<i64, CacheError> {
        let scheduler = {
            let mut state = self.state.lock().await;
            match state.entries.get_mut(key) {
                Some(entry) => {
                    entry.last_used_at = SystemTime::now();
                    let scheduler = entry.scheduler.clone();
                    touch(&mut state.entries, key);
                    self.metrics.record_cache_hit();
                    scheduler
                }
                None => {
                    self.metrics.record_cache_miss();
                    return Err(CacheError::NotLoaded(key.clone()));
                }
            }
        };

        scheduler.submit(features).await.map_err(|error| {
            if matches!(error, SchedulerError::PredictorFailure(_)) {
                self.metrics.record_predictor_error();
            }
            CacheError::from_scheduler_error(key, error)
        })
    }

    pub async fn list(&self) -> Vec<ResidentDescriptor> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .map(|(key, entry)| ResidentDescriptor {
                key: key.clone(),
                framework: entry.framework.clone(),
                metadata: entry.metadata.clone(),
                loaded_at: entry.loaded_at,
                last_used_at: entry.last_used_at,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    /// Best-effort teardown of every resident scheduler, used at process
    /// shutdown alongside the log pipeline's `stop()`.
    pub async fn close_all(&self) {
        let entries = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.entries)
        };
        for (key, entry) in entries {
            entry.scheduler.close().await;
            warn!(model = %key, "closed resident scheduler during shutdown");
        }
    }
}

fn touch(entries: &mut IndexMap<ModelKey, CacheEntry>, key: &ModelKey) {
    if let Some(index) = entries.get_index_of(key) {
        let last = entries.len() - 1;
        entries.move_index(index, last);
    }
}

fn evict_lru(entries: &mut IndexMap<ModelKey, CacheEntry>) -> Option<(ModelKey, CacheEntry)> {
    if entries.is_empty() {
        None
    } else {
        entries.shift_remove_index(0)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use super::*;
    use crate::{
        blob::InMemoryBlobStore,
        registry::{InMemoryRegistry, RegistryRecord},
    };

    async fn seeded(capacity: usize) -> (ModelCache, StdArc<InMemoryRegistry>, StdArc<InMemoryBlobStore>) {
        let registry = StdArc::new(InMemoryRegistry::new());
        let blob_store = StdArc::new(InMemoryBlobStore::new());
        let cache = ModelCache::new(capacity, registry.clone(), blob_store.clone(), Arc::new(AppMetrics::new()));
        (cache, registry, blob_store)
    }

    async fn register_echo(registry: &InMemoryRegistry, blob_store: &InMemoryBlobStore, key: &ModelKey) {
        let artifact_key = format!("models/{key}.json");
        registry
            .register(RegistryRecord {
                key: key.clone(),
                artifact_key: artifact_key.clone(),
                framework: "echo".to_owned(),
                metadata: serde_json::json!({}),
            })
            .await;
        blob_store.put(artifact_key, b"{}".to_vec()).await;
    }

    #[tokio::test]
    async fn lru_evicts_the_least_recently_touched_entry() {
        let (cache, registry, blob_store) = seeded(2).await;
        let a = ModelKey::new("a", "v1").unwrap();
        let b = ModelKey::new("b", "v1").unwrap();
        let c = ModelKey::new("c", "v1").unwrap();
        let d = ModelKey::new("d", "v1").unwrap();
        for key in [&a, &b, &c, &d] {
            register_echo(&registry, &blob_store, key).await;
        }

        cache.load(a.clone(), 1, Duration::from_millis(5)).await.unwrap();
        cache.load(b.clone(), 1, Duration::from_millis(5)).await.unwrap();
        cache.load(c.clone(), 1, Duration::from_millis(5)).await.unwrap();

        let resident: Vec<_> = cache.list().await.into_iter().map(|d| d.key).collect();
        assert_eq!(resident.len(), 2);
        assert!(!resident.contains(&a));
        assert!(resident.contains(&b));
        assert!(resident.contains(&c));

        cache.predict(&b, vec![1.0]).await.unwrap();
        cache.load(d.clone(), 1, Duration::from_millis(5)).await.unwrap();

        let resident: Vec<_> = cache.list().await.into_iter().map(|d| d.key).collect();
        assert!(!resident.contains(&c));
        assert!(resident.contains(&b));
        assert!(resident.contains(&d));
    }

    #[tokio::test]
    async fn concurrent_loads_of_the_same_key_share_one_fetch() {
        let registry = StdArc::new(InMemoryRegistry::new());
        let blob_store = StdArc::new(InMemoryBlobStore::with_delay(Duration::from_millis(100)));
        let cache = StdArc::new(ModelCache::new(5, registry.clone(), blob_store.clone(), Arc::new(AppMetrics::new())));
        let key = ModelKey::new("x", "v1").unwrap();
        register_echo(&registry, &blob_store, &key).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = cache.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move { cache.load(key, 1, Duration::from_millis(5)).await }));
        }

        let mut loaded = 0;
        let mut already_loaded = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap().status {
                LoadStatus::Loaded => loaded += 1,
                LoadStatus::AlreadyLoaded => already_loaded += 1,
            }
        }

        assert_eq!(loaded, 1);
        assert_eq!(already_loaded, 9);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn predict_on_unregistered_key_is_not_loaded() {
        let (cache, _registry, _blob_store) = seeded(5).await;
        let key = ModelKey::new("missing", "v1").unwrap();
        let error = cache.predict(&key, vec![1.0]).await.unwrap_err();
        assert!(matches!(error, CacheError::NotLoaded(_)));
    }

    #[tokio::test]
    async fn load_of_unregistered_key_is_registry_missing_and_does_not_grow_the_cache() {
        let (cache, _registry, _blob_store) = seeded(5).await;
        let key = ModelKey::new("missing", "v1").unwrap();
        let error = cache.load(key, 1, Duration::from_millis(5)).await.unwrap_err();
        assert!(matches!(error, CacheError::RegistryMissing(_)));
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn already_loaded_touches_recency_without_reconfiguring_the_scheduler() {
        let (cache, registry, blob_store) = seeded(2).await;
        let key = ModelKey::new("iris", "v1").unwrap();
        register_echo(&registry, &blob_store, &key).await;

        let first = cache.load(key.clone(), 1, Duration::from_millis(5)).await.unwrap();
        assert_eq!(first.status, LoadStatus::Loaded);
        let second = cache.load(key.clone(), 64, Duration::from_millis(500)).await.unwrap();
        assert_eq!(second.status, LoadStatus::AlreadyLoaded);
        assert_eq!(second.cache_size, 1);
    }

    #[tokio::test]
    async fn predict_succeeds_once_the_model_has_been_loaded() {
        let (cache, registry, blob_store) = seeded(5).await;
        let key = ModelKey::new("iris", "v1").unwrap();
        register_echo(&registry, &blob_store, &key).await;
        assert_eq!(cache.len().await, 0);

        cache.load(key.clone(), 1, Duration::from_millis(5)).await.unwrap();
        let prediction = cache.predict(&key, vec![1.0, 1.0]).await.unwrap();
        assert_eq!(prediction, 0);
        assert_eq!(cache.len().await, 1);
    }
}
