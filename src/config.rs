use std::{env, time::Duration};

/// Process-wide serving configuration, assembled once at startup from the
/// environment (§6). Every field is optional with a documented default;
/// nothing here is fatal to read, matching the teacher's `BatchConfig`/
/// `RateLimiter` `from_env()` shape.
#[derive(Debug, Clone)]
pub struct ServingConfig {
    pub max_resident_models: usize,
    pub default_batch_size: usize,
    pub default_batch_wait: Duration,
    pub log_queue_capacity: usize,
    /// Connection string for the relational store backing `model_metadata`
    /// and `prediction_logs` (§6). `None` selects the in-memory fakes.
    pub registry_url: Option<String>,
}

impl ServingConfig {
    pub fn from_env() -> Self {
        let max_resident_models = env::var("SERVING_MAX_RESIDENT_MODELS")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(5);

        let default_batch_size = env::var("SERVING_DEFAULT_BATCH_SIZE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(32);

        let default_batch_wait_ms = env::var("SERVING_DEFAULT_BATCH_WAIT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(50);

        let log_queue_capacity = env::var("SERVING_LOG_QUEUE_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(crate::log_pipeline::DEFAULT_QUEUE_CAPACITY);

        let registry_url = env::var("SERVING_REGISTRY_URL").ok().filter(|value| !value.trim().is_empty());

        Self {
            max_resident_models,
            default_batch_size,
            default_batch_wait: Duration::from_millis(default_batch_wait_ms),
            log_queue_capacity,
            registry_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values_when_env_is_unset() {
        // Run in isolation: relies on the ambient env not setting these.
        let config = ServingConfig::from_env();
        assert!(config.max_resident_models >= 1);
        assert!(config.default_batch_size >= 1);
    }
}
