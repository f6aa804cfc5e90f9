use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("artifact corrupt or framework unsupported: {0}")]
    DeserializationFailure(String),
    #[error("predictor raised during batch inference: {0}")]
    Failed(String),
}

/// Framework-specific wrapper exposing a single vectorized operation.
/// Safe for concurrent read; in practice invoked only from its owning
/// scheduler's single-flight drainer (see [`crate::scheduler::BatchScheduler`]).
pub trait Predictor: Send + Sync {
    fn predict(&self, batch: &[Vec<f32>]) -> Result<Vec<i64>, PredictorError>;
}

/// Decode a deserialized artifact blob into a [`Predictor`] for the given
/// `framework`, the polymorphism point the redesign notes call for: the
/// framework is read from `RegistryRecord.framework` at load time, and an
/// unknown framework is a [`PredictorError::DeserializationFailure`].
pub fn decode_artifact(framework: &str, bytes: &[u8]) -> Result<Arc<dyn Predictor>, PredictorError> {
    match framework {
        "centroid" => {
            let centroids: Vec<Vec<f32>> = serde_json::from_slice(bytes).map_err(|error| {
                PredictorError::DeserializationFailure(format!("invalid centroid artifact: {error}"))
            })?;
            if centroids.is_empty() {
                return Err(PredictorError::DeserializationFailure(
                    "centroid artifact has no classes".to_owned(),
                ));
            }
            Ok(Arc::new(NearestCentroidPredictor { centroids }))
        }
        "echo" => {
            let config: EchoConfig = serde_json::from_slice(bytes).unwrap_or_default();
            Ok(Arc::new(EchoPredictor { modulus: config.modulus.max(1) }))
        }
        other => Err(PredictorError::DeserializationFailure(format!(
            "unsupported framework: {other}"
        ))),
    }
}

/// Deterministic nearest-centroid classifier. Standing in for the
/// scikit-learn artifacts the original training pipeline produces: same
/// shape-in/label-out contract, with a decision rule trivial enough to
/// assert exact predictions in tests.
struct NearestCentroidPredictor {
    centroids: Vec<Vec<f32>>,
}

impl Predictor for NearestCentroidPredictor {
    fn predict(&self, batch: &[Vec<f32>]) -> Result<Vec<i64>, PredictorError> {
        let mut labels = Vec::with_capacity(batch.len());
        for row in batch {
            let mut best_label = 0usize;
            let mut best_distance = f32::MAX;
            for (label, centroid) in self.centroids.iter().enumerate() {
                let distance = squared_distance(row, centroid);
                if distance < best_distance {
                    best_distance = distance;
                    best_label = label;
                }
            }
            labels.push(best_label as i64);
        }
        Ok(labels)
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

#[derive(Debug, Deserialize, Default)]
struct EchoConfig {
    #[serde(default)]
    modulus: i64,
}

/// Minimal predictor for exercising batching mechanics without a realistic
/// decision rule: label = floor(sum(features)) mod `modulus`.
struct EchoPredictor {
    modulus: i64,
}

impl Predictor for EchoPredictor {
    fn predict(&self, batch: &[Vec<f32>]) -> Result<Vec<i64>, PredictorError> {
        Ok(batch
            .iter()
            .map(|row| (row.iter().sum::<f32>() as i64).rem_euclid(self.modulus))
            .collect())
    }
}

/// Standard fixture used across scheduler/cache tests: the classic Iris
/// centroid artifact, scaled so `[5.1, 3.5, 1.4, 0.2]` (setosa) lands on
/// label `0`.
pub fn iris_centroid_artifact() -> Vec<u8> {
    serde_json::to_vec(&vec![
        vec![5.0f32, 3.4, 1.5, 0.2],
        vec![5.9, 2.8, 4.3, 1.3],
        vec![6.6, 3.0, 5.6, 2.1],
    ])
    .expect("iris centroid fixture serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_framework_is_deserialization_failure() {
        let error = decode_artifact("tensorflow-lite-quantized", b"{}").unwrap_err();
        assert!(matches!(error, PredictorError::DeserializationFailure(_)));
    }

    #[test]
    fn centroid_predictor_classifies_standard_iris_sample_as_setosa() {
        let predictor = decode_artifact("centroid", &iris_centroid_artifact()).unwrap();
        let labels = predictor
            .predict(&[vec![5.1, 3.5, 1.4, 0.2]])
            .expect("predict succeeds");
        assert_eq!(labels, vec![0]);
    }

    #[test]
    fn centroid_predictor_batches_multiple_rows_in_order() {
        let predictor = decode_artifact("centroid", &iris_centroid_artifact()).unwrap();
        let labels = predictor
            .predict(&[
                vec![5.1, 3.5, 1.4, 0.2],
                vec![6.7, 3.1, 4.4, 1.4],
                vec![7.2, 3.6, 6.1, 2.5],
            ])
            .expect("predict succeeds");
        assert_eq!(labels, vec![0, 1, 2]);
    }

    #[test]
    fn malformed_centroid_artifact_fails_deserialization() {
        let error = decode_artifact("centroid", b"not json").unwrap_err();
        assert!(matches!(error, PredictorError::DeserializationFailure(_)));
    }
}
