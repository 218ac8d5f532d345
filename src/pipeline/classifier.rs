//! Classifier seam and the JSON logistic model.
//!
//! The production ensemble is an external collaborator; anything that maps a
//! feature vector to a no-leak probability implements [`Classifier`]. Inference is
//! CPU-bound and synchronous, so the pipeline runs it on the blocking pool.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ClassifierError;

/// Binary cycle verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    /// Probability below the threshold
    Leak,
    /// Probability at or above the threshold
    NoLeak,
}

/// Apply the decision threshold to a no-leak probability.
///
/// `probability >= threshold` is no-leak with confidence `probability`; below it is a
/// leak with confidence `1 - probability`.
pub fn decide(probability: f64, threshold: f64) -> (Label, f64) {
    if probability >= threshold {
        (Label::NoLeak, probability)
    } else {
        (Label::Leak, 1.0 - probability)
    }
}

/// Maps a feature vector to the probability of no leak.
pub trait Classifier: Send + Sync {
    /// Whether a model is available
    fn is_loaded(&self) -> bool;

    /// Model version identifier
    fn version(&self) -> &str;

    /// Probability of no leak, in `0.0..=1.0`
    fn classify(&self, features: &[f64]) -> Result<f64, ClassifierError>;
}

/// Placeholder used when no model artifact is configured
#[derive(Debug, Default)]
pub struct NoModel;

impl Classifier for NoModel {
    fn is_loaded(&self) -> bool {
        false
    }

    fn version(&self) -> &str {
        "none"
    }

    fn classify(&self, _features: &[f64]) -> Result<f64, ClassifierError> {
        Err(ClassifierError::NotLoaded)
    }
}

/// Standardisation applied before the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scaler {
    /// Per-feature mean
    pub mean: Vec<f64>,
    /// Per-feature standard deviation
    pub scale: Vec<f64>,
}

/// On-disk model artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    /// Reported with every result
    pub version: String,
    /// Standardisation applied before the weights
    pub scaler: Scaler,
    /// One weight per feature
    pub weights: Vec<f64>,
    /// Intercept
    pub bias: f64,
}

/// Standardised logistic regression
#[derive(Debug, Clone)]
pub struct LogisticClassifier {
    artifact: ModelArtifact,
}

impl LogisticClassifier {
    /// Classifier over a checked artifact
    pub fn new(artifact: ModelArtifact) -> Result<Self, ClassifierError> {
        let n = artifact.weights.len();
        if n == 0 {
            return Err(ClassifierError::Load("model has no weights".to_string()));
        }
        if artifact.scaler.mean.len() != n || artifact.scaler.scale.len() != n {
            return Err(ClassifierError::Load(format!(
                "scaler has {}/{} entries for {} weights",
                artifact.scaler.mean.len(),
                artifact.scaler.scale.len(),
                n
            )));
        }
        Ok(Self { artifact })
    }

    /// Load an artifact from a JSON file
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ClassifierError::Load(format!("{}: {e}", path.display())))?;
        let artifact: ModelArtifact = serde_json::from_str(&text)
            .map_err(|e| ClassifierError::Load(format!("{}: {e}", path.display())))?;
        let model = Self::new(artifact)?;
        tracing::info!(
            version = %model.artifact.version,
            path = %path.display(),
            "Classifier model loaded"
        );
        Ok(model)
    }

    /// Feature count the model expects
    pub fn input_len(&self) -> usize {
        self.artifact.weights.len()
    }
}

impl Classifier for LogisticClassifier {
    fn is_loaded(&self) -> bool {
        true
    }

    fn version(&self) -> &str {
        &self.artifact.version
    }

    fn classify(&self, features: &[f64]) -> Result<f64, ClassifierError> {
        let expected = self.input_len();
        if features.len() != expected {
            return Err(ClassifierError::ShapeMismatch {
                expected,
                actual: features.len(),
            });
        }

        let scaler = &self.artifact.scaler;
        let z = features
            .iter()
            .zip(&scaler.mean)
            .zip(&scaler.scale)
            .zip(&self.artifact.weights)
            .map(|(((x, mean), scale), w)| {
                let scale = if *scale == 0.0 { 1.0 } else { *scale };
                w * (x - mean) / scale
            })
            .sum::<f64>()
            + self.artifact.bias;

        let probability = 1.0 / (1.0 + (-z).exp());
        if probability.is_finite() {
            Ok(probability)
        } else {
            Err(ClassifierError::Inference(format!("non-finite output for z={z}")))
        }
    }
}

/// Build the configured classifier. A missing or unreadable artifact yields
/// [`NoModel`], reported by the health monitor rather than failing start-up.
pub fn from_config(path: Option<&Path>) -> Box<dyn Classifier> {
    match path {
        Some(path) => match LogisticClassifier::load(path) {
            Ok(model) => Box::new(model),
            Err(e) => {
                tracing::error!(error = %e, "Classifier model unavailable");
                Box::new(NoModel)
            }
        },
        None => {
            tracing::warn!("No classifier model configured");
            Box::new(NoModel)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> ModelArtifact {
        ModelArtifact {
            version: "test-1".to_string(),
            scaler: Scaler {
                mean: vec![0.0, 0.0],
                scale: vec![1.0, 2.0],
            },
            weights: vec![1.0, -1.0],
            bias: 0.0,
        }
    }

    #[test]
    fn test_threshold_decision() {
        assert_eq!(decide(0.9, 0.3), (Label::NoLeak, 0.9));
        assert_eq!(decide(0.3, 0.3), (Label::NoLeak, 0.3));
        let (label, confidence) = decide(0.1, 0.3);
        assert_eq!(label, Label::Leak);
        assert!((confidence - 0.9).abs() < 1e-12);
    }

    #[test]
    fn test_logistic_output() {
        let model = LogisticClassifier::new(artifact()).unwrap();
        assert_eq!(model.classify(&[0.0, 0.0]).unwrap(), 0.5);
        // z = 2 - 4/2 = 0
        assert_eq!(model.classify(&[2.0, 4.0]).unwrap(), 0.5);
        assert!(model.classify(&[10.0, 0.0]).unwrap() > 0.99);
    }

    #[test]
    fn test_shape_mismatch() {
        let model = LogisticClassifier::new(artifact()).unwrap();
        assert_eq!(
            model.classify(&[1.0]),
            Err(ClassifierError::ShapeMismatch {
                expected: 2,
                actual: 1
            })
        );
    }

    #[test]
    fn test_inconsistent_artifact_rejected() {
        let mut bad = artifact();
        bad.scaler.mean.pop();
        assert!(matches!(LogisticClassifier::new(bad), Err(ClassifierError::Load(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, serde_json::to_string(&artifact()).unwrap()).unwrap();

        let classifier = from_config(Some(&path));
        assert!(classifier.is_loaded());
        assert_eq!(classifier.version(), "test-1");

        let missing = from_config(Some(&dir.path().join("missing.json")));
        assert!(!missing.is_loaded());
        assert_eq!(missing.classify(&[0.0, 0.0]), Err(ClassifierError::NotLoaded));
    }
}
