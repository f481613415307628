pub mod torch;

use ndarray::ArrayView5;
use serde::Serialize;
use shared::{FailureCategory, Label};
use std::path::Path;
use std::sync::Arc;

use crate::frames::FrameBatch;

pub use torch::TorchClassifier;

/// Class index the trained model uses for manipulated videos.
const FAKE_CLASS_INDEX: usize = 1;

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Model not loaded: {0}")]
    ModelUnavailable(String),
    #[error("Prediction error: {0}")]
    Failure(String),
    #[error("Prediction error: {0}")]
    Torch(#[from] tch::TchError),
}

impl InferenceError {
    pub fn category(&self) -> FailureCategory {
        match self {
            InferenceError::ModelUnavailable(_) => FailureCategory::ModelUnavailable,
            InferenceError::Failure(_) | InferenceError::Torch(_) => {
                FailureCategory::InferenceFailure
            }
        }
    }
}

/// A loaded model that maps a `(1, frames, height, width, channels)` tensor
/// to one score per class.
pub trait FrameClassifier: Send + Sync {
    fn predict(&self, input: ArrayView5<'_, f32>) -> Result<Vec<f32>, InferenceError>;
}

/// Process-wide model slot, decided once at startup.
#[derive(Clone)]
pub enum ModelHandle {
    Loaded(Arc<dyn FrameClassifier>),
    Unavailable(String),
}

impl ModelHandle {
    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelHandle::Loaded(_))
    }
}

/// Loads the model once at startup. A missing or broken model leaves the
/// service running with every analysis reporting `ModelUnavailable`.
pub fn load_model(path: &Path) -> ModelHandle {
    if !path.exists() {
        let reason = format!("model file {} not found", path.display());
        log::error!("Model not loaded: {}", reason);
        return ModelHandle::Unavailable(reason);
    }
    match TorchClassifier::load(path) {
        Ok(classifier) => ModelHandle::Loaded(Arc::new(classifier)),
        Err(e) => {
            log::error!("Failed to load model from {}: {}", path.display(), e);
            ModelHandle::Unavailable(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub label: Label,
    /// Probability assigned to `label`.
    pub confidence: f32,
}

#[derive(Clone)]
pub struct InferenceEngine {
    model: ModelHandle,
    apply_softmax: bool,
}

impl InferenceEngine {
    pub fn new(model: ModelHandle, apply_softmax: bool) -> Self {
        Self {
            model,
            apply_softmax,
        }
    }

    pub fn is_available(&self) -> bool {
        self.model.is_loaded()
    }

    pub fn unavailable_reason(&self) -> Option<&str> {
        match &self.model {
            ModelHandle::Loaded(_) => None,
            ModelHandle::Unavailable(reason) => Some(reason),
        }
    }

    pub fn classify(&self, batch: &FrameBatch) -> Result<ClassificationResult, InferenceError> {
        let model = match &self.model {
            ModelHandle::Loaded(model) => model,
            ModelHandle::Unavailable(reason) => {
                return Err(InferenceError::ModelUnavailable(reason.clone()));
            }
        };

        let input = batch.to_model_input();
        let mut scores = model.predict(input.view())?;
        if self.apply_softmax {
            scores = softmax(&scores);
        }
        interpret(&scores)
    }
}

fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// Argmax over the class scores (first maximum wins on ties).
fn interpret(scores: &[f32]) -> Result<ClassificationResult, InferenceError> {
    if scores.is_empty() {
        return Err(InferenceError::Failure("model returned no scores".into()));
    }
    if scores.iter().any(|s| !s.is_finite()) {
        return Err(InferenceError::Failure(format!(
            "model returned non-finite scores: {:?}",
            scores
        )));
    }

    let (index, confidence) = scores
        .iter()
        .copied()
        .enumerate()
        .fold((0, scores[0]), |best, (i, s)| if s > best.1 { (i, s) } else { best });

    if !(0.0..=1.0).contains(&confidence) {
        return Err(InferenceError::Failure(format!(
            "model output is not a probability distribution: {:?}",
            scores
        )));
    }

    let label = if index == FAKE_CLASS_INDEX {
        Label::Fake
    } else {
        Label::Real
    };
    Ok(ClassificationResult { label, confidence })
}
