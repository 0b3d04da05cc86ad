//! Error taxonomy for the quantized linear layer.

use thiserror::Error;

/// Errors surfaced by [`crate::QuantLinear`] and its collaborators.
///
/// None of these are retried internally.
#[derive(Debug, Error)]
pub enum LinearError {
    /// Source contents disagree with what the layer was constructed to expect
    /// (bias presence, LoRA pairing, LoRA rank).
    #[error("{key}: {reason}")]
    Consistency { key: String, reason: String },

    #[error("{key}: shape mismatch, expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("layer {key} has no data")]
    NoData { key: String },

    #[error("{key}: {reason}")]
    InvalidOperation { key: String, reason: String },

    /// Failure reported by the quantized kernel. Carried as-is.
    #[error("kernel error: {0}")]
    Kernel(candle_core::Error),

    #[error("no scratch arena reserved for device {device}")]
    ScratchUnavailable { device: usize },

    #[error("scratch arena exhausted: requested {requested} bytes, {available} available")]
    ScratchExhausted { requested: usize, available: usize },

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("lock poisoned: {0}")]
    Poisoned(&'static str),
}

pub type Result<T> = std::result::Result<T, LinearError>;

impl LinearError {
    pub(crate) fn consistency(key: &str, reason: impl Into<String>) -> Self {
        Self::Consistency {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn shape(key: &str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            key: key.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn no_data(key: &str) -> Self {
        Self::NoData {
            key: key.to_string(),
        }
    }
}
