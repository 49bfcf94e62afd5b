//! Separation-related error types.

use thiserror::Error;

/// Errors that can occur while building or evaluating losses, layers,
/// feature computers and array writers.
#[derive(Debug, Error)]
pub enum SeparationError {
    #[error("Invalid configuration for `{option}`: {message}")]
    Configuration { option: String, message: String },

    #[error("Shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("Missing {role} tensor `{name}`")]
    MissingTensor { role: &'static str, name: String },

    #[error("Degenerate input: {message}")]
    DegenerateInput { message: String },

    #[error("Feature computation error: {message}")]
    Feature { message: String },

    #[error("Tensor data error: {message}")]
    TensorData { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SeparationError {
    pub(crate) fn configuration(option: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            option: option.into(),
            message: message.into(),
        }
    }

    pub(crate) fn shape(
        context: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub(crate) fn degenerate(message: impl Into<String>) -> Self {
        Self::DegenerateInput {
            message: message.into(),
        }
    }
}

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, SeparationError>;
