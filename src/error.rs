//! Error types for Traducir
//!
//! Every fallible operation in the crate returns [`Result`]. Construction-time
//! failures (settings, parameter files, tensor shapes) abort engine
//! initialization; there is no partial-construction recovery.

use thiserror::Error;

/// Result type alias for Traducir operations
pub type Result<T> = std::result::Result<T, TraducirError>;

/// Errors that can occur while loading or running a translation model
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TraducirError {
    /// A vector or matrix has a shape the operation cannot accept
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Description of the mismatch
        reason: String,
    },

    /// A named parameter tensor disagrees with the shape the model expects
    #[error("Tensor '{name}' has shape {actual:?}, expected {expected:?}")]
    TensorShapeMismatch {
        /// Storage name of the tensor
        name: String,
        /// Shape the engine asked for
        expected: Vec<usize>,
        /// Shape found in storage
        actual: Vec<usize>,
    },

    /// Flat data length does not match the declared shape
    #[error("Data size {data_size} doesn't match shape {shape:?} (expected {expected})")]
    DataShapeMismatch {
        /// Number of elements provided
        data_size: usize,
        /// Declared shape
        shape: Vec<usize>,
        /// Number of elements the shape requires
        expected: usize,
    },

    /// A setting is present but unusable, or the settings file is malformed
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A required setting is absent
    #[error("Missing entry in the model settings: '{key}'")]
    MissingSetting {
        /// Settings key
        key: String,
    },

    /// A required parameter tensor is absent from the store
    #[error("Missing model parameter: '{name}'")]
    MissingParameter {
        /// Storage name of the tensor
        name: String,
    },

    /// A file could not be parsed
    #[error("Format error: {reason}")]
    FormatError {
        /// Description of the problem
        reason: String,
    },

    /// Underlying I/O failure
    #[error("I/O error: {message}")]
    IoError {
        /// Description including the failing path
        message: String,
    },

    /// Operation is not supported for the given input
    #[error("Unsupported operation '{operation}': {reason}")]
    UnsupportedOperation {
        /// Operation name
        operation: String,
        /// Why it is unsupported
        reason: String,
    },

    /// Wrapped input does not fit the positional tables
    #[error("Context limit exceeded: {provided} positions provided, maximum is {maximum}")]
    ContextLimitExceeded {
        /// Positions the request needs
        provided: usize,
        /// Positions the model supports
        maximum: usize,
    },

    /// Token id outside the vocabulary
    #[error("Token id {token} is outside the vocabulary of {vocab_size} tokens")]
    InvalidToken {
        /// Offending token id
        token: u32,
        /// Vocabulary size
        vocab_size: usize,
    },

    /// Failure while running the forward pass
    #[error("Inference error: {0}")]
    InferenceError(String),
}

impl TraducirError {
    /// Whether the error happened while constructing the engine
    ///
    /// Callers use this to decide between aborting startup and reporting a
    /// per-request failure.
    #[must_use]
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            Self::TensorShapeMismatch { .. }
                | Self::InvalidConfiguration(_)
                | Self::MissingSetting { .. }
                | Self::MissingParameter { .. }
                | Self::FormatError { .. }
                | Self::IoError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_setting_names_key() {
        let err = TraducirError::MissingSetting {
            key: "hidden.size".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Missing entry in the model settings: 'hidden.size'"
        );
    }

    #[test]
    fn test_shape_mismatch_message() {
        let err = TraducirError::TensorShapeMismatch {
            name: "encoders/encoder1/att.query.w".to_string(),
            expected: vec![4, 4],
            actual: vec![4, 8],
        };
        let msg = err.to_string();
        assert!(msg.contains("encoders/encoder1/att.query.w"));
        assert!(msg.contains("[4, 8]"));
        assert!(msg.contains("[4, 4]"));
    }

    #[test]
    fn test_construction_error_classification() {
        assert!(TraducirError::MissingParameter {
            name: "wte".to_string()
        }
        .is_construction_error());
        assert!(!TraducirError::ContextLimitExceeded {
            provided: 10,
            maximum: 5
        }
        .is_construction_error());
        assert!(!TraducirError::InferenceError("x".to_string()).is_construction_error());
    }
}
