//! Error types for the versioning model.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while reading or mutating revisions and deltas.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// The feature is not declared by the revision's class.
    #[error("feature '{feature}' is not defined on class {class}")]
    UnknownFeature {
        /// Qualified class name.
        class: String,
        /// Requested feature.
        feature: String,
    },

    /// A list operation was applied to a single-valued feature.
    #[error("feature '{feature}' is not many-valued")]
    NotAList {
        /// Feature name.
        feature: String,
    },

    /// A list index was outside the current list bounds.
    #[error("index {index} out of bounds for feature '{feature}' (len {len})")]
    IndexOutOfBounds {
        /// Feature name.
        feature: String,
        /// Offending index.
        index: usize,
        /// Current list length.
        len: usize,
    },

    /// A branch was referenced that the registry does not know.
    #[error("unknown branch: {0}")]
    UnknownBranch(u32),

    /// CBOR serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ModelError {
    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ModelError::IndexOutOfBounds {
            feature: "items".into(),
            index: 4,
            len: 2,
        };
        assert_eq!(
            err.to_string(),
            "index 4 out of bounds for feature 'items' (len 2)"
        );
        assert!(ModelError::serialization("eof")
            .to_string()
            .contains("eof"));
    }
}
