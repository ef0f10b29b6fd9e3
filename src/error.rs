//! Configuration errors shared by the registry, run config and coordinator.
//!
//! A configuration error always fails a run before any backend is called.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("duplicate criterion id: {0}")]
    DuplicateCriterion(String),

    #[error("unknown criterion id: {0}")]
    UnknownCriterion(String),

    #[error("malformed criterion {id}: {reason}")]
    MalformedCriterion { id: String, reason: String },

    #[error("invalid threshold for criterion {id}: {reason}")]
    InvalidThreshold { id: String, reason: String },

    #[error("invalid parameters for criterion {id}: {reason}")]
    InvalidParameters { id: String, reason: String },

    #[error("test case {test_id} references criterion {criterion_id} more than once")]
    DuplicateReference {
        test_id: String,
        criterion_id: String,
    },

    #[error("invalid backend config {backend_id}: {reason}")]
    InvalidBackend { backend_id: String, reason: String },

    #[error("no enabled backends for backend-judged criterion {0}")]
    NoEnabledBackends(String),

    #[error("invalid run config: {0}")]
    InvalidRunConfig(String),

    #[error("failed to decode definitions: {0}")]
    Decode(String),
}

impl ConfigurationError {
    pub fn malformed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedCriterion {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_params(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            id: id.into(),
            reason: reason.into(),
        }
    }
}
