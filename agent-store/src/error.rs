//! Error types shared by store adapters.

use thiserror::Error;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The adapter has not been initialised or was closed.
    #[error("store adapter is not ready")]
    NotReady,

    /// A uniqueness constraint was violated.
    ///
    /// The kernel treats this as recoverable during entity bootstrap.
    #[error("duplicate key: {key}")]
    Duplicate {
        /// The offending key.
        key: String,
    },

    /// The referenced record does not exist.
    #[error("{what} not found")]
    Missing {
        /// Record kind that was looked up.
        what: &'static str,
    },

    /// Serialization or deserialization failure.
    #[error("serialization error: {source}")]
    Serialization {
        /// Source [`serde_json::Error`].
        #[from]
        source: serde_json::Error,
    },

    /// Backend-specific failure.
    #[error("store backend error: {reason}")]
    Backend {
        /// Human-readable context provided by the backend.
        reason: String,
    },
}

impl StoreError {
    /// Convenience constructor for backend failures.
    #[must_use]
    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for duplicate-key failures.
    #[must_use]
    pub fn duplicate(key: impl Into<String>) -> Self {
        Self::Duplicate { key: key.into() }
    }

    /// Returns `true` when the error is a uniqueness violation.
    #[must_use]
    pub const fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }
}
