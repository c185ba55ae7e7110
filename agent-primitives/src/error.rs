//! Shared error definitions for runtime primitives.

use thiserror::Error;
use uuid::Error as UuidError;

/// Result alias used throughout the primitive types.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing or parsing primitive types.
#[derive(Debug, Error)]
pub enum Error {
    /// The provided identifier could not be parsed as a UUID.
    #[error("invalid identifier: {source}")]
    InvalidId {
        /// Source parsing error from the UUID library.
        #[from]
        source: UuidError,
    },

    /// Character definition failed validation.
    #[error("invalid character: {reason}")]
    InvalidCharacter {
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// A record field failed validation.
    #[error("invalid record: {reason}")]
    InvalidRecord {
        /// Human-readable reason for rejection.
        reason: String,
    },
}

impl Error {
    /// Convenience constructor for character validation failures.
    #[must_use]
    pub fn invalid_character(reason: impl Into<String>) -> Self {
        Self::InvalidCharacter {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for record validation failures.
    #[must_use]
    pub fn invalid_record(reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            reason: reason.into(),
        }
    }
}
