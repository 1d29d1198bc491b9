//! Shared primitives for all Rust crates in Lockwarden.

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across Lockwarden crates.
pub type LockResult<T> = Result<T, LockError>;

/// A validated non-empty UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NonEmptyString(String);

impl NonEmptyString {
    /// Creates a validated non-empty string.
    pub fn new(value: impl Into<String>) -> LockResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(LockError::Validation(
                "value must not be empty or whitespace".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

/// Lock service error categories.
#[derive(Debug, Error)]
pub enum LockError {
    /// The wait budget ran out while another holder kept the key.
    #[error("lock '{key}' not acquired after waiting {waited:?}")]
    NotAcquired {
        /// Contended lock key.
        key: String,
        /// Time spent retrying before giving up.
        waited: Duration,
    },

    /// The stored owner token no longer matches the caller's handle.
    #[error("lock '{key}' was already released or re-acquired by another holder")]
    AlreadyReleased {
        /// Lock key whose ownership was lost.
        key: String,
    },

    /// The backing key-value store could not be reached or failed a command.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Invalid input or violated invariant.
    #[error("validation error: {0}")]
    Validation(String),

    /// Internal unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LockError {
    /// Returns true when the error reports contention rather than a failure.
    #[must_use]
    pub fn is_not_acquired(&self) -> bool {
        matches!(self, Self::NotAcquired { .. })
    }

    /// Returns true when the error reports a lost or already released lease.
    #[must_use]
    pub fn is_already_released(&self) -> bool {
        matches!(self, Self::AlreadyReleased { .. })
    }
}
