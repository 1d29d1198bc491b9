//! Lock identity and handle types.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use lockwarden_core::{LockError, LockResult, NonEmptyString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Validated lock namespace identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockKey(NonEmptyString);

impl LockKey {
    /// Creates a validated lock key.
    pub fn new(value: impl Into<String>) -> LockResult<Self> {
        NonEmptyString::new(value)
            .map(Self)
            .map_err(|_| LockError::Validation("lock key must not be empty".to_owned()))
    }

    /// Returns the key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for LockKey {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Fencing value identifying exactly one acquisition.
///
/// Tokens combine the holder identity with a random 128-bit UUID so two
/// attempts never share a value, even from the same holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Generates a fresh token for one acquisition attempt.
    pub fn generate(holder_id: &str) -> LockResult<Self> {
        if holder_id.trim().is_empty() {
            return Err(LockError::Validation(
                "lock holder_id must not be empty".to_owned(),
            ));
        }

        Ok(Self(format!("{holder_id}:{}", Uuid::new_v4().simple())))
    }

    /// Rebuilds a token from its stored representation.
    #[must_use]
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the token string as written to the store.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for OwnerToken {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// In-process view of one held lease.
///
/// A handle stays meaningful only while the store maps its key to its owner
/// token. Renewal produces a new handle; the original keeps its old expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    key: LockKey,
    owner_token: OwnerToken,
    acquired_at: DateTime<Utc>,
    lease_duration: Duration,
}

impl LockHandle {
    /// Creates a handle for a lease granted at `acquired_at`.
    #[must_use]
    pub fn new(
        key: LockKey,
        owner_token: OwnerToken,
        acquired_at: DateTime<Utc>,
        lease_duration: Duration,
    ) -> Self {
        Self {
            key,
            owner_token,
            acquired_at,
            lease_duration,
        }
    }

    /// Returns the same lease with its window restarted at `renewed_at`.
    #[must_use]
    pub fn renewed(&self, renewed_at: DateTime<Utc>, lease_duration: Duration) -> Self {
        Self {
            key: self.key.clone(),
            owner_token: self.owner_token.clone(),
            acquired_at: renewed_at,
            lease_duration,
        }
    }

    /// Returns the lock key.
    #[must_use]
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Returns the fencing token of this acquisition.
    #[must_use]
    pub fn owner_token(&self) -> &OwnerToken {
        &self.owner_token
    }

    /// Returns when the current lease window started.
    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Returns the length of the current lease window.
    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Returns when the store will drop the record absent renewal.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.lease_duration)
            .ok()
            .and_then(|lease| self.acquired_at.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Returns whether the lease window has closed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}

/// Rejects lease durations the store cannot express.
pub fn validate_lease_duration(lease_duration: Duration) -> LockResult<()> {
    if lease_duration.as_millis() == 0 {
        return Err(LockError::Validation(
            "lease duration must be at least one millisecond".to_owned(),
        ));
    }

    Ok(())
}
