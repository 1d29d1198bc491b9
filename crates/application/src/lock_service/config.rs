use std::time::Duration;

use lockwarden_core::{LockError, LockResult};
use lockwarden_domain::{BackoffPolicy, validate_lease_duration};

/// Default lease granted when callers do not pick one.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(30);

/// Default time spent retrying a contended key.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings consumed by [`super::LockManager`].
#[derive(Debug, Clone)]
pub struct LockManagerConfig {
    /// Identity prefixed to every owner token this manager generates.
    pub holder_id: String,
    /// Lease used by the `*_default` operations.
    pub default_lease: Duration,
    /// Wait budget used by the `*_default` operations.
    pub default_wait_timeout: Duration,
    /// Retry schedule for contended acquisitions.
    pub backoff: BackoffPolicy,
}

impl LockManagerConfig {
    /// Creates a configuration with default timings for one holder.
    #[must_use]
    pub fn new(holder_id: impl Into<String>) -> Self {
        Self {
            holder_id: holder_id.into(),
            default_lease: DEFAULT_LEASE_DURATION,
            default_wait_timeout: DEFAULT_WAIT_TIMEOUT,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Validates holder identity and default lease.
    pub fn validate(&self) -> LockResult<()> {
        if self.holder_id.trim().is_empty() {
            return Err(LockError::Validation(
                "lock manager holder_id must not be empty".to_owned(),
            ));
        }

        validate_lease_duration(self.default_lease)
    }
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self::new(format!("lockwarden-{}", std::process::id()))
    }
}
