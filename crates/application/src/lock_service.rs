//! Distributed lock manager and scoped execution helpers.
//!
//! The store's atomic set-if-absent decides every race. The manager only
//! keeps bookkeeping of the handles it issued so they can be listed and
//! released on shutdown.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use lockwarden_core::{LockError, LockResult};
use lockwarden_domain::{
    AcquisitionState, LockAttempt, LockHandle, LockKey, OwnerToken, validate_lease_duration,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::lock_ports::KeyValueStore;

mod config;
mod renewal;
mod scoped;

#[cfg(test)]
mod tests;

pub use config::{DEFAULT_LEASE_DURATION, DEFAULT_WAIT_TIMEOUT, LockManagerConfig};
pub use renewal::LeaseKeeper;
pub use scoped::ExecutionOutcome;

/// Acquires, renews and releases leases against a [`KeyValueStore`].
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KeyValueStore>,
    config: Arc<LockManagerConfig>,
    held: Arc<Mutex<HashMap<LockKey, LockHandle>>>,
}

impl LockManager {
    /// Creates a lock manager over an injected store client.
    pub fn new(store: Arc<dyn KeyValueStore>, config: LockManagerConfig) -> LockResult<Self> {
        config.validate()?;

        Ok(Self {
            store,
            config: Arc::new(config),
            held: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Returns the active configuration.
    #[must_use]
    pub fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    /// Acquires `key`, retrying with backoff for at most `wait_timeout`.
    ///
    /// A zero `wait_timeout` makes exactly one attempt. Contention past the
    /// budget returns [`LockError::NotAcquired`]; store failures are returned
    /// immediately without retrying.
    pub async fn try_acquire(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease_duration: Duration,
    ) -> LockResult<LockHandle> {
        self.try_acquire_until(key, wait_timeout, lease_duration, std::future::pending())
            .await
    }

    /// Acquires `key` with the configured default wait and lease.
    pub async fn try_acquire_default(&self, key: &str) -> LockResult<LockHandle> {
        self.try_acquire(
            key,
            self.config.default_wait_timeout,
            self.config.default_lease,
        )
        .await
    }

    /// Like [`Self::try_acquire`], but stops retrying once `cancel` resolves.
    ///
    /// Cancellation yields [`LockError::NotAcquired`].
    pub async fn try_acquire_until<C>(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease_duration: Duration,
        cancel: C,
    ) -> LockResult<LockHandle>
    where
        C: Future<Output = ()> + Send,
    {
        let key = LockKey::new(key)?;
        validate_lease_duration(lease_duration)?;

        let owner_token = OwnerToken::generate(self.config.holder_id.as_str())?;
        let started = Instant::now();
        let deadline = started.checked_add(wait_timeout);
        let mut retry = 0_u32;
        tokio::pin!(cancel);

        loop {
            let attempted_at = Utc::now();
            let acquired = self
                .store
                .set_if_absent(key.as_str(), owner_token.as_str(), lease_duration)
                .await?;

            if acquired {
                let handle = LockHandle::new(key, owner_token, attempted_at, lease_duration);
                self.track(&handle);
                debug!(
                    key = %handle.key(),
                    owner_token = %handle.owner_token(),
                    attempts = retry.saturating_add(1),
                    "lock acquired"
                );
                return Ok(handle);
            }

            let remaining = deadline.map_or(Duration::MAX, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            if remaining.is_zero() {
                return Err(not_acquired(&key, started, retry));
            }

            let delay = self
                .config
                .backoff
                .next_delay(retry, remaining, jitter_sample()?);
            retry = retry.saturating_add(1);

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = &mut cancel => {
                    debug!(key = %key, attempts = retry, "lock acquisition cancelled");
                    return Err(not_acquired(&key, started, retry));
                }
            }
        }
    }

    /// Releases `handle` with token compare-and-delete semantics.
    ///
    /// A mismatched or missing record returns [`LockError::AlreadyReleased`]:
    /// the lease lapsed while the caller believed it held the lock.
    pub async fn release(&self, handle: &LockHandle) -> LockResult<()> {
        let released = self
            .store
            .compare_and_delete(handle.key().as_str(), handle.owner_token().as_str())
            .await?;
        self.forget(handle);

        release_outcome(handle, released)
    }

    /// Releases a handle the caller already dropped from bookkeeping.
    ///
    /// A store failure puts the handle back so `release_all` can retry it,
    /// unless the key was tracked again in the meantime.
    async fn release_untracked(&self, handle: &LockHandle) -> LockResult<()> {
        match self
            .store
            .compare_and_delete(handle.key().as_str(), handle.owner_token().as_str())
            .await
        {
            Ok(released) => release_outcome(handle, released),
            Err(error) => {
                self.held_entries()
                    .entry(handle.key().clone())
                    .or_insert_with(|| handle.clone());
                Err(error)
            }
        }
    }

    /// Pushes the store TTL of `handle` to `additional_duration` from now.
    ///
    /// Returns the renewed handle, or [`LockError::AlreadyReleased`] once the
    /// token no longer matches.
    pub async fn extend(
        &self,
        handle: &LockHandle,
        additional_duration: Duration,
    ) -> LockResult<LockHandle> {
        validate_lease_duration(additional_duration)?;

        let renewed_at = Utc::now();
        let extended = self
            .store
            .compare_and_extend(
                handle.key().as_str(),
                handle.owner_token().as_str(),
                additional_duration,
            )
            .await?;

        if !extended {
            self.forget(handle);
            warn!(
                key = %handle.key(),
                owner_token = %handle.owner_token(),
                "lock lease lost before extension"
            );
            return Err(already_released(handle));
        }

        let renewed = handle.renewed(renewed_at, additional_duration);
        self.track(&renewed);
        debug!(
            key = %renewed.key(),
            owner_token = %renewed.owner_token(),
            lease_ms = u64::try_from(additional_duration.as_millis()).unwrap_or(u64::MAX),
            "lock extended"
        );
        Ok(renewed)
    }

    /// Returns whether the store still maps the key to this handle's token.
    pub async fn is_held(&self, handle: &LockHandle) -> LockResult<bool> {
        let current = self.store.current_value(handle.key().as_str()).await?;
        Ok(current.as_deref() == Some(handle.owner_token().as_str()))
    }

    /// Returns handles issued by this manager that were not released yet.
    ///
    /// Entries may already be expired in the store.
    #[must_use]
    pub fn held_handles(&self) -> Vec<LockHandle> {
        let mut handles: Vec<LockHandle> = self.held_entries().values().cloned().collect();
        handles.sort_by(|left, right| left.key().as_str().cmp(right.key().as_str()));
        handles
    }

    /// Releases every tracked handle and returns how many were still held.
    ///
    /// All handles are attempted; the first failure is returned afterward.
    pub async fn release_all(&self) -> LockResult<usize> {
        let mut released = 0_usize;
        let mut first_error = None;

        for handle in self.held_handles() {
            match self.release(&handle).await {
                Ok(()) => released = released.saturating_add(1),
                Err(error) => {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(released),
        }
    }

    fn held_entries(&self) -> MutexGuard<'_, HashMap<LockKey, LockHandle>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, handle: &LockHandle) {
        self.held_entries()
            .insert(handle.key().clone(), handle.clone());
    }

    fn forget(&self, handle: &LockHandle) {
        let mut held = self.held_entries();
        if held
            .get(handle.key())
            .is_some_and(|tracked| tracked.owner_token() == handle.owner_token())
        {
            held.remove(handle.key());
        }
    }
}

fn not_acquired(key: &LockKey, started: Instant, retries: u32) -> LockError {
    let waited = started.elapsed();
    debug!(key = %key, attempts = retries.saturating_add(1), "lock not acquired");
    LockError::NotAcquired {
        key: key.as_str().to_owned(),
        waited,
    }
}

fn release_outcome(handle: &LockHandle, released: bool) -> LockResult<()> {
    if !released {
        warn!(
            key = %handle.key(),
            owner_token = %handle.owner_token(),
            "lock was already released or taken over before release"
        );
        return Err(already_released(handle));
    }

    debug!(
        key = %handle.key(),
        owner_token = %handle.owner_token(),
        "lock released"
    );
    Ok(())
}

fn already_released(handle: &LockHandle) -> LockError {
    LockError::AlreadyReleased {
        key: handle.key().as_str().to_owned(),
    }
}

fn jitter_sample() -> LockResult<u32> {
    let mut bytes = [0u8; 4];
    getrandom::fill(&mut bytes)
        .map_err(|error| LockError::Internal(format!("failed to sample backoff jitter: {error}")))?;
    Ok(u32::from_le_bytes(bytes))
}
