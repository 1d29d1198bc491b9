use super::*;

/// Result of a fire-and-forget scoped run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The lock was acquired, the work ran, and the lock was released.
    Completed,
    /// The lock stayed contended for the whole wait budget; nothing ran.
    Skipped,
}

impl LockManager {
    /// Runs `work` while holding `key` and releases the lock afterward.
    ///
    /// `work` never runs when acquisition fails. Release happens exactly once
    /// whether `work` returns, panics, or the returned future is dropped; a
    /// release already in flight keeps running on the runtime when the caller
    /// goes away.
    /// Failures of `work` travel inside `R`; a failed release is returned in
    /// place of the value because exclusivity may have been violated.
    pub async fn run_exclusive<F, Fut, R>(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease_duration: Duration,
        work: F,
    ) -> LockResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.run_scoped(key, wait_timeout, lease_duration, None, work)
            .await
    }

    /// Like [`Self::run_exclusive`], renewing the lease every third of its
    /// duration until `work` finishes.
    pub async fn run_exclusive_renewing<F, Fut, R>(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease_duration: Duration,
        work: F,
    ) -> LockResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let renew_every = (lease_duration / 3).max(Duration::from_millis(1));
        self.run_scoped(key, wait_timeout, lease_duration, Some(renew_every), work)
            .await
    }

    /// Runs `work` under the lock, reporting contention instead of failing.
    ///
    /// Store and validation failures still propagate.
    pub async fn run_exclusive_or_skip<F, Fut>(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease_duration: Duration,
        work: F,
    ) -> LockResult<ExecutionOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        match self
            .run_exclusive(key, wait_timeout, lease_duration, work)
            .await
        {
            Ok(()) => Ok(ExecutionOutcome::Completed),
            Err(error) if error.is_not_acquired() => {
                info!(key = %key, error = %error, "skipped exclusive run, lock is busy");
                Ok(ExecutionOutcome::Skipped)
            }
            Err(error) => Err(error),
        }
    }

    async fn run_scoped<F, Fut, R>(
        &self,
        key: &str,
        wait_timeout: Duration,
        lease_duration: Duration,
        renew_every: Option<Duration>,
        work: F,
    ) -> LockResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let mut attempt = LockAttempt::new(LockKey::new(key)?);
        attempt.transition(AcquisitionState::Acquiring)?;

        let handle = match self.try_acquire(key, wait_timeout, lease_duration).await {
            Ok(handle) => handle,
            Err(error) => {
                attempt.transition(AcquisitionState::NotAcquired)?;
                return Err(error);
            }
        };
        attempt.transition(AcquisitionState::Held)?;

        let mut guard = ReleaseGuard::arm(self.clone(), handle.clone());
        let keeper = renew_every
            .map(|every| LeaseKeeper::spawn(self.clone(), handle.clone(), every, lease_duration));

        let output = work().await;

        attempt.transition(AcquisitionState::Releasing)?;
        guard.disarm();
        self.forget(&handle);

        let manager = self.clone();
        let release_handle = handle.clone();
        let released = tokio::spawn(async move {
            if let Some(keeper) = keeper {
                keeper.stop().await;
                manager.forget(&release_handle);
            }
            manager.release_untracked(&release_handle).await
        })
        .await
        .unwrap_or_else(|error| {
            Err(LockError::Internal(format!(
                "lock release task ended abnormally: {error}"
            )))
        });

        match released {
            Ok(()) => {
                attempt.transition(AcquisitionState::Released)?;
                Ok(output)
            }
            Err(error) => {
                warn!(
                    key = %handle.key(),
                    error = %error,
                    "exclusive work finished but the lock could not be released cleanly"
                );
                Err(error)
            }
        }
    }
}

/// Releases a held lease from `Drop` when the scoped run unwinds or is cancelled.
struct ReleaseGuard {
    manager: LockManager,
    handle: Option<LockHandle>,
}

impl ReleaseGuard {
    fn arm(manager: LockManager, handle: LockHandle) -> Self {
        Self {
            manager,
            handle: Some(handle),
        }
    }

    fn disarm(&mut self) {
        self.handle = None;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                key = %handle.key(),
                "no runtime to release abandoned lock, store expiry will reclaim it"
            );
            return;
        };

        self.manager.forget(&handle);
        let manager = self.manager.clone();
        runtime.spawn(async move {
            match manager.release_untracked(&handle).await {
                Ok(()) => debug!(key = %handle.key(), "released lock after interrupted run"),
                Err(error) => warn!(
                    key = %handle.key(),
                    error = %error,
                    "failed to release lock after interrupted run"
                ),
            }
        });
    }
}
