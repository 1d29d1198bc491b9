use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::*;

/// Background task extending one lease until stopped.
///
/// Renewal stops for good once the store reports the token as gone; transport
/// failures are logged and retried on the next tick.
pub struct LeaseKeeper {
    latest: Arc<Mutex<LockHandle>>,
    lost: Arc<AtomicBool>,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LeaseKeeper {
    /// Starts renewing `handle` every `renew_every` with `lease_duration`.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn spawn(
        manager: LockManager,
        handle: LockHandle,
        renew_every: Duration,
        lease_duration: Duration,
    ) -> Self {
        let latest = Arc::new(Mutex::new(handle));
        let lost = Arc::new(AtomicBool::new(false));
        let (stop, mut stopped) = oneshot::channel();

        let task_latest = Arc::clone(&latest);
        let task_lost = Arc::clone(&lost);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    () = tokio::time::sleep(renew_every) => {}
                }

                let current = lock_latest(&task_latest).clone();
                match manager.extend(&current, lease_duration).await {
                    Ok(renewed) => *lock_latest(&task_latest) = renewed,
                    Err(error) if error.is_already_released() => {
                        task_lost.store(true, Ordering::SeqCst);
                        warn!(key = %current.key(), "lease lost while renewing, stopping keeper");
                        break;
                    }
                    Err(error) => {
                        warn!(
                            key = %current.key(),
                            error = %error,
                            "failed to renew lease, retrying on next tick"
                        );
                    }
                }
            }
        });

        Self {
            latest,
            lost,
            stop: Some(stop),
            task: Some(task),
        }
    }

    /// Returns the most recently renewed handle.
    #[must_use]
    pub fn latest(&self) -> LockHandle {
        lock_latest(&self.latest).clone()
    }

    /// Returns whether renewal found the lease taken over or expired.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stops renewing and returns the most recent handle.
    pub async fn stop(mut self) -> LockHandle {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }

        if let Some(task) = self.task.take()
            && let Err(error) = task.await
        {
            warn!(error = %error, "lease keeper task ended abnormally");
        }

        self.latest()
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn lock_latest(latest: &Mutex<LockHandle>) -> MutexGuard<'_, LockHandle> {
    latest.lock().unwrap_or_else(PoisonError::into_inner)
}
