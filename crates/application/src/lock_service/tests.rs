use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;

use lockwarden_core::{LockError, LockResult};

use crate::lock_ports::KeyValueStore;

use super::{ExecutionOutcome, LeaseKeeper, LockManager, LockManagerConfig};

#[derive(Default)]
struct FakeKeyValueStore {
    records: Mutex<HashMap<String, (String, Instant)>>,
    unavailable: AtomicBool,
    delete_calls: AtomicUsize,
    extend_calls: AtomicUsize,
    delete_delay_ms: AtomicU64,
    slow_writes: AtomicBool,
    last_write_at: std::sync::Mutex<Option<DateTime<Utc>>>,
}

impl FakeKeyValueStore {
    fn record_write(&self) {
        *self
            .last_write_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        if self.slow_writes.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn last_write_at(&self) -> Option<DateTime<Utc>> {
        *self
            .last_write_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> LockResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::StoreUnavailable("connection refused".to_owned()));
        }
        Ok(())
    }

    async fn contains(&self, key: &str) -> bool {
        let mut records = self.records.lock().await;
        live_value(&mut records, key).is_some()
    }
}

fn live_value(records: &mut HashMap<String, (String, Instant)>, key: &str) -> Option<String> {
    if records
        .get(key)
        .is_some_and(|(_, expires_at)| *expires_at <= Instant::now())
    {
        records.remove(key);
    }
    records.get(key).map(|(value, _)| value.clone())
}

#[async_trait]
impl KeyValueStore for FakeKeyValueStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> LockResult<bool> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        if live_value(&mut records, key).is_some() {
            return Ok(false);
        }
        records.insert(key.to_owned(), (value.to_owned(), Instant::now() + ttl));
        self.record_write();
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> LockResult<bool> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let deleted = {
            let mut records = self.records.lock().await;
            let matches = live_value(&mut records, key).as_deref() == Some(expected);
            if matches {
                records.remove(key);
            }
            matches
        };

        let delay = self.delete_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(deleted)
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> LockResult<bool> {
        self.extend_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut records = self.records.lock().await;
        if live_value(&mut records, key).as_deref() != Some(expected) {
            return Ok(false);
        }
        records.insert(key.to_owned(), (expected.to_owned(), Instant::now() + ttl));
        self.record_write();
        Ok(true)
    }

    async fn current_value(&self, key: &str) -> LockResult<Option<String>> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        Ok(live_value(&mut records, key))
    }
}

fn manager(store: &Arc<FakeKeyValueStore>, holder_id: &str) -> LockManager {
    let store: Arc<dyn KeyValueStore> = store.clone();
    LockManager::new(store, LockManagerConfig::new(holder_id)).unwrap_or_else(|_| unreachable!())
}

#[tokio::test(start_paused = true)]
async fn acquire_then_release_leaves_no_record() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");

    let handle = manager
        .try_acquire("job-42", Duration::ZERO, Duration::from_secs(10))
        .await;
    assert!(handle.is_ok());
    let handle = handle.unwrap_or_else(|_| unreachable!());
    assert!(store.contains("job-42").await);
    assert_eq!(manager.held_handles().len(), 1);

    assert!(manager.release(&handle).await.is_ok());
    assert!(!store.contains("job-42").await);
    assert!(manager.held_handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn zero_wait_contention_has_exactly_one_winner() {
    let store = Arc::new(FakeKeyValueStore::default());
    let left = manager(&store, "node-a");
    let right = manager(&store, "node-b");

    let (left_result, right_result) = tokio::join!(
        left.try_acquire("job-42", Duration::ZERO, Duration::from_secs(10)),
        right.try_acquire("job-42", Duration::ZERO, Duration::from_secs(10)),
    );

    let winners = [&left_result, &right_result]
        .iter()
        .filter(|result| result.is_ok())
        .count();
    assert_eq!(winners, 1);
    assert!(
        [left_result, right_result]
            .into_iter()
            .any(|result| matches!(result, Err(LockError::NotAcquired { .. })))
    );
}

#[tokio::test(start_paused = true)]
async fn expired_handle_cannot_be_released() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");

    let handle = manager
        .try_acquire("job-42", Duration::ZERO, Duration::from_millis(100))
        .await
        .unwrap_or_else(|_| unreachable!());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let released = manager.release(&handle).await;
    assert!(matches!(released, Err(LockError::AlreadyReleased { .. })));
    assert!(manager.held_handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stale_holder_cannot_release_new_owner() {
    let store = Arc::new(FakeKeyValueStore::default());
    let slow = manager(&store, "node-a");
    let fast = manager(&store, "node-b");

    let stale = slow
        .try_acquire("job-42", Duration::ZERO, Duration::from_millis(100))
        .await
        .unwrap_or_else(|_| unreachable!());
    tokio::time::sleep(Duration::from_millis(150)).await;

    let current = fast
        .try_acquire("job-42", Duration::ZERO, Duration::from_secs(10))
        .await
        .unwrap_or_else(|_| unreachable!());

    assert!(slow.release(&stale).await.is_err());
    assert!(slow.extend(&stale, Duration::from_secs(5)).await.is_err());
    assert!(matches!(fast.is_held(&current).await, Ok(true)));
    assert!(matches!(slow.is_held(&stale).await, Ok(false)));
}

#[tokio::test(start_paused = true)]
async fn extend_keeps_lease_alive_past_original_duration() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");

    let handle = manager
        .try_acquire("job-42", Duration::from_secs(5), Duration::from_secs(2))
        .await
        .unwrap_or_else(|_| unreachable!());
    let extended = manager.extend(&handle, Duration::from_secs(5)).await;
    assert!(extended.is_ok());
    let extended = extended.unwrap_or_else(|_| unreachable!());
    assert_eq!(extended.owner_token(), handle.owner_token());
    assert_eq!(extended.lease_duration(), Duration::from_secs(5));

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(manager.release(&extended).await.is_ok());
    assert!(!store.contains("job-42").await);
}

#[tokio::test(start_paused = true)]
async fn contended_caller_gives_up_after_wait_timeout() {
    let store = Arc::new(FakeKeyValueStore::default());
    let caller_a = manager(&store, "caller-a");
    let caller_b = manager(&store, "caller-b");
    let caller_c = manager(&store, "caller-c");

    let held = caller_a
        .try_acquire("job-42", Duration::from_secs(3), Duration::from_secs(10))
        .await
        .unwrap_or_else(|_| unreachable!());

    let started = Instant::now();
    let contended = caller_b
        .try_acquire("job-42", Duration::from_secs(3), Duration::from_secs(10))
        .await;
    let waited = started.elapsed();
    assert!(matches!(contended, Err(LockError::NotAcquired { .. })));
    assert!(waited >= Duration::from_secs(3));
    assert!(waited < Duration::from_secs(4));

    assert!(caller_a.release(&held).await.is_ok());

    let started = Instant::now();
    let third = caller_c
        .try_acquire("job-42", Duration::from_secs(3), Duration::from_secs(10))
        .await;
    assert!(third.is_ok());
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn waiting_caller_acquires_once_holder_releases() {
    let store = Arc::new(FakeKeyValueStore::default());
    let caller_a = manager(&store, "caller-a");
    let caller_b = manager(&store, "caller-b");

    let held = caller_a
        .try_acquire("job-42", Duration::ZERO, Duration::from_secs(10))
        .await
        .unwrap_or_else(|_| unreachable!());
    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        caller_a.release(&held).await
    });

    let started = Instant::now();
    let acquired = caller_b
        .try_acquire("job-42", Duration::from_secs(3), Duration::from_secs(10))
        .await;
    let waited = started.elapsed();

    assert!(acquired.is_ok());
    assert!(waited >= Duration::from_secs(1));
    assert!(waited < Duration::from_secs(3));
    assert!(matches!(releaser.await, Ok(Ok(()))));
}

#[tokio::test(start_paused = true)]
async fn cancelled_acquisition_returns_not_acquired_promptly() {
    let store = Arc::new(FakeKeyValueStore::default());
    let holder = manager(&store, "node-a");
    let waiter = manager(&store, "node-b");

    let _held = holder
        .try_acquire("job-42", Duration::ZERO, Duration::from_secs(60))
        .await
        .unwrap_or_else(|_| unreachable!());

    let started = Instant::now();
    let result = waiter
        .try_acquire_until(
            "job-42",
            Duration::from_secs(30),
            Duration::from_secs(60),
            tokio::time::sleep(Duration::from_millis(500)),
        )
        .await;

    assert!(matches!(result, Err(LockError::NotAcquired { .. })));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn store_failures_propagate_without_retrying() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");
    store.unavailable.store(true, Ordering::SeqCst);

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let result = manager
        .run_exclusive(
            "job-42",
            Duration::from_secs(3),
            Duration::from_secs(10),
            || async move {
                flag.store(true, Ordering::SeqCst);
            },
        )
        .await;

    assert!(matches!(result, Err(LockError::StoreUnavailable(_))));
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn release_and_extend_surface_store_outages() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");
    let handle = manager
        .try_acquire("job-42", Duration::ZERO, Duration::from_secs(10))
        .await
        .unwrap_or_else(|_| unreachable!());
    store.unavailable.store(true, Ordering::SeqCst);

    let released = manager.release(&handle).await;
    assert!(matches!(released, Err(LockError::StoreUnavailable(_))));
    let extended = manager.extend(&handle, Duration::from_secs(10)).await;
    assert!(matches!(extended, Err(LockError::StoreUnavailable(_))));

    assert_eq!(store.delete_calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.extend_calls.load(Ordering::SeqCst), 1);
    assert_eq!(manager.held_handles().len(), 1);

    store.unavailable.store(false, Ordering::SeqCst);
    assert!(matches!(manager.release_all().await, Ok(1)));
    assert!(!store.contains("job-42").await);
}

#[tokio::test(start_paused = true)]
async fn handle_expiry_never_runs_past_the_store_record() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");
    store.slow_writes.store(true, Ordering::SeqCst);

    let handle = manager
        .try_acquire("job-42", Duration::ZERO, Duration::from_secs(10))
        .await
        .unwrap_or_else(|_| unreachable!());
    let written_at = store.last_write_at().unwrap_or_else(|| unreachable!());
    assert!(handle.acquired_at() <= written_at);

    let renewed = manager
        .extend(&handle, Duration::from_secs(10))
        .await
        .unwrap_or_else(|_| unreachable!());
    let written_at = store.last_write_at().unwrap_or_else(|| unreachable!());
    assert!(renewed.acquired_at() <= written_at);
}

#[tokio::test(start_paused = true)]
async fn invalid_inputs_are_rejected() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");

    let blank_key = manager
        .try_acquire("  ", Duration::ZERO, Duration::from_secs(1))
        .await;
    assert!(matches!(blank_key, Err(LockError::Validation(_))));

    let zero_lease = manager
        .try_acquire("job-42", Duration::ZERO, Duration::ZERO)
        .await;
    assert!(matches!(zero_lease, Err(LockError::Validation(_))));
    assert!(!store.contains("job-42").await);
}

#[tokio::test(start_paused = true)]
async fn run_exclusive_releases_after_success_and_failure() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");

    let value = manager
        .run_exclusive("job-42", Duration::ZERO, Duration::from_secs(10), || async {
            42_u32
        })
        .await;
    assert!(matches!(value, Ok(42)));
    assert!(!store.contains("job-42").await);

    let failed = manager
        .run_exclusive("job-42", Duration::ZERO, Duration::from_secs(10), || async {
            Err::<u32, String>("work failed".to_owned())
        })
        .await;
    assert!(matches!(failed, Ok(Err(ref message)) if message == "work failed"));
    assert!(!store.contains("job-42").await);
    assert!(manager.held_handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn run_exclusive_skips_work_when_contended() {
    let store = Arc::new(FakeKeyValueStore::default());
    let holder = manager(&store, "node-a");
    let contender = manager(&store, "node-b");
    let _held = holder
        .try_acquire("job-42", Duration::ZERO, Duration::from_secs(10))
        .await
        .unwrap_or_else(|_| unreachable!());

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let result = contender
        .run_exclusive(
            "job-42",
            Duration::from_secs(1),
            Duration::from_secs(10),
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;
    assert!(matches!(result, Err(LockError::NotAcquired { .. })));

    let counter = Arc::clone(&runs);
    let outcome = contender
        .run_exclusive_or_skip(
            "job-42",
            Duration::ZERO,
            Duration::from_secs(10),
            || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;
    assert!(matches!(outcome, Ok(ExecutionOutcome::Skipped)));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert!(store.contains("job-42").await);
}

#[tokio::test(start_paused = true)]
async fn run_exclusive_or_skip_reports_completion() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");

    let outcome = manager
        .run_exclusive_or_skip("job-42", Duration::ZERO, Duration::from_secs(10), || async {})
        .await;
    assert!(matches!(outcome, Ok(ExecutionOutcome::Completed)));
    assert!(!store.contains("job-42").await);
}

#[tokio::test(start_paused = true)]
async fn run_exclusive_surfaces_lease_lost_during_work() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);

    let result = manager
        .run_exclusive(
            "job-42",
            Duration::ZERO,
            Duration::from_millis(300),
            || async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                flag.store(true, Ordering::SeqCst);
            },
        )
        .await;

    assert!(ran.load(Ordering::SeqCst));
    assert!(matches!(result, Err(LockError::AlreadyReleased { .. })));
}

#[tokio::test(start_paused = true)]
async fn renewing_run_outlives_its_initial_lease() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");
    let probe = Arc::clone(&store);

    let result = manager
        .run_exclusive_renewing(
            "report",
            Duration::ZERO,
            Duration::from_millis(300),
            || async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                probe.contains("report").await
            },
        )
        .await;

    assert!(matches!(result, Ok(true)));
    assert!(!store.contains("report").await);
}

#[tokio::test(start_paused = true)]
async fn dropped_run_releases_lock() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");

    let interrupted = tokio::time::timeout(
        Duration::from_millis(100),
        manager.run_exclusive("job-42", Duration::ZERO, Duration::from_secs(30), || {
            tokio::time::sleep(Duration::from_secs(5))
        }),
    )
    .await;
    assert!(interrupted.is_err());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!store.contains("job-42").await);
    assert!(manager.held_handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn interrupted_release_is_not_repeated() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");
    store.delete_delay_ms.store(100, Ordering::SeqCst);

    let interrupted = tokio::time::timeout(
        Duration::from_millis(50),
        manager.run_exclusive("job-42", Duration::ZERO, Duration::from_secs(30), || async {}),
    )
    .await;
    assert!(interrupted.is_err());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.delete_calls.load(Ordering::SeqCst), 1);
    assert!(!store.contains("job-42").await);
    assert!(manager.held_handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn release_all_skips_runs_already_releasing() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");

    let interrupted = tokio::time::timeout(
        Duration::from_millis(100),
        manager.run_exclusive("job-42", Duration::ZERO, Duration::from_secs(30), || {
            tokio::time::sleep(Duration::from_secs(5))
        }),
    )
    .await;
    assert!(interrupted.is_err());

    assert!(matches!(manager.release_all().await, Ok(0)));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(store.delete_calls.load(Ordering::SeqCst), 1);
    assert!(!store.contains("job-42").await);
    assert!(manager.held_handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn panicking_work_still_releases_lock() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");
    let runner = manager.clone();

    let task = tokio::spawn(async move {
        runner
            .run_exclusive::<_, _, ()>("job-42", Duration::ZERO, Duration::from_secs(30), || async {
                panic!("work exploded")
            })
            .await
    });
    assert!(task.await.is_err());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!store.contains("job-42").await);
    assert!(manager.held_handles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn release_all_returns_every_tracked_lock() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");

    for key in ["alpha", "beta", "gamma"] {
        assert!(
            manager
                .try_acquire(key, Duration::ZERO, Duration::from_secs(10))
                .await
                .is_ok()
        );
    }

    let keys: Vec<String> = manager
        .held_handles()
        .iter()
        .map(|handle| handle.key().as_str().to_owned())
        .collect();
    assert_eq!(keys, vec!["alpha", "beta", "gamma"]);

    assert!(matches!(manager.release_all().await, Ok(3)));
    assert!(manager.held_handles().is_empty());
    assert!(!store.contains("beta").await);
}

#[tokio::test(start_paused = true)]
async fn lease_keeper_reports_lost_lease() {
    let store = Arc::new(FakeKeyValueStore::default());
    let manager = manager(&store, "node-a");

    let handle = manager
        .try_acquire("job-42", Duration::ZERO, Duration::from_millis(300))
        .await
        .unwrap_or_else(|_| unreachable!());
    let keeper = LeaseKeeper::spawn(
        manager.clone(),
        handle.clone(),
        Duration::from_millis(100),
        Duration::from_millis(300),
    );

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!keeper.is_lost());
    assert!(keeper.latest().acquired_at() >= handle.acquired_at());

    store.records.lock().await.clear();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(keeper.is_lost());

    let latest = keeper.stop().await;
    assert_eq!(latest.owner_token(), handle.owner_token());
    assert!(manager.held_handles().is_empty());
}
