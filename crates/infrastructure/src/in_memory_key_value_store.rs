use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use lockwarden_application::KeyValueStore;
use lockwarden_core::LockResult;
use tokio::sync::Mutex;
use tokio::time::Instant;


#[derive(Debug, Clone)]
struct LockRecordEntry {
    value: String,
    expires_at: Instant,
}

/// In-memory lock store for tests and single-process deployments.
///
/// One mutex guards every record, which makes each operation atomic for all
/// callers sharing the instance.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, LockRecordEntry>>,
}

impl InMemoryKeyValueStore {
    /// Creates an empty in-memory lock store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live records.
    pub async fn live_records(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }
}

fn live_entry<'a>(
    entries: &'a mut HashMap<String, LockRecordEntry>,
    key: &str,
) -> Option<&'a mut LockRecordEntry> {
    if entries
        .get(key)
        .is_some_and(|entry| entry.expires_at <= Instant::now())
    {
        entries.remove(key);
    }

    entries.get_mut(key)
}

fn expiry_after(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> LockResult<bool> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        if entries.contains_key(key) {
            return Ok(false);
        }

        entries.insert(
            key.to_owned(),
            LockRecordEntry {
                value: value.to_owned(),
                expires_at: expiry_after(ttl),
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> LockResult<bool> {
        let mut entries = self.entries.lock().await;
        if !live_entry(&mut entries, key).is_some_and(|entry| entry.value == expected) {
            return Ok(false);
        }

        entries.remove(key);
        Ok(true)
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> LockResult<bool> {
        let mut entries = self.entries.lock().await;
        match live_entry(&mut entries, key) {
            Some(entry) if entry.value == expected => {
                entry.expires_at = expiry_after(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_value(&self, key: &str) -> LockResult<Option<String>> {
        let mut entries = self.entries.lock().await;
        Ok(live_entry(&mut entries, key).map(|entry| entry.value.clone()))
    }
}
