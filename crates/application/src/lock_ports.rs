use std::time::Duration;

use async_trait::async_trait;
use lockwarden_core::LockResult;

/// Atomic key-value primitives a lock store must provide.
///
/// Every operation must be atomic as observed by all clients of the store,
/// and TTL expiry must be enforced by the store itself.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Writes `value` under `key` with `ttl` only when no live record exists.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> LockResult<bool>;

    /// Deletes `key` only when it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> LockResult<bool>;

    /// Resets the TTL of `key` to `ttl` only when it currently holds `expected`.
    async fn compare_and_extend(&self, key: &str, expected: &str, ttl: Duration)
    -> LockResult<bool>;

    /// Returns the live value stored under `key`.
    async fn current_value(&self, key: &str) -> LockResult<Option<String>>;
}
