//! Redis-backed key-value store for distributed lock records.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lockwarden_application::KeyValueStore;
use lockwarden_core::{LockError, LockResult};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;


const COMPARE_AND_DELETE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

const COMPARE_AND_EXTEND_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

/// Connection settings for [`RedisKeyValueStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStoreConfig {
    /// Redis server host name or address.
    pub host: String,
    /// Redis server port.
    pub port: u16,
    /// Logical database index.
    pub database: i64,
    /// ACL user name, if any.
    pub username: Option<String>,
    /// Password, if any.
    pub password: Option<String>,
    /// Number of multiplexed connections kept open.
    pub pool_size: usize,
    /// Namespace prepended to every lock key.
    pub key_prefix: String,
}

impl RedisStoreConfig {
    /// Builds the `redis://` connection URL.
    #[must_use]
    pub fn connection_url(&self) -> String {
        let credentials = match (self.username.as_deref(), self.password.as_deref()) {
            (Some(username), Some(password)) => format!("{username}:{password}@"),
            (Some(username), None) => format!("{username}@"),
            (None, Some(password)) => format!(":{password}@"),
            (None, None) => String::new(),
        };

        format!(
            "redis://{credentials}{}:{}/{}",
            self.host, self.port, self.database
        )
    }

    /// Validates pool size, host and database index.
    pub fn validate(&self) -> LockResult<()> {
        if self.host.trim().is_empty() {
            return Err(LockError::Validation(
                "redis host must not be empty".to_owned(),
            ));
        }

        if self.pool_size == 0 {
            return Err(LockError::Validation(
                "redis pool_size must be greater than zero".to_owned(),
            ));
        }

        if self.database < 0 {
            return Err(LockError::Validation(
                "redis database index must not be negative".to_owned(),
            ));
        }

        Ok(())
    }
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 6379,
            database: 0,
            username: None,
            password: None,
            pool_size: 10,
            key_prefix: "lockwarden".to_owned(),
        }
    }
}

/// Redis implementation of the lock store port.
///
/// Acquisition uses `SET NX PX` so the record and its TTL appear atomically;
/// token-guarded mutations run as Lua scripts.
pub struct RedisKeyValueStore {
    connections: Vec<ConnectionManager>,
    next_connection: AtomicUsize,
    key_prefix: String,
}

impl RedisKeyValueStore {
    /// Opens `pool_size` managed connections to the configured server.
    pub async fn connect(config: &RedisStoreConfig) -> LockResult<Self> {
        config.validate()?;

        let store = Self::connect_url(
            config.connection_url().as_str(),
            config.pool_size,
            config.key_prefix.as_str(),
        )
        .await?;

        info!(
            host = %config.host,
            port = config.port,
            database = config.database,
            pool_size = config.pool_size,
            "connected redis lock store"
        );

        Ok(store)
    }

    /// Opens `pool_size` managed connections to an explicit `redis://` URL.
    pub async fn connect_url(
        redis_url: &str,
        pool_size: usize,
        key_prefix: impl Into<String>,
    ) -> LockResult<Self> {
        if pool_size == 0 {
            return Err(LockError::Validation(
                "redis pool_size must be greater than zero".to_owned(),
            ));
        }

        let client = redis::Client::open(redis_url)
            .map_err(|error| LockError::Validation(format!("invalid redis url: {error}")))?;

        let mut connections = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let connection = ConnectionManager::new(client.clone())
                .await
                .map_err(|error| {
                    LockError::StoreUnavailable(format!("failed to connect to redis: {error}"))
                })?;
            connections.push(connection);
        }

        Ok(Self {
            connections,
            next_connection: AtomicUsize::new(0),
            key_prefix: key_prefix.into(),
        })
    }

    fn key_for(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            return key.to_owned();
        }

        format!("{}:{key}", self.key_prefix)
    }

    fn connection(&self) -> LockResult<ConnectionManager> {
        let index = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections
            .get(index % self.connections.len().max(1))
            .cloned()
            .ok_or_else(|| LockError::Internal("redis connection pool is empty".to_owned()))
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> LockResult<bool> {
        let key = self.key_for(key);
        let ttl_millis = ttl_millis(ttl)?;
        let mut connection = self.connection()?;

        let stored: Option<String> = redis::cmd("SET")
            .arg(key.as_str())
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis)
            .query_async(&mut connection)
            .await
            .map_err(|error| {
                LockError::StoreUnavailable(format!("failed to acquire lock record: {error}"))
            })?;

        Ok(stored.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> LockResult<bool> {
        let key = self.key_for(key);
        let script = Script::new(COMPARE_AND_DELETE_SCRIPT);
        let mut connection = self.connection()?;

        let deleted = script
            .key(key)
            .arg(expected)
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                LockError::StoreUnavailable(format!("failed to release lock record: {error}"))
            })?;

        Ok(deleted > 0)
    }

    async fn compare_and_extend(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> LockResult<bool> {
        let key = self.key_for(key);
        let ttl_millis = ttl_millis(ttl)?;
        let script = Script::new(COMPARE_AND_EXTEND_SCRIPT);
        let mut connection = self.connection()?;

        let extended = script
            .key(key)
            .arg(expected)
            .arg(ttl_millis)
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                LockError::StoreUnavailable(format!("failed to extend lock record: {error}"))
            })?;

        Ok(extended > 0)
    }

    async fn current_value(&self, key: &str) -> LockResult<Option<String>> {
        let key = self.key_for(key);
        let mut connection = self.connection()?;

        connection
            .get::<_, Option<String>>(key.as_str())
            .await
            .map_err(|error| {
                LockError::StoreUnavailable(format!("failed to read lock record: {error}"))
            })
    }
}

fn ttl_millis(ttl: Duration) -> LockResult<u64> {
    let millis = u64::try_from(ttl.as_millis())
        .map_err(|error| LockError::Validation(format!("lock ttl is too large: {error}")))?;

    if millis == 0 {
        return Err(LockError::Validation(
            "lock ttl must be at least one millisecond".to_owned(),
        ));
    }

    Ok(millis)
}
