use std::env;
use std::time::Duration;

use lockwarden_application::LockManagerConfig;
use lockwarden_core::{LockError, LockResult};
use lockwarden_domain::BackoffPolicy;
use lockwarden_infrastructure::RedisStoreConfig;

#[derive(Debug, Clone)]
pub enum StoreProviderConfig {
    Memory,
    Redis {
        redis_url: Option<String>,
        settings: RedisStoreConfig,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub store: StoreProviderConfig,
    pub lock: LockManagerConfig,
    pub job_key: String,
    pub job_duration_ms: u64,
    pub poll_interval_ms: u64,
}

impl WorkerConfig {
    pub fn load() -> LockResult<Self> {
        let store = match optional_env("LOCK_STORE")
            .unwrap_or_else(|| "redis".to_owned())
            .as_str()
        {
            "memory" => StoreProviderConfig::Memory,
            "redis" => load_redis_store()?,
            other => {
                return Err(LockError::Validation(format!(
                    "LOCK_STORE must be either 'redis' or 'memory', got '{other}'"
                )));
            }
        };

        let holder_id = optional_env("LOCK_HOLDER_ID")
            .unwrap_or_else(|| format!("lockwarden-{}", std::process::id()));
        let default_lease_ms = parse_env("LOCK_DEFAULT_LEASE_MS", 30_000_u64)?;
        let default_wait_ms = parse_env("LOCK_DEFAULT_WAIT_MS", 5_000_u64)?;
        let initial_backoff_ms = parse_env("LOCK_INITIAL_BACKOFF_MS", 50_u64)?;
        let max_backoff_ms = parse_env("LOCK_MAX_BACKOFF_MS", 1_000_u64)?;

        let lock = LockManagerConfig {
            holder_id,
            default_lease: Duration::from_millis(default_lease_ms),
            default_wait_timeout: Duration::from_millis(default_wait_ms),
            backoff: BackoffPolicy::new(
                Duration::from_millis(initial_backoff_ms),
                Duration::from_millis(max_backoff_ms),
                2,
            )?,
        };
        lock.validate()?;

        let job_key = optional_env("WORKER_JOB_KEY").unwrap_or_else(|| "job".to_owned());
        let job_duration_ms = parse_env("WORKER_JOB_DURATION_MS", 500_u64)?;
        let poll_interval_ms = parse_env("WORKER_POLL_INTERVAL_MS", 1_500_u64)?;

        if poll_interval_ms == 0 {
            return Err(LockError::Validation(
                "WORKER_POLL_INTERVAL_MS must be greater than zero".to_owned(),
            ));
        }

        if job_duration_ms >= default_lease_ms {
            return Err(LockError::Validation(
                "WORKER_JOB_DURATION_MS must be shorter than LOCK_DEFAULT_LEASE_MS".to_owned(),
            ));
        }

        Ok(Self {
            store,
            lock,
            job_key,
            job_duration_ms,
            poll_interval_ms,
        })
    }
}

fn load_redis_store() -> LockResult<StoreProviderConfig> {
    let defaults = RedisStoreConfig::default();
    let settings = RedisStoreConfig {
        host: optional_env("REDIS_HOST").unwrap_or(defaults.host),
        port: parse_env("REDIS_PORT", defaults.port)?,
        database: parse_env("REDIS_DATABASE", defaults.database)?,
        username: optional_env("REDIS_USERNAME"),
        password: optional_env("REDIS_PASSWORD"),
        pool_size: parse_env("REDIS_POOL_SIZE", defaults.pool_size)?,
        key_prefix: env::var("LOCK_KEY_PREFIX").unwrap_or(defaults.key_prefix),
    };
    settings.validate()?;

    Ok(StoreProviderConfig::Redis {
        redis_url: optional_env("REDIS_URL"),
        settings,
    })
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_env<T>(name: &str, default: T) -> LockResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value.trim().parse::<T>().map_err(|error| {
            LockError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}
