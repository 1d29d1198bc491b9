//! Lockwarden worker runtime.
//!
//! Periodically runs one job under a distributed lock so that only one
//! worker in the fleet executes it at a time.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use lockwarden_application::{ExecutionOutcome, KeyValueStore, LockManager};
use lockwarden_core::{LockError, LockResult};
use lockwarden_infrastructure::{InMemoryKeyValueStore, RedisKeyValueStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::{StoreProviderConfig, WorkerConfig};

#[tokio::main]
async fn main() -> Result<(), LockError> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = WorkerConfig::load()?;
    let store = connect_store(&config).await?;
    let manager = LockManager::new(store, config.lock.clone())?;

    info!(
        holder_id = %config.lock.holder_id,
        job_key = %config.job_key,
        lease_ms = duration_millis(config.lock.default_lease),
        wait_ms = duration_millis(config.lock.default_wait_timeout),
        poll_interval_ms = config.poll_interval_ms,
        "lockwarden-worker started"
    );

    let mut executed_runs = 0_u64;
    let mut skipped_runs = 0_u64;

    loop {
        tokio::select! {
            () = shutdown_signal() => break,
            outcome = run_job_once(&manager, &config) => {
                match outcome {
                    Ok(ExecutionOutcome::Completed) => {
                        executed_runs = executed_runs.saturating_add(1);
                        info!(
                            job_key = %config.job_key,
                            executed_runs,
                            "exclusive job completed"
                        );
                    }
                    Ok(ExecutionOutcome::Skipped) => {
                        skipped_runs = skipped_runs.saturating_add(1);
                    }
                    Err(error) => {
                        warn!(job_key = %config.job_key, error = %error, "exclusive job failed");
                    }
                }
            }
        }

        tokio::select! {
            () = shutdown_signal() => break,
            () = tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)) => {}
        }
    }

    match manager.release_all().await {
        Ok(released) => info!(
            released,
            executed_runs, skipped_runs, "lockwarden-worker stopped"
        ),
        Err(error) => warn!(error = %error, "failed to release held locks on shutdown"),
    }

    Ok(())
}

async fn connect_store(config: &WorkerConfig) -> LockResult<Arc<dyn KeyValueStore>> {
    match &config.store {
        StoreProviderConfig::Memory => {
            warn!("using in-memory lock store, locks are not shared across processes");
            Ok(Arc::new(InMemoryKeyValueStore::new()))
        }
        StoreProviderConfig::Redis {
            redis_url: Some(redis_url),
            settings,
        } => {
            let store = RedisKeyValueStore::connect_url(
                redis_url.as_str(),
                settings.pool_size,
                settings.key_prefix.as_str(),
            )
            .await?;
            Ok(Arc::new(store))
        }
        StoreProviderConfig::Redis {
            redis_url: None,
            settings,
        } => Ok(Arc::new(RedisKeyValueStore::connect(settings).await?)),
    }
}

async fn run_job_once(
    manager: &LockManager,
    config: &WorkerConfig,
) -> LockResult<ExecutionOutcome> {
    let job_duration = Duration::from_millis(config.job_duration_ms);
    let job_key = config.job_key.clone();

    manager
        .run_exclusive_or_skip(
            config.job_key.as_str(),
            manager.config().default_wait_timeout,
            manager.config().default_lease,
            || async move {
                info!(job_key = %job_key, "running exclusive job");
                tokio::time::sleep(job_duration).await;
            },
        )
        .await
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
