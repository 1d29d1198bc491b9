//! Application services and ports.

#![forbid(unsafe_code)]

mod lock_ports;
mod lock_service;

pub use lock_ports::KeyValueStore;
pub use lock_service::{
    DEFAULT_LEASE_DURATION, DEFAULT_WAIT_TIMEOUT, ExecutionOutcome, LeaseKeeper, LockManager,
    LockManagerConfig,
};
