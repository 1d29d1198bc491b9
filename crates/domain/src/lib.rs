//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod attempt;
mod backoff;
mod lock;

pub use attempt::{AcquisitionState, LockAttempt};
pub use backoff::{BackoffPolicy, DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF};
pub use lock::{LockHandle, LockKey, OwnerToken, validate_lease_duration};
