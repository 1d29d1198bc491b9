//! Lifecycle of one acquisition attempt.

use lockwarden_core::{LockError, LockResult};

use crate::LockKey;

/// State of a single acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcquisitionState {
    /// Attempt created, store not contacted yet.
    Idle,
    /// Retrying set-if-absent against the store.
    Acquiring,
    /// Lease granted and not yet released.
    Held,
    /// Compare-and-delete in flight.
    Releasing,
    /// Lease given back. Terminal.
    Released,
    /// Wait budget exhausted or acquisition failed. Terminal.
    NotAcquired,
}

impl AcquisitionState {
    /// Returns the stable lowercase label used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Acquiring => "acquiring",
            Self::Held => "held",
            Self::Releasing => "releasing",
            Self::Released => "released",
            Self::NotAcquired => "not_acquired",
        }
    }

    /// Returns whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Released | Self::NotAcquired)
    }

    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Acquiring)
                | (Self::Acquiring, Self::Held)
                | (Self::Acquiring, Self::NotAcquired)
                | (Self::Held, Self::Releasing)
                | (Self::Releasing, Self::Released)
        )
    }
}

/// Tracks one attempt from `Idle` to a terminal state.
///
/// Reaching `Held` again after a terminal state requires a new attempt, and
/// with it a new owner token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAttempt {
    key: LockKey,
    state: AcquisitionState,
}

impl LockAttempt {
    /// Starts a new attempt in the `Idle` state.
    #[must_use]
    pub fn new(key: LockKey) -> Self {
        Self {
            key,
            state: AcquisitionState::Idle,
        }
    }

    /// Returns the key this attempt targets.
    #[must_use]
    pub fn key(&self) -> &LockKey {
        &self.key
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Moves to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: AcquisitionState) -> LockResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(LockError::Validation(format!(
                "lock attempt for '{}' cannot move from {} to {}",
                self.key,
                self.state.as_str(),
                next.as_str()
            )));
        }

        self.state = next;
        Ok(())
    }
}
