//! Config entry lifecycle
//!
//! ```text
//! NotLoaded → SetupInProgress → Loaded
//!                             ↘ SetupError → SetupInProgress (manual retry)
//!                             ↘ SetupRetry → SetupInProgress (scheduled retry)
//!
//! Loaded / SetupError / SetupRetry → UnloadInProgress → NotLoaded
//!                                                     ↘ FailedUnload (terminal)
//! ```

use std::time::Duration;

use crate::entry::ConfigEntryState;
use thiserror::Error;

/// Delay before the first setup retry
const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);

/// Retry delays stop growing after this many doublings
const RETRY_MAX_EXPONENT: u32 = 4;

/// Upper bound of the random jitter added to every retry delay
const RETRY_MAX_JITTER_MS: u64 = 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid state transition from {from:?} to {to:?}: {reason}")]
pub struct InvalidTransition {
    pub from: ConfigEntryState,
    pub to: ConfigEntryState,
    pub reason: &'static str,
}

impl ConfigEntryState {
    /// States reachable in one step
    pub fn successors(self) -> &'static [ConfigEntryState] {
        use ConfigEntryState::*;

        match self {
            NotLoaded => &[SetupInProgress],
            SetupInProgress => &[Loaded, SetupError, SetupRetry],
            SetupError | SetupRetry => &[SetupInProgress, UnloadInProgress],
            Loaded => &[UnloadInProgress],
            UnloadInProgress => &[NotLoaded, FailedUnload],
            FailedUnload => &[],
        }
    }

    /// Validate a transition, returning the target state
    pub fn try_transition(self, to: ConfigEntryState) -> Result<ConfigEntryState, InvalidTransition> {
        if self.successors().contains(&to) {
            return Ok(to);
        }
        Err(InvalidTransition {
            from: self,
            to,
            reason: self.rejection_reason(to),
        })
    }

    pub fn can_transition_to(self, to: ConfigEntryState) -> bool {
        self.successors().contains(&to)
    }

    fn rejection_reason(self, to: ConfigEntryState) -> &'static str {
        use ConfigEntryState::*;

        match (self, to) {
            (FailedUnload, _) => "FailedUnload is terminal",
            (SetupInProgress, _) => "setup must finish first",
            (UnloadInProgress, _) => "unload must finish first",
            (Loaded, SetupInProgress) => "already loaded, unload first",
            (_, Loaded) => "entries are loaded through SetupInProgress",
            (_, NotLoaded) => "entries are unloaded through UnloadInProgress",
            _ => "not a lifecycle step",
        }
    }
}

/// Backoff before retrying a setup that was not ready
///
/// `tries` counts earlier not-ready attempts: 5s, 10s, 20s, 40s, then 80s
/// for every later attempt, each plus up to 100ms of jitter.
pub fn calculate_retry_delay(tries: u32) -> Duration {
    let base = RETRY_BASE_DELAY * 2_u32.pow(tries.min(RETRY_MAX_EXPONENT));
    let jitter = Duration::from_millis(rand::random::<u64>() % (RETRY_MAX_JITTER_MS + 1));
    base + jitter
}
