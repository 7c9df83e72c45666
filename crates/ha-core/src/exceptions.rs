//! Outcome of setting up a config entry

use thiserror::Error;

/// Why a config entry could not be set up
///
/// The setup layer decides what happens next from the variant: retry later
/// with backoff, ask the user to re-authenticate, or give up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigEntryError {
    /// The device or service is unreachable right now; retry setup later
    #[error("config entry not ready: {0}")]
    NotReady(String),

    /// Credentials were rejected; do not retry on a timer
    #[error("config entry authentication failed: {0}")]
    AuthFailed(String),

    /// Setup failed for a reason retrying will not fix
    #[error("config entry setup failed: {0}")]
    Failed(String),
}

impl ConfigEntryError {
    /// Whether the failure should trigger a re-authentication flow
    pub fn is_auth_failed(&self) -> bool {
        matches!(self, ConfigEntryError::AuthFailed(_))
    }

    /// Whether setup should be retried later
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConfigEntryError::NotReady(_))
    }
}
