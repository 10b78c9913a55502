//! Error taxonomy for the fleet core.
//!
//! [`CloudError`] is what the cloud collaborators report; the credential
//! manager classifies it and surfaces a [`FleetError`] to callers.
//! `FleetError` is `Clone` so one refresh outcome can be handed to every
//! caller waiting on the same flight.

use std::time::Duration;
use thiserror::Error;

/// Failure reported by a cloud collaborator (auth or device list).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CloudError {
    /// Network failure, timeout, 408 or 5xx. Worth retrying.
    #[error("transient cloud failure: {0}")]
    Transient(String),
    /// The server refused the presented credential (401/403, or 400 from a token endpoint).
    #[error("credential rejected: {0}")]
    Rejected(String),
    /// The server asked us to slow down (429).
    #[error("rate limited by cloud (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// The server answered but the payload or status could not be used.
    #[error("invalid cloud response: {0}")]
    InvalidResponse(String),
}

impl CloudError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CloudError::Transient(_))
    }
}

/// Errors surfaced by the fleet core to its callers.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FleetError {
    /// Retryable network failure; the stored credential is untouched.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The refresh token was rejected; a full login is needed.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// No credential path remains; fresh login credentials must be supplied.
    #[error("re-authentication required")]
    ReauthenticationRequired,

    /// The cloud rate limited the refresh; back off longer than usual.
    #[error("refresh rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// Local probing failed. Cloud data remains usable.
    #[error("local discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FleetError {
    /// Whether the caller may simply try again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::Transient(_) | FleetError::RateLimited { .. }
        )
    }
}

impl From<CloudError> for FleetError {
    fn from(e: CloudError) -> Self {
        match e {
            CloudError::Transient(msg) => FleetError::Transient(msg),
            CloudError::Rejected(msg) => FleetError::AuthRejected(msg),
            CloudError::RateLimited { retry_after } => FleetError::RateLimited { retry_after },
            CloudError::InvalidResponse(msg) => FleetError::Transient(msg),
        }
    }
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;
