//! Error types for desync-discovery
//!
//! Probe failures are not errors here: they are recorded as a
//! [`crate::FailureMode`] on the trial and steer the search. These variants
//! cover the cases where a run cannot start or cannot be looked up.

use thiserror::Error;
use uuid::Uuid;

/// Discovery error
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// No run with this id is registered
    #[error("Unknown discovery run: {0}")]
    UnknownRun(Uuid),

    /// Target hostname is empty or malformed
    #[error("Invalid target host '{0}'")]
    InvalidHost(String),

    /// The configuration handle rejected a trial configuration
    #[error("Actuator error: {0}")]
    Actuator(#[from] desync_core::Error),

    /// Probe client could not be set up
    #[error("Network error: {0}")]
    Network(String),
}

/// Result type alias for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Check that `host` looks like a DNS name
pub(crate) fn validate_host(host: &str) -> Result<String> {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    let valid = !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        });
    if valid {
        Ok(host)
    } else {
        Err(DiscoveryError::InvalidHost(host))
    }
}
