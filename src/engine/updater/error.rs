//! Update Error Types

use std::time::Duration;
use thiserror::Error;

use super::auth::AuthOutcome;
use super::store::StoreError;

/// Errors that stop an operation outright.
///
/// Everything below the rollback threshold is an [`UpdateFault`] instead and
/// only ever surfaces as telemetry.
#[derive(Error, Debug)]
pub enum UpdateError {
    #[error("State store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, UpdateError>;

/// Failure taxonomy of the update protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateFault {
    /// Required field missing or unstorable; dropped without a status.
    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("authentication rejected: {0}")]
    AuthenticationRejected(AuthOutcome),

    /// Nothing was flashed; the running firmware stays authoritative.
    #[error("install failed: {0}")]
    InstallFailed(String),

    #[error("self-test failing: {}", .0.join(", "))]
    SelfTestFailing(Vec<String>),

    #[error("self-test timed out after {}s", .elapsed.as_secs())]
    SelfTestTimedOut { elapsed: Duration },

    #[error("boot failure limit exceeded after {attempts} attempts")]
    BootFailureLimitExceeded { attempts: u8 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_propagates() {
        let error = UpdateError::from(StoreError::PowerLoss);
        assert!(error.to_string().starts_with("State store error:"));
    }

    #[test]
    fn test_fault_messages() {
        let fault = UpdateFault::SelfTestFailing(vec!["network".into(), "memory".into()]);
        assert_eq!(fault.to_string(), "self-test failing: network, memory");

        let fault = UpdateFault::SelfTestTimedOut { elapsed: Duration::from_secs(60) };
        assert_eq!(fault.to_string(), "self-test timed out after 60s");
    }
}
