//! Compute provider error types.

use std::time::Duration;

use thiserror::Error;

/// Error code returned when a dry-run request would have been permitted.
pub const DRY_RUN_PERMITTED: &str = "DryRunOperation";

/// Error code prefix for instance ids the provider does not know.
pub const INSTANCE_NOT_FOUND: &str = "InvalidInstanceID.NotFound";

/// Compute provider errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The client for a region could not be built.
    #[error("provider client for region {region:?}: {message}")]
    Config { region: String, message: String },

    /// The provider rejected the request.
    #[error("{operation} rejected ({code}): {message}")]
    Rejected {
        operation: &'static str,
        code: String,
        message: String,
    },

    /// The request never produced a service response.
    #[error("{operation} failed: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    /// The call did not complete within its deadline.
    #[error("{operation} did not complete within {limit:?}")]
    Timeout {
        operation: &'static str,
        limit: Duration,
    },
}

impl ProviderError {
    /// The provider error code, when it sent one.
    pub fn code(&self) -> Option<&str> {
        match self {
            ProviderError::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }

    /// A dry-run probe that reports the real call would succeed.
    pub fn is_dry_run_permitted(&self) -> bool {
        self.code() == Some(DRY_RUN_PERMITTED)
    }

    /// The instance is already gone.
    pub fn is_not_found(&self) -> bool {
        self.code()
            .is_some_and(|code| code.starts_with(INSTANCE_NOT_FOUND))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;
