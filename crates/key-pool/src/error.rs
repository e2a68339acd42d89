//! Terminal errors surfaced by the resilient wrapper

use provider::ProviderError;

/// Errors that cross the key-pool boundary.
///
/// Per-attempt failures (quota, auth, transport) are handled inside the retry
/// loop; only these two outcomes reach the caller.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no API key available for {operation}")]
    NoCredentialAvailable { operation: &'static str },

    #[error("{operation} failed after {attempts} attempt(s): {last}")]
    RetryBudgetExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: ProviderError,
    },
}

impl Error {
    /// Whether the final failure was a quota error.
    pub fn is_quota(&self) -> bool {
        match self {
            Error::NoCredentialAvailable { .. } => false,
            Error::RetryBudgetExhausted { last, .. } => last.classification().is_quota(),
        }
    }

    /// Name of the operation that failed.
    pub fn operation(&self) -> &'static str {
        match self {
            Error::NoCredentialAvailable { operation }
            | Error::RetryBudgetExhausted { operation, .. } => operation,
        }
    }
}

/// Result alias for wrapped operations.
pub type Result<T> = std::result::Result<T, Error>;
