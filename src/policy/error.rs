//! Policy error types.

use thiserror::Error;

/// Errors raised while installing or looking up policy.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// An ACL port specification could not be parsed.
    #[error("Invalid port range '{0}'")]
    InvalidPorts(String),

    /// No context is registered under this ID.
    #[error("Unknown context: {0}")]
    UnknownContext(String),
}

/// Result type for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;
