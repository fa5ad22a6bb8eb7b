//! Enforcer error types.

use crate::config::ConfigError;
use crate::policy::PolicyError;
use crate::proxy::ProxyError;
use thiserror::Error;

/// Errors raised while starting, updating, or stopping the enforcer.
#[derive(Debug, Error)]
pub enum EnforcerError {
    /// Configuration could not be turned into policy or keys.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Registry operation failed.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// A proxy failed to bind or exited with an error.
    #[error("Proxy for context '{context_id}' failed: {source}")]
    Proxy {
        /// Context the proxy enforces.
        context_id: String,
        /// The underlying proxy error.
        #[source]
        source: ProxyError,
    },

    /// Two contexts advertise the same service port.
    #[error("Context '{context_id}' advertises port {port}, already served by '{owner}'")]
    PortConflict {
        /// Service port in dispute.
        port: u16,
        /// Context being enforced or updated.
        context_id: String,
        /// Context already advertising the port.
        owner: String,
    },

    /// Nothing to enforce.
    #[error("No contexts configured")]
    NoContexts,

    /// A proxy task panicked or was cancelled.
    #[error("Proxy task for context '{0}' did not finish cleanly")]
    TaskFailed(String),
}

/// Result type for enforcer operations.
pub type EnforcerResult<T> = Result<T, EnforcerError>;
