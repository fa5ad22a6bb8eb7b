//! Token error types.

use thiserror::Error;

/// Errors from token creation and verification.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Token bytes could not be decoded.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// No trusted key verifies the signature.
    #[error("Token signature not verified by any trusted key")]
    Unauthenticated,

    /// The claims expiry is in the past.
    #[error("Token expired at {0}")]
    Expired(chrono::DateTime<chrono::Utc>),

    /// Claims could not be serialized or parsed.
    #[error("Claims serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Envelope encoding failed.
    #[error("Envelope encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// A key could not be parsed.
    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

/// Result type for token operations.
pub type TokenResult<T> = Result<T, TokenError>;
