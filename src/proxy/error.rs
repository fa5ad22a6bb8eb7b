//! Error types for proxy operations.
//!
//! This module defines structured error types for the enforcing proxy:
//! - Listener errors (binding, accept)
//! - Destination errors (original destination lookup, upstream dial)
//! - Handshake failures, already reported as flow records

use crate::handshake::HandshakeError;
use std::net::SocketAddr;
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error on an accepted or dialed socket.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to bind the listener.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The connection's original destination could not be determined.
    #[error("No original destination for connection on {local}: {message}")]
    OriginalDestination {
        /// Local address of the accepted socket.
        local: SocketAddr,
        /// What went wrong.
        message: String,
    },

    /// Failed to connect to the destination.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: SocketAddr,
        /// Error message.
        message: String,
    },

    /// The context this proxy enforces is no longer registered.
    #[error("Context '{0}' is not enforced")]
    MissingContext(String),

    /// Refused by an address ACL before any handshake.
    #[error("Refused by ACL policy {0}")]
    AclDrop(String),

    /// The handshake failed.
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Server shutdown requested.
    #[error("Server shutdown")]
    Shutdown,
}

impl ProxyError {
    /// Whether this is the peer going away rather than a fault worth a
    /// warning.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => super::relay::is_disconnect(e),
            ProxyError::Handshake(HandshakeError::Io(e)) => super::relay::is_disconnect(e),
            ProxyError::Handshake(HandshakeError::ConnectionClosed(_)) => true,
            _ => false,
        }
    }
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
