//! Handshake error types.
//!
//! Every handshake failure terminates the connection. Each variant maps
//! onto the drop reason reported in the flow record.

use super::state::HandshakeState;
use crate::policy::FlowPolicy;
use crate::telemetry::DropReason;
use crate::token::TokenError;
use thiserror::Error;

/// Reasons a handshake stops short of `Done`.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Peer token malformed, unauthenticated, expired, or out of phase.
    #[error("Invalid token in {state}: {reason}")]
    InvalidToken {
        /// State the failure occurred in.
        state: HandshakeState,
        /// What was wrong.
        reason: String,
    },

    /// Final message malformed or not bound to this handshake.
    #[error("Invalid final message: {0}")]
    InvalidFormat(String),

    /// The peer's identity was refused by policy.
    #[error("Rejected by policy {}", .policy.as_ref().map_or("<none>", |p| p.policy_id.as_str()))]
    PolicyDrop {
        /// Matched reject rule; `None` when no accept rule matched.
        policy: Option<FlowPolicy>,
    },

    /// A read or write exceeded the phase deadline.
    #[error("Handshake timed out in {0}")]
    Timeout(HandshakeState),

    /// A frame exceeded the size limit.
    #[error("Frame of {size} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced frame size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// Peer closed the connection mid-handshake.
    #[error("Connection closed in {0}")]
    ConnectionClosed(HandshakeState),

    /// Socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Our own token could not be minted.
    #[error("Failed to create token: {0}")]
    TokenCreation(#[source] TokenError),

    /// A transition was attempted out of order.
    #[error("Invalid transition from {from}")]
    InvalidTransition {
        /// State the connection was in.
        from: HandshakeState,
    },
}

impl HandshakeError {
    /// Drop reason reported for this failure.
    pub fn drop_reason(&self) -> DropReason {
        match self {
            HandshakeError::InvalidToken { .. } => DropReason::InvalidToken,
            HandshakeError::InvalidFormat(_) => DropReason::InvalidFormat,
            HandshakeError::PolicyDrop { .. } => DropReason::PolicyDrop,
            HandshakeError::Timeout(_) => DropReason::Timeout,
            HandshakeError::FrameTooLarge { .. } => DropReason::InvalidFormat,
            HandshakeError::ConnectionClosed(_)
            | HandshakeError::Io(_)
            | HandshakeError::TokenCreation(_)
            | HandshakeError::InvalidTransition { .. } => DropReason::IoError,
        }
    }

    /// Matched policy carried by a policy drop.
    pub fn policy(&self) -> Option<&FlowPolicy> {
        match self {
            HandshakeError::PolicyDrop { policy } => policy.as_ref(),
            _ => None,
        }
    }
}

/// Result type for handshake operations.
pub type HandshakeResult<T> = Result<T, HandshakeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_reasons() {
        let err = HandshakeError::PolicyDrop {
            policy: Some(FlowPolicy::reject("P2")),
        };
        assert_eq!(err.drop_reason(), DropReason::PolicyDrop);
        assert_eq!(err.policy().unwrap().policy_id, "P2");
        assert!(err.to_string().contains("P2"));

        let err = HandshakeError::PolicyDrop { policy: None };
        assert!(err.to_string().contains("<none>"));

        let err = HandshakeError::Timeout(HandshakeState::ServerReceivePeerToken);
        assert_eq!(err.drop_reason(), DropReason::Timeout);

        let err = HandshakeError::InvalidToken {
            state: HandshakeState::ClientPeerTokenReceive,
            reason: "bad".into(),
        };
        assert_eq!(err.drop_reason(), DropReason::InvalidToken);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: HandshakeError = io_err.into();
        assert_eq!(err.drop_reason(), DropReason::IoError);
    }
}
