//! Handshake states.
//!
//! ```text
//! Client: ClientTokenSend -> ClientPeerTokenReceive -> ClientSendSignedPair -> Done
//! Server: ServerReceivePeerToken -> ServerSendToken -> ServerAuthenticatePair -> Done
//! ```
//!
//! Both chains are linear. There are no backward transitions; a failure in
//! any state ends the connection.

use std::fmt;

/// Which side of the handshake a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Initiator: sends Syn and Ack.
    Client,
    /// Acceptor: sends SynAck.
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Per-connection handshake state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Build and send the Syn token.
    ClientTokenSend,
    /// Read and evaluate the SynAck token.
    ClientPeerTokenReceive,
    /// Build and send the Ack token.
    ClientSendSignedPair,
    /// Read and evaluate the Syn token.
    ServerReceivePeerToken,
    /// Build and send the SynAck token.
    ServerSendToken,
    /// Read and verify the Ack token.
    ServerAuthenticatePair,
    /// Handshake complete; the connection is relayed unmediated.
    Done,
}

impl HandshakeState {
    /// Starting state for a role.
    pub fn initial(role: Role) -> Self {
        match role {
            Role::Client => HandshakeState::ClientTokenSend,
            Role::Server => HandshakeState::ServerReceivePeerToken,
        }
    }

    /// The single successor of this state, `None` for `Done`.
    pub fn next(self) -> Option<Self> {
        use HandshakeState::*;
        match self {
            ClientTokenSend => Some(ClientPeerTokenReceive),
            ClientPeerTokenReceive => Some(ClientSendSignedPair),
            ClientSendSignedPair => Some(Done),
            ServerReceivePeerToken => Some(ServerSendToken),
            ServerSendToken => Some(ServerAuthenticatePair),
            ServerAuthenticatePair => Some(Done),
            Done => None,
        }
    }

    /// Whether the handshake has completed.
    pub fn is_done(self) -> bool {
        self == HandshakeState::Done
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
