//! Per-connection handshake record.

use super::error::{HandshakeError, HandshakeResult};
use super::state::{HandshakeState, Role};
use crate::policy::FlowPolicy;
use crate::tags::TagSet;
use crate::telemetry::{DropReason, Endpoint, FlowRecord};
use crate::token::new_nonce;
use bytes::BytesMut;
use ed25519_dalek::VerifyingKey;
use std::net::SocketAddr;
use uuid::Uuid;

/// State carried by one connection from accept (or dial) until the
/// handshake ends.
///
/// Owned by exactly one worker task and never shared.
#[derive(Debug)]
pub struct Connection {
    flow_id: Uuid,
    role: Role,
    state: HandshakeState,
    source: SocketAddr,
    destination: SocketAddr,
    pub(crate) buffer: BytesMut,
    pub(crate) local_nonce: Vec<u8>,
    pub(crate) peer_nonce: Option<Vec<u8>>,
    pub(crate) peer_key: Option<VerifyingKey>,
    pub(crate) peer_tags: TagSet,
    pub(crate) policy: Option<FlowPolicy>,
}

impl Connection {
    /// New connection in the role's initial state.
    ///
    /// `source` is the initiator's address, `destination` the address it
    /// dialed.
    pub fn new(role: Role, source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            flow_id: Uuid::new_v4(),
            role,
            state: HandshakeState::initial(role),
            source,
            destination,
            buffer: BytesMut::new(),
            local_nonce: new_nonce(),
            peer_nonce: None,
            peer_key: None,
            peer_tags: TagSet::new(),
            policy: None,
        }
    }

    /// Correlation ID for logs and flow records.
    pub fn flow_id(&self) -> Uuid {
        self.flow_id
    }

    /// Side of the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Connection initiator.
    pub fn source(&self) -> SocketAddr {
        self.source
    }

    /// Connection target.
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Port the initiator dialed, appended to peer tags before evaluation.
    pub fn destination_port(&self) -> u16 {
        self.destination.port()
    }

    /// Peer tags the decision was made on.
    pub fn peer_tags(&self) -> &TagSet {
        &self.peer_tags
    }

    /// Policy matched during evaluation.
    pub fn policy(&self) -> Option<&FlowPolicy> {
        self.policy.as_ref()
    }

    /// Move to the next state.
    pub(crate) fn advance(&mut self) -> HandshakeResult<()> {
        self.state = self
            .state
            .next()
            .ok_or(HandshakeError::InvalidTransition { from: self.state })?;
        Ok(())
    }

    /// Drain bytes received after the final handshake frame.
    pub fn take_buffered(&mut self) -> BytesMut {
        self.buffer.split()
    }

    fn endpoints(&self, context_id: &str) -> (Endpoint, Endpoint) {
        match self.role {
            Role::Client => (
                Endpoint::workload(Some(context_id.to_string()), self.source),
                Endpoint::workload(None, self.destination),
            ),
            Role::Server => (
                Endpoint::workload(None, self.source),
                Endpoint::workload(Some(context_id.to_string()), self.destination),
            ),
        }
    }

    /// Flow record for a completed handshake.
    pub fn accepted_record(&self, context_id: &str, annotations: &TagSet) -> FlowRecord {
        let (source, destination) = self.endpoints(context_id);
        FlowRecord::accepted(
            self.flow_id,
            context_id,
            source,
            destination,
            self.peer_tags.merged_with(annotations),
            self.policy.as_ref(),
        )
    }

    /// Flow record for a refused connection.
    pub fn rejected_record(
        &self,
        context_id: &str,
        annotations: &TagSet,
        reason: DropReason,
        policy: Option<&FlowPolicy>,
    ) -> FlowRecord {
        let (source, destination) = self.endpoints(context_id);
        FlowRecord::rejected(
            self.flow_id,
            context_id,
            source,
            destination,
            self.peer_tags.merged_with(annotations),
            reason,
            policy,
        )
    }
}
