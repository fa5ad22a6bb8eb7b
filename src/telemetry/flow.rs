//! Flow records: one per connection reaching a terminal state.

use crate::policy::{Action, FlowPolicy};
use crate::tags::TagSet;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropReason {
    /// A reject rule matched, or no accept rule matched.
    PolicyDrop,
    /// Token malformed, unauthenticated, or expired.
    InvalidToken,
    /// Final handshake message malformed or not bound to this connection.
    InvalidFormat,
    /// A handshake read or write exceeded its deadline.
    Timeout,
    /// Socket error.
    IoError,
    /// No context registered for the connection.
    MissingContext,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::PolicyDrop => "policy-drop",
            DropReason::InvalidToken => "invalid-token",
            DropReason::InvalidFormat => "invalid-format",
            DropReason::Timeout => "timeout",
            DropReason::IoError => "io-error",
            DropReason::MissingContext => "missing-context",
        };
        f.write_str(s)
    }
}

/// Whether an endpoint is an enforced workload or a bare address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    /// An enforced processing unit.
    Workload,
    /// An address outside enforcement.
    External,
}

/// One side of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    /// Context ID (workloads) or policy ID (external), when known.
    pub id: Option<String>,
    /// Socket address.
    pub addr: SocketAddr,
    /// Endpoint type.
    #[serde(rename = "type")]
    pub kind: EndpointType,
}

impl Endpoint {
    /// A workload endpoint.
    pub fn workload(id: Option<String>, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            kind: EndpointType::Workload,
        }
    }

    /// An external-address endpoint.
    pub fn external(addr: SocketAddr) -> Self {
        Self {
            id: None,
            addr,
            kind: EndpointType::External,
        }
    }
}

/// Immutable report of one connection's authorization outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowRecord {
    /// Correlates log lines for one connection.
    pub flow_id: Uuid,
    /// Context that enforced the decision.
    pub context_id: String,
    /// Connection initiator.
    pub source: Endpoint,
    /// Connection target.
    pub destination: Endpoint,
    /// Peer tags the decision was made on.
    pub tags: TagSet,
    /// Outcome.
    pub action: Action,
    /// Set on rejected flows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drop_reason: Option<DropReason>,
    /// Matched policy, when a rule matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
}

impl FlowRecord {
    /// Record for an admitted connection.
    pub fn accepted(
        flow_id: Uuid,
        context_id: impl Into<String>,
        source: Endpoint,
        destination: Endpoint,
        tags: TagSet,
        policy: Option<&FlowPolicy>,
    ) -> Self {
        Self {
            flow_id,
            context_id: context_id.into(),
            source,
            destination,
            tags,
            action: Action::Accept,
            drop_reason: None,
            policy_id: policy.map(|p| p.policy_id.clone()),
        }
    }

    /// Record for a refused connection.
    pub fn rejected(
        flow_id: Uuid,
        context_id: impl Into<String>,
        source: Endpoint,
        destination: Endpoint,
        tags: TagSet,
        reason: DropReason,
        policy: Option<&FlowPolicy>,
    ) -> Self {
        Self {
            flow_id,
            context_id: context_id.into(),
            source,
            destination,
            tags,
            action: Action::Reject,
            drop_reason: Some(reason),
            policy_id: policy.map(|p| p.policy_id.clone()),
        }
    }
}

/// Consumer of flow records.
pub trait FlowCollector: Send + Sync {
    /// Hand off a record. Must not block the connection worker.
    fn collect(&self, record: FlowRecord);
}

impl FlowCollector for mpsc::UnboundedSender<FlowRecord> {
    fn collect(&self, record: FlowRecord) {
        // A closed receiver means nobody is listening anymore.
        let _ = self.send(record);
    }
}
