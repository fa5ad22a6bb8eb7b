//! Telemetry: flow records and audit logging.
//!
//! # Architecture
//!
//! - **Flow records**: every connection that reaches a terminal state
//!   produces one [`FlowRecord`], handed to a [`FlowCollector`]
//! - **Audit logging** (syslog): [`AuditLogger`] is the production
//!   collector and also records enforcer lifecycle events
//! - **Debug logging** (tracing): operator diagnostics go to stderr via
//!   `tracing`, never to the wire
//!
//! # Event Format
//!
//! Events are logged as JSON with an ISO8601 timestamp:
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"flow","context_id":"web","action":"reject","drop_reason":"policy-drop","policy_id":"P2",...}
//! ```

mod error;
mod events;
mod flow;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, TimestampedEvent};
pub use flow::{DropReason, Endpoint, EndpointType, FlowCollector, FlowRecord};
pub use syslog::{AuditLogger, SYSLOG_TAG};
