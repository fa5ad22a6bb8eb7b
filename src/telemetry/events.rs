//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `PU_ENFORCER` tag for SIEM
//! integration. Flow records are one variant among the enforcer lifecycle
//! events.

use super::flow::FlowRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events for security logging.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Enforcer started.
    EnforcerStart {
        /// Number of contexts enforced at startup.
        contexts: usize,
        /// Process ID of the enforcer.
        pid: u32,
    },

    /// Enforcer stopped.
    EnforcerStop {
        /// Seconds since start.
        uptime_sec: u64,
    },

    /// A context began being enforced.
    ContextEnforced {
        /// Context ID.
        context_id: String,
        /// Proxy listen address.
        listen: String,
    },

    /// A context's policy snapshot was replaced.
    PolicyUpdated {
        /// Context ID.
        context_id: String,
    },

    /// A context stopped being enforced.
    ContextUnenforced {
        /// Context ID.
        context_id: String,
    },

    /// A connection reached a terminal state.
    Flow(FlowRecord),
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::FlowPolicy;
    use crate::telemetry::flow::{DropReason, Endpoint};
    use uuid::Uuid;

    #[test]
    fn test_enforcer_start_serialization() {
        let event = AuditEvent::EnforcerStart {
            contexts: 2,
            pid: 12345,
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"enforcer_start\""));
        assert!(json.contains("\"contexts\":2"));
        assert!(json.contains("\"pid\":12345"));
        assert!(json.contains("\"ts\""));
    }

    #[test]
    fn test_flow_event_is_flattened() {
        let event = AuditEvent::Flow(FlowRecord::rejected(
            Uuid::nil(),
            "web",
            Endpoint::workload(None, "10.0.0.1:40000".parse().unwrap()),
            Endpoint::workload(Some("web".into()), "10.0.0.2:80".parse().unwrap()),
            Default::default(),
            DropReason::InvalidToken,
            None::<&FlowPolicy>,
        ));

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();

        assert!(json.contains("\"event\":\"flow\""));
        assert!(json.contains("\"context_id\":\"web\""));
        assert!(json.contains("\"drop_reason\":\"invalid-token\""));
    }

    #[test]
    fn test_policy_updated_serialization() {
        let event = AuditEvent::PolicyUpdated {
            context_id: "db".to_string(),
        };

        let json = serde_json::to_string(&event.with_timestamp()).unwrap();
        assert!(json.contains("\"event\":\"policy_updated\""));
        assert!(json.contains("\"context_id\":\"db\""));
    }
}
