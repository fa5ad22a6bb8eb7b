//! pu-enforcer: identity-based connection authorization for processing units
//!
//! Every TCP connection between two enforced processing units is held back
//! until both sides have exchanged signed identity tokens and each side's
//! policy has accepted the other. Only then are application bytes relayed.
//!
//! # Security Model
//!
//! The security model is **fail-closed**: a connection that does not
//! complete the handshake within its deadline, presents an untrusted or
//! malformed token, or matches a reject rule is closed without relaying a
//! single application byte, and a flow record says why.
//!
//! # Architecture
//!
//! - **Address cache**: longest-prefix-match store for local addresses and ACLs
//! - **Token**: signed identity claims with a verification cache
//! - **Policy**: tag selectors, reject-then-accept rule evaluation, contexts
//! - **Handshake**: the three-message SYN / SYN-ACK / ACK exchange
//! - **Proxy**: per-context listener, role selection, and byte relay
//! - **Config**: hierarchical TOML configuration
//! - **Telemetry**: flow records and structured syslog audit logging
//! - **Enforcer**: lifecycle owner tying the pieces together

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod addrcache;
pub mod cli;
pub mod config;
pub mod enforcer;
pub mod handshake;
pub mod policy;
pub mod proxy;
pub mod tags;
pub mod telemetry;
pub mod token;
