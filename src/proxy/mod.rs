//! Enforcing TCP proxy.
//!
//! This module provides the per-context proxy with:
//! - Original destination recovery for intercepted connections
//! - Role selection (server for inbound, client for outbound)
//! - Address ACL checks ahead of the handshake
//! - Handshake-gated, otherwise unmediated byte relay
//!
//! # Architecture
//!
//! ```text
//!  workload A          proxy (ctx A)                  proxy (ctx B)          workload B
//!  ┌───────┐ connect  ┌─────────────┐  SYN/SYNACK/ACK ┌─────────────┐ connect ┌───────┐
//!  │  app  │────────▶ │ Role=Client │ ◀─────────────▶ │ Role=Server │ ──────▶ │  svc  │
//!  └───────┘ (NAT)    └─────────────┘   then relay    └─────────────┘         └───────┘
//! ```

mod error;
mod original_dst;
mod relay;
mod role;
mod server;

pub use error::{ProxyError, ProxyResult};
pub use original_dst::{DestinationResolver, SocketOriginalDst, StaticDestinations};
pub use relay::{is_disconnect, relay};
pub use role::RoleResolver;
pub use server::{DEFAULT_DRAIN_TIMEOUT, ProxyConfig, ProxyServer};
