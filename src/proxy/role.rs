//! Which side of the handshake a proxied connection plays.

use crate::handshake::Role;
use crate::policy::PuPolicy;
use std::net::SocketAddr;

/// Decides a connection's role from its original destination.
///
/// A connection to one of our advertised service ports, or to an address
/// this host owns, is inbound and we answer as server. Anything else is
/// our workload dialing out, and we initiate as client.
#[derive(Debug, Clone, Copy)]
pub struct RoleResolver<'a> {
    policy: &'a PuPolicy,
}

impl<'a> RoleResolver<'a> {
    /// Resolver over one policy snapshot.
    pub fn new(policy: &'a PuPolicy) -> Self {
        Self { policy }
    }

    /// Role for a connection originally sent to `destination`.
    pub fn resolve(&self, destination: SocketAddr) -> Role {
        if self.policy.advertises(destination.port())
            || self.policy.is_local_address(destination.ip())
        {
            Role::Server
        } else {
            Role::Client
        }
    }
}
