//! Processing-unit contexts and the registry that owns them.
//!
//! A context's policy is an immutable [`PuPolicy`] snapshot behind an
//! atomic pointer. Policy updates replace the whole snapshot, so a
//! handshake that loaded the old snapshot finishes its evaluation against
//! the old rules and never sees a mix of old and new.

use super::acl::AclCache;
use super::error::{PolicyError, PolicyResult};
use super::rules::RuleSet;
use crate::addrcache::AddressCache;
use crate::tags::TagSet;
use crate::token::TokenVerifier;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use ed25519_dalek::SigningKey;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Immutable policy snapshot for one processing unit.
#[derive(Debug, Default)]
pub struct PuPolicy {
    /// Identity advertised in our tokens.
    pub identity: TagSet,
    /// Extra tags reported in flow records, never sent on the wire.
    pub annotations: TagSet,
    /// Rules applied to the server's identity on connections we open.
    pub transmitter: RuleSet,
    /// Rules applied to the client's identity on connections we accept.
    pub receiver: RuleSet,
    /// Inbound sources that are external addresses.
    pub network_acls: AclCache,
    /// Outbound destinations that are external addresses.
    pub application_acls: AclCache,
    /// Service ports this unit listens on.
    pub ports: Vec<u16>,
    /// Addresses owned by this host.
    pub local_addresses: AddressCache<()>,
}

impl PuPolicy {
    /// Whether `port` is an advertised service port.
    pub fn advertises(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }

    /// Whether `ip` belongs to the local address set.
    pub fn is_local_address(&self, ip: IpAddr) -> bool {
        self.local_addresses.run_ip(ip, |_| true)
    }
}

/// A live processing-unit context.
pub struct PuContext {
    id: String,
    policy: ArcSwap<PuPolicy>,
    signing_key: SigningKey,
    verifier: Arc<TokenVerifier>,
}

impl PuContext {
    /// Create a context.
    pub fn new(
        id: impl Into<String>,
        policy: PuPolicy,
        signing_key: SigningKey,
        verifier: Arc<TokenVerifier>,
    ) -> Self {
        Self {
            id: id.into(),
            policy: ArcSwap::from_pointee(policy),
            signing_key,
            verifier,
        }
    }

    /// Stable context identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current policy snapshot.
    pub fn policy(&self) -> Arc<PuPolicy> {
        self.policy.load_full()
    }

    /// Atomically replace the policy snapshot.
    pub fn replace_policy(&self, policy: PuPolicy) {
        self.policy.store(Arc::new(policy));
        debug!("Replaced policy for context {}", self.id);
    }

    /// Key used to sign our tokens.
    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    /// Verifier for peer tokens.
    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }
}

impl fmt::Debug for PuContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PuContext")
            .field("id", &self.id)
            .field("identity", &self.policy.load().identity)
            .finish_non_exhaustive()
    }
}

/// Registry of enforced contexts, owned by the enforcer.
#[derive(Debug, Default)]
pub struct ContextStore {
    contexts: DashMap<String, Arc<PuContext>>,
}

impl ContextStore {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context, replacing any previous one with the same ID.
    pub fn enforce(&self, context: PuContext) -> Arc<PuContext> {
        let context = Arc::new(context);
        if self
            .contexts
            .insert(context.id().to_string(), context.clone())
            .is_some()
        {
            info!("Re-enforced context {}", context.id());
        } else {
            info!("Enforcing context {}", context.id());
        }
        context
    }

    /// Swap the policy of a registered context.
    pub fn update_policy(&self, id: &str, policy: PuPolicy) -> PolicyResult<()> {
        let context = self
            .get(id)
            .ok_or_else(|| PolicyError::UnknownContext(id.to_string()))?;
        context.replace_policy(policy);
        Ok(())
    }

    /// Remove a context.
    pub fn unenforce(&self, id: &str) -> PolicyResult<Arc<PuContext>> {
        let (_, context) = self
            .contexts
            .remove(id)
            .ok_or_else(|| PolicyError::UnknownContext(id.to_string()))?;
        info!("Stopped enforcing context {}", id);
        Ok(context)
    }

    /// Look up a context by ID.
    pub fn get(&self, id: &str) -> Option<Arc<PuContext>> {
        self.contexts.get(id).map(|c| c.value().clone())
    }

    /// Context advertising `port` as a service port, if any.
    pub fn by_port(&self, port: u16) -> Option<Arc<PuContext>> {
        self.contexts
            .iter()
            .find(|c| c.value().policy().advertises(port))
            .map(|c| c.value().clone())
    }

    /// Registered context IDs.
    pub fn ids(&self) -> Vec<String> {
        self.contexts.iter().map(|c| c.key().clone()).collect()
    }

    /// Number of registered contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Whether no contexts are registered.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
