//! Configuration schema definitions.
//!
//! This module defines the structure of the pu-enforcer configuration files.
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/pu-enforcer/config.toml`
//! 2. User config: `~/.config/pu-enforcer/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority)

use super::error::ConfigError;
use crate::handshake::{
    DEFAULT_MAX_TOKEN_SIZE, DEFAULT_READ_TIMEOUT, DEFAULT_TOKEN_VALIDITY, HandshakeConfig,
};
use crate::policy::{AclCache, AclEntry, Action, FlowPolicy, PortRange, PuPolicy, RuleSet};
use crate::proxy::DEFAULT_DRAIN_TIMEOUT;
use crate::tags::TagSet;
use crate::token::{signing_key_from_hex, verifying_key_from_hex};
use ed25519_dalek::{SigningKey, VerifyingKey};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Default lifetime of cached verifications.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Handshake tunables.
    #[serde(default)]
    pub handshake: HandshakeSettings,

    /// Signing and trusted keys.
    #[serde(default)]
    pub keys: KeysConfig,

    /// Enforced processing units.
    #[serde(default)]
    pub contexts: Vec<ContextConfig>,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Lists (trusted_keys) are merged (appended).
    /// Scalars (timeouts, log_level, etc.) are overridden.
    /// Contexts are merged by ID; a later definition replaces an earlier one.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.handshake.merge(other.handshake);
        self.keys.merge(other.keys);

        for context in other.contexts {
            if let Some(existing) = self.contexts.iter_mut().find(|c| c.id == context.id) {
                *existing = context;
            } else {
                self.contexts.push(context);
            }
        }
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        let mut listens = HashSet::new();
        for context in &self.contexts {
            if context.id.is_empty() {
                return Err(invalid("contexts.id", "must not be empty"));
            }
            if !ids.insert(context.id.as_str()) {
                return Err(invalid("contexts.id", format!("duplicate id '{}'", context.id)));
            }
            // Port 0 asks the OS for a fresh port, so it never collides.
            if context.listen.port() != 0 && !listens.insert(context.listen) {
                return Err(invalid(
                    format!("contexts.{}.listen", context.id),
                    format!("{} is already used by another context", context.listen),
                ));
            }
            for (side, rules) in [("transmitter", &context.transmitter), ("receiver", &context.receiver)] {
                if let Some((list, index)) = rules.mislisted().into_iter().next() {
                    return Err(invalid(
                        format!("contexts.{}.{}.{}[{}].action", context.id, side, list, index),
                        format!("a rule in the {} list must have action '{}'", list, list),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn invalid(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        message: message.into(),
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        // Scalars are overridden if non-default
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// Handshake settings. Zero means "use the built-in default".
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct HandshakeSettings {
    /// Deadline for each handshake read or write, in milliseconds.
    #[serde(default)]
    pub read_timeout_ms: u64,

    /// Validity of minted tokens, in seconds.
    #[serde(default)]
    pub token_validity_secs: u64,

    /// Lifetime of cached verifications, in seconds.
    #[serde(default)]
    pub verification_cache_ttl_secs: u64,

    /// Whether clients require an accept rule to match the server.
    #[serde(default)]
    pub mutual_auth: Option<bool>,

    /// Largest token frame accepted, in bytes.
    #[serde(default)]
    pub max_token_size: usize,

    /// Grace period for established relays at shutdown, in milliseconds.
    #[serde(default)]
    pub drain_timeout_ms: u64,
}

impl HandshakeSettings {
    fn merge(&mut self, other: HandshakeSettings) {
        if other.read_timeout_ms != 0 {
            self.read_timeout_ms = other.read_timeout_ms;
        }
        if other.token_validity_secs != 0 {
            self.token_validity_secs = other.token_validity_secs;
        }
        if other.verification_cache_ttl_secs != 0 {
            self.verification_cache_ttl_secs = other.verification_cache_ttl_secs;
        }
        if other.mutual_auth.is_some() {
            self.mutual_auth = other.mutual_auth;
        }
        if other.max_token_size != 0 {
            self.max_token_size = other.max_token_size;
        }
        if other.drain_timeout_ms != 0 {
            self.drain_timeout_ms = other.drain_timeout_ms;
        }
    }

    /// Resolved handshake tunables.
    pub fn handshake_config(&self) -> HandshakeConfig {
        HandshakeConfig {
            read_timeout: nonzero_ms(self.read_timeout_ms).unwrap_or(DEFAULT_READ_TIMEOUT),
            token_validity: nonzero_secs(self.token_validity_secs)
                .unwrap_or(DEFAULT_TOKEN_VALIDITY),
            mutual_auth: self.mutual_auth.unwrap_or(true),
            max_token_size: if self.max_token_size == 0 {
                DEFAULT_MAX_TOKEN_SIZE
            } else {
                self.max_token_size
            },
        }
    }

    /// Resolved verification cache lifetime.
    pub fn cache_ttl(&self) -> Duration {
        nonzero_secs(self.verification_cache_ttl_secs).unwrap_or(DEFAULT_CACHE_TTL)
    }

    /// Resolved shutdown grace period.
    pub fn drain_timeout(&self) -> Duration {
        nonzero_ms(self.drain_timeout_ms).unwrap_or(DEFAULT_DRAIN_TIMEOUT)
    }
}

fn nonzero_ms(ms: u64) -> Option<Duration> {
    (ms != 0).then(|| Duration::from_millis(ms))
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs != 0).then(|| Duration::from_secs(secs))
}

/// Key material, hex encoded.
#[derive(Clone, Deserialize, Serialize, Default)]
pub struct KeysConfig {
    /// Ed25519 seed used to sign our tokens.
    #[serde(default)]
    pub signing_key: String,

    /// Ed25519 public keys whose tokens we accept.
    #[serde(default)]
    pub trusted_keys: Vec<String>,
}

impl fmt::Debug for KeysConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signing_key = if self.signing_key.is_empty() {
            "<unset>"
        } else {
            "<redacted>"
        };
        f.debug_struct("KeysConfig")
            .field("signing_key", &signing_key)
            .field("trusted_keys", &self.trusted_keys)
            .finish()
    }
}

impl KeysConfig {
    fn merge(&mut self, other: KeysConfig) {
        if !other.signing_key.is_empty() {
            self.signing_key = other.signing_key;
        }
        // Lists are merged (appended)
        for key in other.trusted_keys {
            if !self.trusted_keys.contains(&key) {
                self.trusted_keys.push(key);
            }
        }
    }

    /// Parse the signing key.
    pub fn signing_key(&self) -> Result<SigningKey, ConfigError> {
        if self.signing_key.is_empty() {
            return Err(invalid("keys.signing_key", "no signing key configured"));
        }
        signing_key_from_hex(&self.signing_key).map_err(|e| invalid("keys.signing_key", e.to_string()))
    }

    /// Parse the trusted keys.
    pub fn trusted_keys(&self) -> Result<Vec<VerifyingKey>, ConfigError> {
        self.trusted_keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                verifying_key_from_hex(key)
                    .map_err(|e| invalid(format!("keys.trusted_keys[{}]", i), e.to_string()))
            })
            .collect()
    }
}

/// One enforced processing unit.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContextConfig {
    /// Stable context identifier.
    pub id: String,

    /// Proxy listen address.
    pub listen: SocketAddr,

    /// Fixed destination for every connection, when traffic is not
    /// transparently intercepted.
    #[serde(default)]
    pub destination: Option<SocketAddr>,

    /// Identity tags advertised in our tokens.
    #[serde(default)]
    pub identity: TagSet,

    /// Extra tags reported in flow records.
    #[serde(default)]
    pub annotations: TagSet,

    /// Service ports this unit listens on.
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Addresses or CIDR blocks owned by this host.
    #[serde(default)]
    pub local_addresses: Vec<String>,

    /// Rules applied to servers we connect to.
    #[serde(default)]
    pub transmitter: RuleSet,

    /// Rules applied to clients connecting to us.
    #[serde(default)]
    pub receiver: RuleSet,

    /// Inbound external sources.
    #[serde(default)]
    pub network_acls: Vec<AclConfig>,

    /// Outbound external destinations.
    #[serde(default)]
    pub application_acls: Vec<AclConfig>,
}

impl ContextConfig {
    /// Build the policy snapshot for this context.
    pub fn to_policy(&self) -> Result<PuPolicy, ConfigError> {
        let policy = PuPolicy {
            identity: self.identity.clone(),
            annotations: self.annotations.clone(),
            transmitter: self.transmitter.clone(),
            receiver: self.receiver.clone(),
            network_acls: self.acl_cache("network_acls", &self.network_acls)?,
            application_acls: self.acl_cache("application_acls", &self.application_acls)?,
            ports: self.ports.clone(),
            ..Default::default()
        };

        for (i, addr) in self.local_addresses.iter().enumerate() {
            let field = || format!("contexts.{}.local_addresses[{}]", self.id, i);
            let network: IpNetwork = addr
                .parse()
                .map_err(|e: ipnetwork::IpNetworkError| invalid(field(), e.to_string()))?;
            policy.local_addresses.insert(network, ());
        }

        Ok(policy)
    }

    fn acl_cache(&self, name: &str, acls: &[AclConfig]) -> Result<AclCache, ConfigError> {
        let entries = acls
            .iter()
            .enumerate()
            .map(|(i, acl)| {
                acl.to_entry()
                    .map_err(|message| invalid(format!("contexts.{}.{}[{}]", self.id, name, i), message))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AclCache::from_entries(&entries))
    }
}

/// Address ACL entry as written in the config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AclConfig {
    /// Address block, e.g. `"10.0.0.0/8"`.
    pub cidr: String,

    /// Port or range, e.g. `"443"` or `"8000-8100"`; empty or `"*"` for any.
    #[serde(default)]
    pub ports: String,

    /// Verdict.
    pub action: Action,

    /// Identifier reported in flow records.
    pub policy_id: String,
}

impl AclConfig {
    fn to_entry(&self) -> Result<AclEntry, String> {
        Ok(AclEntry {
            cidr: self
                .cidr
                .parse()
                .map_err(|e: ipnetwork::IpNetworkError| e.to_string())?,
            ports: self.ports.parse::<PortRange>().map_err(|e| e.to_string())?,
            policy: FlowPolicy {
                action: self.action,
                policy_id: self.policy_id.clone(),
            },
        })
    }
}
