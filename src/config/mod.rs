//! Configuration system for pu-enforcer.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//! Each enforced processing unit is a `[[contexts]]` entry.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. System config: `/etc/pu-enforcer/config.toml`
//! 2. User config: `~/.config/pu-enforcer/config.toml`
//! 3. Additional config file (via `--config` flag)
//! 4. CLI flags (highest priority)
//!
//! # Merge Behavior
//!
//! - **Lists** (trusted_keys) are **merged** (appended)
//! - **Scalars** (timeouts, log_level, etc.) are **overridden**
//! - **Contexts** are merged by `id`; a later definition replaces the earlier one
//!
//! # Context Configuration
//!
//! ```toml
//! [keys]
//! signing_key = "<hex ed25519 seed>"
//! trusted_keys = ["<hex ed25519 public key>"]
//!
//! [[contexts]]
//! id = "web"
//! listen = "127.0.0.1:15001"
//! ports = [8080]
//! identity = { app = "web" }
//!
//! [[contexts.receiver.accept]]
//! policy_id = "P1"
//! action = "accept"
//! selector = [{ key = "app", operator = "equal", values = ["api"] }]
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{
    AclConfig, Config, ContextConfig, DEFAULT_CACHE_TTL, GeneralConfig, HandshakeSettings,
    KeysConfig,
};
