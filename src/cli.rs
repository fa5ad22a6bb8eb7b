//! Command-line interface definitions for pu-enforcer.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::Parser;
use std::path::PathBuf;

/// Identity-based connection authorization for processing units.
///
/// pu-enforcer runs one transparent proxy per configured context. Every
/// intercepted connection is authorized by a signed three-message
/// handshake before any application byte is relayed.
#[derive(Parser, Debug)]
#[command(name = "pu-enforcer")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to additional config file.
    ///
    /// This config file is merged on top of system and user configs,
    /// giving it the highest priority (except for CLI flags).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Trust an additional token signing key (hex, repeatable).
    #[arg(long = "trusted-key", value_name = "HEX")]
    pub trusted_keys: Vec<String>,

    /// Per-phase handshake deadline in milliseconds.
    #[arg(long = "read-timeout-ms", value_name = "MS")]
    pub read_timeout_ms: Option<u64>,

    /// Let clients connect to servers that match no accept rule.
    #[arg(long = "no-mutual-auth")]
    pub no_mutual_auth: bool,

    /// Log level used when no -v flag is given.
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
