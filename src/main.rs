//! pu-enforcer: identity-based connection authorization for processing units
//!
//! This is the main entry point for the pu-enforcer binary. It handles CLI
//! argument parsing, configuration loading, telemetry initialization, and
//! runs the enforcer until interrupted.
//!
//! # Logging
//!
//! - **Audit logging**: flow records and lifecycle events go to syslog as
//!   JSON, never to stdout/stderr
//! - **Debug logging**: operator diagnostics go to stderr via `tracing`

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pu_enforcer::{
    cli::Cli,
    config::ConfigLoader,
    enforcer::Enforcer,
    telemetry::AuditLogger,
};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    // Load configuration with hierarchy merging; it decides the log level
    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    let log_level = Some(config.general.log_level.as_str()).filter(|l| !l.is_empty());
    init_tracing(cli.verbose, log_level)?;

    debug!("Parsed CLI arguments: {:?}", cli);
    debug!("Loaded configuration: {:?}", config);

    // Audit logging goes to syslog; keep running without it
    let audit = match AuditLogger::new() {
        Ok(logger) => logger,
        Err(e) => {
            warn!("Audit logging disabled: {}", e);
            AuditLogger::new_null()
        }
    };

    let enforcer = Enforcer::start(&config, Arc::new(audit))
        .await
        .context("Failed to start enforcer")?;

    for (context_id, addr) in enforcer.local_addrs() {
        info!("Context '{}' enforced on {}", context_id, addr);
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for interrupt")?;
    info!("Interrupt received, shutting down");

    enforcer.stop().await.context("Enforcer did not stop cleanly")?;
    Ok(())
}

/// Initialize the tracing subscriber for debug/development logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): configured `log_level`, else `RUST_LOG`, else warnings and errors
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, log_level: Option<&str>) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => match log_level {
            Some(level) => EnvFilter::try_new(level)
                .with_context(|| format!("Invalid log level '{}'", level))?,
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        },
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
