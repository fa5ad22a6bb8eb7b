//! Enforcer lifecycle.
//!
//! The [`Enforcer`] owns everything a running deployment needs: the
//! context registry, the shared token verifier, and one proxy task per
//! configured context. It is the only place where configuration turns
//! into live state.
//!
//! # Lifecycle
//!
//! ```text
//! Config ──start──▶ ContextStore + TokenVerifier ──▶ ProxyServer per context
//!                          ▲                               │
//!          update_policy ──┤                               │
//!          unenforce ──────┘                      stop: shutdown signal,
//!                                                 drain, join
//! ```

mod error;

pub use error::{EnforcerError, EnforcerResult};

use crate::config::{Config, ContextConfig};
use crate::policy::{ContextStore, PuContext};
use crate::proxy::{
    DestinationResolver, ProxyConfig, ProxyResult, ProxyServer, SocketOriginalDst,
    StaticDestinations,
};
use crate::telemetry::{AuditEvent, AuditLogger, FlowCollector};
use crate::token::{TokenVerifier, key_id};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One running proxy.
struct ProxyTask {
    context_id: String,
    local_addr: SocketAddr,
    handle: JoinHandle<ProxyResult<()>>,
}

/// Running enforcer.
pub struct Enforcer {
    store: Arc<ContextStore>,
    verifier: Arc<TokenVerifier>,
    audit: Arc<AuditLogger>,
    shutdown_tx: watch::Sender<bool>,
    proxies: Vec<ProxyTask>,
    started: Instant,
}

impl Enforcer {
    /// Start enforcing every context in `config`, reporting flows to `audit`.
    pub async fn start(config: &Config, audit: Arc<AuditLogger>) -> EnforcerResult<Self> {
        let collector: Arc<dyn FlowCollector> = audit.clone();
        Self::start_with_collector(config, audit, collector).await
    }

    /// Like [`Enforcer::start`], with flow records going to `collector`.
    pub async fn start_with_collector(
        config: &Config,
        audit: Arc<AuditLogger>,
        collector: Arc<dyn FlowCollector>,
    ) -> EnforcerResult<Self> {
        if config.contexts.is_empty() {
            return Err(EnforcerError::NoContexts);
        }

        let signing_key = config.keys.signing_key()?;
        let mut trusted = config.keys.trusted_keys()?;
        let own = signing_key.verifying_key();
        if !trusted.contains(&own) {
            // Contexts on this host must accept each other's tokens.
            trusted.push(own);
        }
        debug!(
            "Trusting {} keys: {}",
            trusted.len(),
            trusted.iter().map(key_id).collect::<Vec<_>>().join(", ")
        );

        let verifier = Arc::new(TokenVerifier::new(trusted, config.handshake.cache_ttl()));
        let store = Arc::new(ContextStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut enforcer = Self {
            store,
            verifier,
            audit,
            shutdown_tx,
            proxies: Vec::with_capacity(config.contexts.len()),
            started: Instant::now(),
        };

        for context in &config.contexts {
            let policy = context.to_policy()?;
            if let Err(e) = enforcer.check_ports(&context.id, &policy.ports) {
                let _ = enforcer.halt().await;
                return Err(e);
            }
            enforcer.store.enforce(PuContext::new(
                context.id.as_str(),
                policy,
                signing_key.clone(),
                enforcer.verifier.clone(),
            ));

            let proxy_config = ProxyConfig {
                listen: context.listen,
                context_id: context.id.clone(),
                store: enforcer.store.clone(),
                handshake: config.handshake.handshake_config(),
                resolver: resolver_for(context),
                collector: collector.clone(),
                drain_timeout: config.handshake.drain_timeout(),
            };

            let server = match ProxyServer::bind(proxy_config, shutdown_rx.clone()).await {
                Ok(server) => server,
                Err(source) => {
                    error!("Failed to start proxy for context '{}': {}", context.id, source);
                    let _ = enforcer.halt().await;
                    return Err(EnforcerError::Proxy {
                        context_id: context.id.clone(),
                        source,
                    });
                }
            };
            let local_addr = server.local_addr().map_err(|source| EnforcerError::Proxy {
                context_id: context.id.clone(),
                source,
            })?;

            enforcer.audit.log(AuditEvent::ContextEnforced {
                context_id: context.id.clone(),
                listen: local_addr.to_string(),
            });
            enforcer.proxies.push(ProxyTask {
                context_id: context.id.clone(),
                local_addr,
                handle: tokio::spawn(server.run()),
            });
        }

        info!("Enforcer started with {} contexts", enforcer.proxies.len());
        enforcer.audit.log(AuditEvent::EnforcerStart {
            contexts: enforcer.proxies.len(),
            pid: std::process::id(),
        });
        Ok(enforcer)
    }

    /// Replace a context's policy snapshot. New connections see the new
    /// rules; handshakes already evaluating keep the old snapshot.
    pub fn update_policy(&self, context: &ContextConfig) -> EnforcerResult<()> {
        let policy = context.to_policy()?;
        self.check_ports(&context.id, &policy.ports)?;
        self.store.update_policy(&context.id, policy)?;
        info!("Updated policy for context '{}'", context.id);
        self.audit.log(AuditEvent::PolicyUpdated {
            context_id: context.id.clone(),
        });
        Ok(())
    }

    /// Stop enforcing a context. Its listener stays up and refuses every
    /// connection with a `missing-context` record.
    pub fn unenforce(&self, id: &str) -> EnforcerResult<()> {
        self.store.unenforce(id)?;
        self.audit.log(AuditEvent::ContextUnenforced {
            context_id: id.to_string(),
        });
        Ok(())
    }

    /// Each service port belongs to one context, or inbound connections
    /// to it would be answered under the wrong identity.
    fn check_ports(&self, context_id: &str, ports: &[u16]) -> EnforcerResult<()> {
        for &port in ports {
            if let Some(owner) = self.store.by_port(port)
                && owner.id() != context_id
            {
                return Err(EnforcerError::PortConflict {
                    port,
                    context_id: context_id.to_string(),
                    owner: owner.id().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Registry of enforced contexts.
    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Shared token verifier.
    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    /// Bound proxy address for a context.
    pub fn local_addr(&self, context_id: &str) -> Option<SocketAddr> {
        self.proxies
            .iter()
            .find(|p| p.context_id == context_id)
            .map(|p| p.local_addr)
    }

    /// Bound proxy addresses, in configuration order.
    pub fn local_addrs(&self) -> Vec<(String, SocketAddr)> {
        self.proxies
            .iter()
            .map(|p| (p.context_id.clone(), p.local_addr))
            .collect()
    }

    /// Signal shutdown, wait for every proxy to drain, then unenforce
    /// every remaining context.
    ///
    /// Returns the first proxy failure, after all proxies have been joined.
    pub async fn stop(mut self) -> EnforcerResult<()> {
        info!("Stopping enforcer");
        let result = self.halt().await;
        for id in self.store.ids() {
            if self.store.unenforce(&id).is_ok() {
                self.audit.log(AuditEvent::ContextUnenforced { context_id: id });
            }
        }
        self.audit.log(AuditEvent::EnforcerStop {
            uptime_sec: self.started.elapsed().as_secs(),
        });
        result
    }

    async fn halt(&mut self) -> EnforcerResult<()> {
        // Receivers may already be gone if every proxy exited.
        let _ = self.shutdown_tx.send(true);

        let mut first_error = None;
        for proxy in self.proxies.drain(..) {
            let failure = match proxy.handle.await {
                Ok(Ok(())) => {
                    debug!("Proxy for context '{}' stopped", proxy.context_id);
                    continue;
                }
                Ok(Err(source)) => EnforcerError::Proxy {
                    context_id: proxy.context_id,
                    source,
                },
                Err(_) => EnforcerError::TaskFailed(proxy.context_id),
            };
            warn!("{}", failure);
            first_error.get_or_insert(failure);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Fixed destination when configured, transparent interception otherwise.
fn resolver_for(context: &ContextConfig) -> Arc<dyn DestinationResolver> {
    match context.destination {
        Some(destination) => {
            debug!(
                "Context '{}' forwards every connection to {}",
                context.id, destination
            );
            Arc::new(StaticDestinations::fixed(destination))
        }
        None => Arc::new(SocketOriginalDst),
    }
}
