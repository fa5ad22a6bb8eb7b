//! Enforcing TCP proxy server.
//!
//! This module provides the per-context proxy that:
//! - Accepts intercepted TCP connections on the context's listen address
//! - Recovers each connection's original destination
//! - Picks the handshake role (server for inbound, client for outbound)
//! - Applies address ACLs before any handshake
//! - Runs the handshake, then relays bytes unmediated
//!
//! # Architecture
//!
//! Each connection is handled in its own Tokio task tracked by a
//! `JoinSet`. On shutdown the listener stops accepting, handshakes still
//! in flight are abandoned, and established relays get `drain_timeout` to
//! finish before they are aborted.
//!
//! # Example
//!
//! ```ignore
//! use pu_enforcer::proxy::{ProxyConfig, ProxyServer};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServer::bind(config, shutdown_rx).await?;
//! let task = tokio::spawn(server.run());
//!
//! // To shutdown:
//! shutdown_tx.send(true)?;
//! task.await??;
//! ```

use super::error::{ProxyError, ProxyResult};
use super::original_dst::DestinationResolver;
use super::relay::relay;
use super::role::RoleResolver;
use crate::handshake::{Connection, Handshake, HandshakeConfig, HandshakeError, Role};
use crate::policy::{Action, ContextStore, FlowPolicy, PuContext};
use crate::tags::TagSet;
use crate::telemetry::{DropReason, Endpoint, FlowCollector, FlowRecord};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default grace period for established relays at shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_millis(2000);

/// Configuration for one context's proxy.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// Context enforced on every connection, looked up per connection.
    pub context_id: String,
    /// Registry holding the context.
    pub store: Arc<ContextStore>,
    /// Handshake tunables.
    pub handshake: HandshakeConfig,
    /// Original destination lookup.
    pub resolver: Arc<dyn DestinationResolver>,
    /// Receives one flow record per connection.
    pub collector: Arc<dyn FlowCollector>,
    /// Grace period for established relays at shutdown.
    pub drain_timeout: Duration,
}

/// The enforcing proxy for one context.
pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    listener: TcpListener,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listener.
    ///
    /// # Arguments
    ///
    /// * `config` - Proxy configuration.
    /// * `shutdown_rx` - Receiver for shutdown signal.
    pub async fn bind(config: ProxyConfig, shutdown_rx: watch::Receiver<bool>) -> ProxyResult<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: config.listen,
                source,
            })?;

        Ok(Self {
            config: Arc::new(config),
            listener,
            shutdown_rx,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop.
    ///
    /// Returns when the shutdown signal is received and the workers have
    /// drained or been aborted.
    pub async fn run(self) -> ProxyResult<()> {
        info!(
            "Proxy for context '{}' listening on {}",
            self.config.context_id,
            self.local_addr()?
        );

        let mut workers = JoinSet::new();
        let mut shutdown_rx = self.shutdown_rx.clone();

        if !*shutdown_rx.borrow() {
            loop {
                tokio::select! {
                    accept_result = self.listener.accept() => {
                        match accept_result {
                            Ok((stream, peer)) => {
                                debug!("Accepted connection from {}", peer);
                                workers.spawn(handle_connection(
                                    self.config.clone(),
                                    stream,
                                    peer,
                                    self.shutdown_rx.clone(),
                                ));
                            }
                            Err(e) => {
                                warn!("Failed to accept connection: {}", e);
                            }
                        }
                    }
                    Some(joined) = workers.join_next(), if !workers.is_empty() => {
                        log_worker_exit(joined);
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }

        info!("Proxy for context '{}' shutting down", self.config.context_id);
        drop(self.listener);

        if timeout(self.config.drain_timeout, drain(&mut workers))
            .await
            .is_err()
        {
            warn!(
                "Aborting {} connections still open after {:?}",
                workers.len(),
                self.config.drain_timeout
            );
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        Ok(())
    }
}

async fn drain(workers: &mut JoinSet<ProxyResult<()>>) {
    while let Some(joined) = workers.join_next().await {
        log_worker_exit(joined);
    }
}

fn log_worker_exit(joined: Result<ProxyResult<()>, JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        // Already reported through the flow record.
        Ok(Err(ProxyError::Handshake(e))) => debug!("Handshake ended: {}", e),
        Ok(Err(e @ ProxyError::AclDrop(_))) => debug!("{}", e),
        Ok(Err(e)) if e.is_disconnect() => debug!("Connection ended: {}", e),
        Ok(Err(ProxyError::Shutdown)) => debug!("Connection closed for shutdown"),
        Ok(Err(e)) => warn!("Connection error: {}", e),
        Err(e) if e.is_cancelled() => {}
        Err(e) => warn!("Connection worker panicked: {}", e),
    }
}

/// Resolves once shutdown has been requested.
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let requested = shutdown_rx.wait_for(|stop| *stop).await.is_ok();
    if !requested {
        // Sender gone: nobody can ask us to stop any more.
        std::future::pending::<()>().await;
    }
}

/// Handle a single intercepted connection.
async fn handle_connection(
    config: Arc<ProxyConfig>,
    inbound: TcpStream,
    peer: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
) -> ProxyResult<()> {
    let Some(context) = config.store.get(&config.context_id) else {
        let local = inbound.local_addr()?;
        config.collector.collect(FlowRecord::rejected(
            Uuid::new_v4(),
            config.context_id.as_str(),
            Endpoint::workload(None, peer),
            Endpoint::workload(None, local),
            TagSet::new(),
            DropReason::MissingContext,
            None,
        ));
        return Err(ProxyError::MissingContext(config.context_id.clone()));
    };

    let destination = match config.resolver.original_destination(&inbound) {
        Ok(destination) => destination,
        Err(e) => {
            let local = inbound.local_addr()?;
            config.collector.collect(FlowRecord::rejected(
                Uuid::new_v4(),
                context.id(),
                Endpoint::workload(None, peer),
                Endpoint::workload(None, local),
                TagSet::new(),
                DropReason::IoError,
                None,
            ));
            return Err(e);
        }
    };

    let session = Session {
        config: &config,
        context: &context,
        peer,
        destination,
        shutdown_rx,
    };

    let role = RoleResolver::new(&context.policy()).resolve(destination);
    debug!("Connection {} -> {} plays {}", peer, destination, role);
    match role {
        Role::Server => session.serve_inbound(inbound).await,
        Role::Client => session.serve_outbound(inbound).await,
    }
}

/// One connection's view of its proxy and context.
struct Session<'a> {
    config: &'a ProxyConfig,
    context: &'a PuContext,
    peer: SocketAddr,
    destination: SocketAddr,
    shutdown_rx: watch::Receiver<bool>,
}

impl Session<'_> {
    /// A peer connecting to our workload: answer the handshake.
    async fn serve_inbound(mut self, mut inbound: TcpStream) -> ProxyResult<()> {
        let acl = self
            .context
            .policy()
            .network_acls
            .lookup(self.peer.ip(), self.destination.port());
        if let Some(acl) = acl {
            let source = Endpoint::external(self.peer);
            let target = Endpoint::workload(Some(self.context.id().to_string()), self.destination);
            return self.bypass(&acl, source, target, inbound).await;
        }

        let mut conn = Connection::new(Role::Server, self.peer, self.destination);
        let handshake = Handshake::new(self.context, &self.config.handshake, &*self.config.collector);
        let outcome = tokio::select! {
            result = handshake.respond_pending(&mut inbound, &mut conn) => Some(result),
            _ = shutdown_requested(&mut self.shutdown_rx) => None,
        };
        self.finish_handshake(&conn, outcome)?;

        // The flow only counts as accepted once the workload answers.
        let mut backend = match self.dial().await {
            Ok(backend) => backend,
            Err(e) => {
                self.report_unfinished(&conn, DropReason::IoError);
                return Err(e);
            }
        };
        handshake.report_accepted(&conn);

        let early = conn.take_buffered();
        self.relay(&mut inbound, &mut backend, &early, &[]).await
    }

    /// Our workload dialing out: initiate the handshake.
    async fn serve_outbound(mut self, mut inbound: TcpStream) -> ProxyResult<()> {
        let acl = self
            .context
            .policy()
            .application_acls
            .lookup(self.destination.ip(), self.destination.port());
        if let Some(acl) = acl {
            let source = Endpoint::workload(Some(self.context.id().to_string()), self.peer);
            let target = Endpoint::external(self.destination);
            return self.bypass(&acl, source, target, inbound).await;
        }

        let mut conn = Connection::new(Role::Client, self.peer, self.destination);
        let mut upstream = match self.dial().await {
            Ok(upstream) => upstream,
            Err(e) => {
                self.report_unfinished(&conn, DropReason::IoError);
                return Err(e);
            }
        };

        let handshake = Handshake::new(self.context, &self.config.handshake, &*self.config.collector);
        let outcome = tokio::select! {
            result = handshake.initiate(&mut upstream, &mut conn) => Some(result),
            _ = shutdown_requested(&mut self.shutdown_rx) => None,
        };
        self.finish_handshake(&conn, outcome)?;

        let early = conn.take_buffered();
        self.relay(&mut inbound, &mut upstream, &[], &early).await
    }

    /// Enforce an address ACL decision without a handshake.
    ///
    /// An accepting ACL is reported only after the far side was reached;
    /// a failed dial is reported as an I/O drop under the same ACL.
    async fn bypass(
        &self,
        acl: &FlowPolicy,
        source: Endpoint,
        target: Endpoint,
        mut inbound: TcpStream,
    ) -> ProxyResult<()> {
        let flow_id = Uuid::new_v4();
        let annotations = self.context.policy().annotations.clone();
        let rejected = |reason| {
            FlowRecord::rejected(
                flow_id,
                self.context.id(),
                source.clone(),
                target.clone(),
                annotations.clone(),
                reason,
                Some(acl),
            )
        };

        if acl.action == Action::Reject {
            info!(
                "[{}] {} -> {} refused (ACL {})",
                flow_id, self.peer, self.destination, acl.policy_id
            );
            self.config.collector.collect(rejected(DropReason::PolicyDrop));
            return Err(ProxyError::AclDrop(acl.policy_id.clone()));
        }

        let mut outbound = match self.dial().await {
            Ok(outbound) => outbound,
            Err(e) => {
                self.config.collector.collect(rejected(DropReason::IoError));
                return Err(e);
            }
        };
        info!(
            "[{}] {} -> {} bypasses handshake (ACL {})",
            flow_id, self.peer, self.destination, acl.policy_id
        );
        self.config.collector.collect(FlowRecord::accepted(
            flow_id,
            self.context.id(),
            source,
            target,
            annotations,
            Some(acl),
        ));
        self.relay(&mut inbound, &mut outbound, &[], &[]).await
    }

    fn finish_handshake(
        &self,
        conn: &Connection,
        outcome: Option<Result<(), HandshakeError>>,
    ) -> ProxyResult<()> {
        match outcome {
            Some(result) => Ok(result?),
            None => {
                self.report_unfinished(conn, DropReason::IoError);
                Err(ProxyError::Shutdown)
            }
        }
    }

    /// Record for a connection that ended outside the handshake driver.
    fn report_unfinished(&self, conn: &Connection, reason: DropReason) {
        let annotations = self.context.policy().annotations.clone();
        self.config
            .collector
            .collect(conn.rejected_record(self.context.id(), &annotations, reason, None));
    }

    async fn dial(&self) -> ProxyResult<TcpStream> {
        let connect = TcpStream::connect(self.destination);
        match timeout(self.config.handshake.read_timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(ProxyError::UpstreamConnect {
                addr: self.destination,
                message: e.to_string(),
            }),
            Err(_) => Err(ProxyError::UpstreamConnect {
                addr: self.destination,
                message: "connect timed out".to_string(),
            }),
        }
    }

    async fn relay(
        &self,
        inbound: &mut TcpStream,
        outbound: &mut TcpStream,
        to_outbound: &[u8],
        to_inbound: &[u8],
    ) -> ProxyResult<()> {
        let (up, down) = relay(inbound, outbound, to_outbound, to_inbound).await?;
        debug!(
            "Relay {} -> {} closed ({} bytes up, {} bytes down)",
            self.peer, self.destination, up, down
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AclEntry, PortRange, PuPolicy};
    use crate::proxy::StaticDestinations;
    use crate::token::TokenVerifier;
    use ed25519_dalek::SigningKey;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    fn store_with(id: &str, policy: PuPolicy) -> Arc<ContextStore> {
        let store = Arc::new(ContextStore::new());
        let verifier = Arc::new(TokenVerifier::new(Vec::new(), Duration::from_secs(10)));
        store.enforce(PuContext::new(id, policy, SigningKey::from_bytes(&[3u8; 32]), verifier));
        store
    }

    async fn start(
        store: Arc<ContextStore>,
        backend: SocketAddr,
    ) -> (
        SocketAddr,
        mpsc::UnboundedReceiver<FlowRecord>,
        watch::Sender<bool>,
        tokio::task::JoinHandle<ProxyResult<()>>,
    ) {
        // Bind first to learn the port, then route it to the backend.
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen = placeholder.local_addr().unwrap();
        drop(placeholder);

        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = ProxyConfig {
            listen,
            context_id: "web".to_string(),
            store,
            handshake: HandshakeConfig::default(),
            resolver: Arc::new(StaticDestinations::new().with_route(listen, backend)),
            collector: Arc::new(tx),
            drain_timeout: Duration::from_millis(200),
        };
        let server = ProxyServer::bind(config, shutdown_rx).await.unwrap();
        let task = tokio::spawn(server.run());
        (listen, rx, shutdown_tx, task)
    }

    #[tokio::test]
    async fn test_application_acl_bypasses_handshake() {
        let backend = echo_server().await;
        let policy = PuPolicy::default();
        policy
            .application_acls
            .add(&AclEntry {
                cidr: "127.0.0.0/8".parse().unwrap(),
                ports: PortRange::ANY,
                policy: FlowPolicy::accept("EXT1"),
            });

        let (listen, mut records, shutdown_tx, task) = start(store_with("web", policy), backend).await;

        let mut client = TcpStream::connect(listen).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        let record = records.recv().await.unwrap();
        assert_eq!(record.action, Action::Accept);
        assert_eq!(record.policy_id.as_deref(), Some("EXT1"));
        assert_eq!(record.destination.kind, crate::telemetry::EndpointType::External);

        drop(client);
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_application_acl_reject() {
        let backend = echo_server().await;
        let policy = PuPolicy::default();
        policy
            .application_acls
            .add(&AclEntry {
                cidr: "127.0.0.1/32".parse().unwrap(),
                ports: PortRange::ANY,
                policy: FlowPolicy::reject("EXT2"),
            });

        let (listen, mut records, shutdown_tx, task) = start(store_with("web", policy), backend).await;

        let mut client = TcpStream::connect(listen).await.unwrap();
        let mut buf = [0u8; 1];
        // Closed without any byte.
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);

        let record = records.recv().await.unwrap();
        assert_eq!(record.drop_reason, Some(DropReason::PolicyDrop));
        assert_eq!(record.policy_id.as_deref(), Some("EXT2"));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_network_acl_accept_with_dead_backend_reports_io_drop() {
        let placeholder = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = placeholder.local_addr().unwrap();
        drop(placeholder);

        let policy = PuPolicy {
            ports: vec![backend.port()],
            ..Default::default()
        };
        policy.network_acls.add(&AclEntry {
            cidr: "127.0.0.0/8".parse().unwrap(),
            ports: PortRange::ANY,
            policy: FlowPolicy::accept("NET1"),
        });

        let (listen, mut records, shutdown_tx, task) = start(store_with("web", policy), backend).await;

        let mut client = TcpStream::connect(listen).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);

        let record = records.recv().await.unwrap();
        assert_eq!(record.action, Action::Reject);
        assert_eq!(record.drop_reason, Some(DropReason::IoError));
        assert_eq!(record.policy_id.as_deref(), Some("NET1"));
        assert!(records.try_recv().is_err());

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_context() {
        let backend = echo_server().await;
        let store = store_with("web", PuPolicy::default());
        let (listen, mut records, shutdown_tx, task) = start(store.clone(), backend).await;
        store.unenforce("web").unwrap();

        let _client = TcpStream::connect(listen).await.unwrap();
        let record = records.recv().await.unwrap();
        assert_eq!(record.drop_reason, Some(DropReason::MissingContext));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_abandons_pending_handshake() {
        let store = store_with(
            "web",
            PuPolicy {
                ports: vec![9],
                ..Default::default()
            },
        );
        // Port 9 is advertised, so the proxy waits for a SYN as server.
        let backend: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (listen, mut records, shutdown_tx, task) = start(store, backend).await;

        let _client = TcpStream::connect(listen).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();

        let record = records.recv().await.unwrap();
        assert_eq!(record.drop_reason, Some(DropReason::IoError));
        task.await.unwrap().unwrap();
    }
}
