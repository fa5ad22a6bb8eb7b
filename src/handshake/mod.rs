//! Three-message mutual authentication handshake.
//!
//! ```text
//!   Client                                  Server
//!     │ ── SYN    {tags, nonce_c}        ──▶  │  verify, evaluate receiver rules
//!     │ ◀─ SYNACK {tags, nonce_s, nonce_c} ── │
//!     │  verify, evaluate transmitter rules   │
//!     │ ── ACK    {tags, nonce_c, nonce_s} ─▶ │  verify binding
//!     ▼                Done                   ▼
//! ```
//!
//! Each message is a freshly signed token in a length-prefixed frame. Each
//! read and write is bounded by the phase deadline. A failure in any state
//! terminates the connection; no further message is sent, so a rejected
//! SYN never sees a SYNACK and a rejected SYNACK never sees an ACK.
//!
//! Every handshake ends with exactly one [`FlowRecord`](crate::telemetry::FlowRecord)
//! handed to the collector.

mod client;
mod connection;
mod error;
mod frame;
mod server;
mod state;

pub use connection::Connection;
pub use error::{HandshakeError, HandshakeResult};
pub use frame::{LEN_PREFIX, read_frame, write_frame};
pub use state::{HandshakeState, Role};

use crate::policy::PuContext;
use crate::telemetry::FlowCollector;
use crate::token::{Claims, Verified, create_token};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Default per-phase deadline.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default validity of minted tokens.
pub const DEFAULT_TOKEN_VALIDITY: Duration = Duration::from_secs(60);

/// Default upper bound on a token frame.
pub const DEFAULT_MAX_TOKEN_SIZE: usize = 16 * 1024;

/// Handshake tunables shared by all connections of an enforcer.
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// Deadline for each handshake read or write.
    pub read_timeout: Duration,
    /// Validity of tokens we mint.
    pub token_validity: Duration,
    /// Whether the client refuses servers matching no accept rule.
    pub mutual_auth: bool,
    /// Largest token frame accepted.
    pub max_token_size: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
            token_validity: DEFAULT_TOKEN_VALIDITY,
            mutual_auth: true,
            max_token_size: DEFAULT_MAX_TOKEN_SIZE,
        }
    }
}

/// Runs handshakes for one context and reports their outcome.
pub struct Handshake<'a> {
    context: &'a PuContext,
    config: &'a HandshakeConfig,
    collector: &'a dyn FlowCollector,
}

impl<'a> Handshake<'a> {
    /// Create a handshake driver.
    pub fn new(
        context: &'a PuContext,
        config: &'a HandshakeConfig,
        collector: &'a dyn FlowCollector,
    ) -> Self {
        Self {
            context,
            config,
            collector,
        }
    }

    /// Run the initiator side over a freshly dialed stream.
    pub async fn initiate<S>(&self, stream: &mut S, conn: &mut Connection) -> HandshakeResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = client::run(self.context, self.config, stream, conn).await;
        self.report(conn, &result);
        result
    }

    /// Run the acceptor side over a freshly accepted stream.
    pub async fn respond<S>(&self, stream: &mut S, conn: &mut Connection) -> HandshakeResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = self.respond_pending(stream, conn).await;
        if result.is_ok() {
            self.report_accepted(conn);
        }
        result
    }

    /// Run the acceptor side, reporting failures only.
    ///
    /// On success nothing is reported yet: the caller calls
    /// [`Handshake::report_accepted`] once the connection is usable, or
    /// reports the failure that stopped it.
    pub async fn respond_pending<S>(
        &self,
        stream: &mut S,
        conn: &mut Connection,
    ) -> HandshakeResult<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let result = server::run(self.context, self.config, stream, conn).await;
        if let Err(e) = &result {
            self.report_rejected(conn, e);
        }
        result
    }

    fn report(&self, conn: &Connection, result: &HandshakeResult<()>) {
        match result {
            Ok(()) => self.report_accepted(conn),
            Err(e) => self.report_rejected(conn, e),
        }
    }

    /// Emit the accepted flow record for a completed handshake.
    pub fn report_accepted(&self, conn: &Connection) {
        info!(
            "[{}] {} handshake {} -> {} accepted (policy {})",
            conn.flow_id(),
            conn.role(),
            conn.source(),
            conn.destination(),
            conn.policy().map_or("<none>", |p| p.policy_id.as_str())
        );
        let annotations = self.context.policy().annotations.clone();
        self.collector
            .collect(conn.accepted_record(self.context.id(), &annotations));
    }

    fn report_rejected(&self, conn: &Connection, error: &HandshakeError) {
        info!(
            "[{}] {} handshake {} -> {} rejected in {}: {}",
            conn.flow_id(),
            conn.role(),
            conn.source(),
            conn.destination(),
            conn.state(),
            error
        );
        let annotations = self.context.policy().annotations.clone();
        self.collector.collect(conn.rejected_record(
            self.context.id(),
            &annotations,
            error.drop_reason(),
            error.policy(),
        ));
    }
}

/// Sign `claims` with the context key and send them as one frame.
async fn send_claims<S>(
    context: &PuContext,
    config: &HandshakeConfig,
    stream: &mut S,
    state: HandshakeState,
    claims: &Claims,
) -> HandshakeResult<()>
where
    S: AsyncWrite + Unpin,
{
    let token = create_token(claims, context.signing_key()).map_err(HandshakeError::TokenCreation)?;
    write_frame(stream, token.as_bytes(), config.read_timeout, state).await
}

/// Read one frame and verify it as a token.
///
/// Oversized frames and verification failures come back as
/// [`HandshakeError::InvalidToken`].
async fn receive_verified<S>(
    context: &PuContext,
    config: &HandshakeConfig,
    stream: &mut S,
    conn: &mut Connection,
    state: HandshakeState,
) -> HandshakeResult<Verified>
where
    S: AsyncRead + Unpin,
{
    let frame = read_frame(
        stream,
        &mut conn.buffer,
        config.max_token_size,
        config.read_timeout,
        state,
    )
    .await
    .map_err(|e| match e {
        HandshakeError::FrameTooLarge { size, max } => HandshakeError::InvalidToken {
            state,
            reason: format!("frame of {} bytes exceeds {}", size, max),
        },
        other => other,
    })?;

    let verified = context
        .verifier()
        .verify(&frame)
        .map_err(|e| HandshakeError::InvalidToken {
            state,
            reason: e.to_string(),
        })?;
    debug!(
        "[{}] Verified {} token from {}",
        conn.flow_id(),
        verified.claims.kind,
        crate::token::key_id(&verified.key)
    );
    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Clause, FlowPolicy, PuPolicy, Rule, RuleSet, TagSelector};
    use crate::tags::PORT_TAG;
    use crate::telemetry::{DropReason, FlowRecord};
    use crate::token::{MessageKind, TokenVerifier, new_nonce};
    use ed25519_dalek::SigningKey;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    fn context(id: &str, app: &str, own: &SigningKey, trusted: &[&SigningKey], policy: PuPolicy) -> PuContext {
        let verifier = TokenVerifier::new(
            trusted.iter().map(|k| k.verifying_key()).collect(),
            Duration::from_secs(10),
        );
        let policy = PuPolicy {
            identity: [("app", app)].into_iter().collect(),
            ..policy
        };
        PuContext::new(id, policy, own.clone(), Arc::new(verifier))
    }

    fn accept_rule(key: &str, value: &str, id: &str) -> Rule {
        Rule::new(
            TagSelector::new(vec![Clause::equal(key, value)]),
            FlowPolicy::accept(id),
        )
    }

    fn addrs() -> (SocketAddr, SocketAddr) {
        ("10.0.0.1:40000".parse().unwrap(), "10.0.0.2:80".parse().unwrap())
    }

    fn config() -> HandshakeConfig {
        HandshakeConfig {
            read_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_full_handshake_binds_port_tag() {
        let (ck, sk) = (key(1), key(2));
        let client_ctx = context(
            "web",
            "web",
            &ck,
            &[&sk],
            PuPolicy {
                transmitter: RuleSet::new(vec![], vec![accept_rule("app", "db", "T1")]),
                ..Default::default()
            },
        );
        let server_ctx = context(
            "db",
            "db",
            &sk,
            &[&ck],
            PuPolicy {
                receiver: RuleSet::new(vec![], vec![accept_rule(PORT_TAG, "80", "R1")]),
                ..Default::default()
            },
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<FlowRecord>();
        let cfg = config();
        let (src, dst) = addrs();
        let (mut a, mut b) = tokio::io::duplex(4096);

        let client = Handshake::new(&client_ctx, &cfg, &tx);
        let server = Handshake::new(&server_ctx, &cfg, &tx);
        let mut cconn = Connection::new(Role::Client, src, dst);
        let mut sconn = Connection::new(Role::Server, src, dst);

        let (c, s) = tokio::join!(
            client.initiate(&mut a, &mut cconn),
            server.respond(&mut b, &mut sconn)
        );
        c.unwrap();
        s.unwrap();

        assert!(cconn.state().is_done());
        assert!(sconn.state().is_done());
        assert_eq!(sconn.policy().unwrap().policy_id, "R1");
        assert_eq!(sconn.peer_tags().get("app"), Some("web"));
        assert_eq!(cconn.policy().unwrap().policy_id, "T1");

        let mut ids = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()]
            .into_iter()
            .map(|r| (r.context_id, r.policy_id))
            .collect::<Vec<_>>();
        ids.sort();
        assert_eq!(
            ids,
            vec![
                ("db".to_string(), Some("R1".to_string())),
                ("web".to_string(), Some("T1".to_string()))
            ]
        );
    }

    #[tokio::test]
    async fn test_respond_pending_defers_accepted_record() {
        let (ck, sk) = (key(1), key(2));
        let client_ctx = context(
            "web",
            "web",
            &ck,
            &[&sk],
            PuPolicy {
                transmitter: RuleSet::new(vec![], vec![accept_rule("app", "db", "T1")]),
                ..Default::default()
            },
        );
        let server_ctx = context(
            "db",
            "db",
            &sk,
            &[&ck],
            PuPolicy {
                receiver: RuleSet::new(vec![], vec![accept_rule("app", "web", "R1")]),
                ..Default::default()
            },
        );

        let (ctx, mut crx) = mpsc::unbounded_channel::<FlowRecord>();
        let (stx, mut srx) = mpsc::unbounded_channel::<FlowRecord>();
        let cfg = config();
        let (src, dst) = addrs();
        let (mut a, mut b) = tokio::io::duplex(4096);

        let client = Handshake::new(&client_ctx, &cfg, &ctx);
        let server = Handshake::new(&server_ctx, &cfg, &stx);
        let mut cconn = Connection::new(Role::Client, src, dst);
        let mut sconn = Connection::new(Role::Server, src, dst);

        let (c, s) = tokio::join!(
            client.initiate(&mut a, &mut cconn),
            server.respond_pending(&mut b, &mut sconn)
        );
        c.unwrap();
        s.unwrap();
        assert!(crx.recv().await.is_some());
        assert!(srx.try_recv().is_err());

        server.report_accepted(&sconn);
        let record = srx.recv().await.unwrap();
        assert_eq!(record.context_id, "db");
        assert_eq!(record.policy_id.as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn test_client_rejects_unlisted_server_under_mutual_auth() {
        let (ck, sk) = (key(1), key(2));
        let client_ctx = context("web", "web", &ck, &[&sk], PuPolicy::default());
        let server_ctx = context(
            "db",
            "db",
            &sk,
            &[&ck],
            PuPolicy {
                receiver: RuleSet::new(vec![], vec![accept_rule("app", "web", "R1")]),
                ..Default::default()
            },
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<FlowRecord>();
        let cfg = config();
        let (src, dst) = addrs();
        let (mut a, mut b) = tokio::io::duplex(4096);

        let client = Handshake::new(&client_ctx, &cfg, &tx);
        let server = Handshake::new(&server_ctx, &cfg, &tx);
        let mut cconn = Connection::new(Role::Client, src, dst);
        let mut sconn = Connection::new(Role::Server, src, dst);

        let client_fut = async {
            let result = client.initiate(&mut a, &mut cconn).await;
            drop(a);
            result
        };
        let (c, s) = tokio::join!(client_fut, server.respond(&mut b, &mut sconn));

        assert!(matches!(c, Err(HandshakeError::PolicyDrop { policy: None })));
        assert_eq!(cconn.state(), HandshakeState::ClientPeerTokenReceive);
        assert!(matches!(s, Err(HandshakeError::ConnectionClosed(HandshakeState::ServerAuthenticatePair))));

        let mut reasons = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()]
            .into_iter()
            .map(|r| (r.context_id, r.drop_reason))
            .collect::<Vec<_>>();
        reasons.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            reasons,
            vec![
                ("db".to_string(), Some(DropReason::IoError)),
                ("web".to_string(), Some(DropReason::PolicyDrop))
            ]
        );
    }

    #[tokio::test]
    async fn test_replayed_syn_in_ack_slot_is_invalid_format() {
        let (ck, sk) = (key(1), key(2));
        let server_ctx = context(
            "db",
            "db",
            &sk,
            &[&ck],
            PuPolicy {
                receiver: RuleSet::new(vec![], vec![accept_rule("app", "web", "R1")]),
                ..Default::default()
            },
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<FlowRecord>();
        let cfg = config();
        let (src, dst) = addrs();
        let (mut a, mut b) = tokio::io::duplex(4096);

        let tags: crate::tags::TagSet = [("app", "web")].into_iter().collect();
        let syn = Claims::new(MessageKind::Syn, tags, new_nonce(), Duration::from_secs(60));
        let token = create_token(&syn, &ck).unwrap();

        let attacker = async {
            write_frame(&mut a, token.as_bytes(), cfg.read_timeout, HandshakeState::ClientTokenSend)
                .await
                .unwrap();
            let mut buffer = bytes::BytesMut::new();
            read_frame(&mut a, &mut buffer, 16 * 1024, cfg.read_timeout, HandshakeState::ClientPeerTokenReceive)
                .await
                .unwrap();
            // Send the SYN again where the ACK belongs.
            a.write_all(&(token.as_bytes().len() as u32).to_be_bytes()).await.unwrap();
            a.write_all(token.as_bytes()).await.unwrap();
            a
        };

        let server = Handshake::new(&server_ctx, &cfg, &tx);
        let mut sconn = Connection::new(Role::Server, src, dst);
        let (_a, s): (DuplexStream, _) = tokio::join!(attacker, server.respond(&mut b, &mut sconn));

        assert!(matches!(s, Err(HandshakeError::InvalidFormat(_))));
        let record = rx.recv().await.unwrap();
        assert_eq!(record.drop_reason, Some(DropReason::InvalidFormat));
    }

    #[tokio::test]
    async fn test_leftover_application_bytes_are_kept() {
        let (ck, sk) = (key(1), key(2));
        let client_ctx = context("web", "web", &ck, &[&sk], PuPolicy {
            transmitter: RuleSet::new(vec![], vec![accept_rule("app", "db", "T1")]),
            ..Default::default()
        });
        let server_ctx = context("db", "db", &sk, &[&ck], PuPolicy {
            receiver: RuleSet::new(vec![], vec![accept_rule("app", "web", "R1")]),
            ..Default::default()
        });

        let tx = mpsc::unbounded_channel::<FlowRecord>().0;
        let cfg = config();
        let (src, dst) = addrs();
        let (mut a, mut b) = tokio::io::duplex(4096);

        let client = Handshake::new(&client_ctx, &cfg, &tx);
        let server = Handshake::new(&server_ctx, &cfg, &tx);
        let mut cconn = Connection::new(Role::Client, src, dst);
        let mut sconn = Connection::new(Role::Server, src, dst);

        let client_fut = async {
            client.initiate(&mut a, &mut cconn).await.unwrap();
            a.write_all(b"GET /").await.unwrap();
        };
        let (_, s) = tokio::join!(client_fut, server.respond(&mut b, &mut sconn));
        s.unwrap();

        // Whatever arrived with the ACK is handed back for forwarding.
        let leftover = sconn.take_buffered();
        assert!(b"GET /".starts_with(&leftover[..]));
    }
}
