//! Acceptor side of the handshake.

use super::connection::Connection;
use super::error::{HandshakeError, HandshakeResult};
use super::{HandshakeConfig, receive_verified, send_claims};
use crate::policy::{PuContext, Verdict};
use crate::token::{Claims, MessageKind, NONCE_LEN};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Drive `conn` from `ServerReceivePeerToken` to `Done` over `stream`.
pub(crate) async fn run<S>(
    context: &PuContext,
    config: &HandshakeConfig,
    stream: &mut S,
    conn: &mut Connection,
) -> HandshakeResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // ServerReceivePeerToken
    let state = conn.state();
    let verified = receive_verified(context, config, stream, conn, state).await?;
    let syn = verified.claims;

    if syn.kind != MessageKind::Syn {
        return Err(HandshakeError::InvalidToken {
            state,
            reason: format!("expected SYN, got {}", syn.kind),
        });
    }
    if syn.nonce.len() != NONCE_LEN {
        return Err(HandshakeError::InvalidToken {
            state,
            reason: format!("nonce is {} bytes", syn.nonce.len()),
        });
    }

    conn.peer_nonce = Some(syn.nonce.clone());
    conn.peer_key = Some(verified.key);
    conn.peer_tags = syn.tags.with_port(conn.destination_port());

    // Loaded once: identity and rules come from the same snapshot.
    let policy = context.policy();
    match policy.receiver.evaluate(&conn.peer_tags, true) {
        Verdict::Accepted(matched) => conn.policy = matched,
        Verdict::Rejected(matched) => return Err(HandshakeError::PolicyDrop { policy: matched }),
    }
    debug!("[{}] Accepted client identity {}", conn.flow_id(), conn.peer_tags);
    conn.advance()?;

    // ServerSendToken
    let syn_ack = Claims::new(
        MessageKind::SynAck,
        policy.identity.clone(),
        conn.local_nonce.clone(),
        config.token_validity,
    )
    .acknowledging(&syn.nonce);
    send_claims(context, config, stream, conn.state(), &syn_ack).await?;
    debug!("[{}] Sent SYNACK", conn.flow_id());
    conn.advance()?;

    // ServerAuthenticatePair
    let state = conn.state();
    let verified = receive_verified(context, config, stream, conn, state)
        .await
        .map_err(|e| match e {
            HandshakeError::InvalidToken { reason, .. } => HandshakeError::InvalidFormat(reason),
            HandshakeError::FrameTooLarge { size, max } => {
                HandshakeError::InvalidFormat(format!("frame of {} bytes exceeds {}", size, max))
            }
            other => other,
        })?;
    let ack = verified.claims;

    if ack.kind != MessageKind::Ack {
        return Err(HandshakeError::InvalidFormat(format!(
            "expected ACK, got {}",
            ack.kind
        )));
    }
    if ack.nonce != syn.nonce || ack.peer_nonce != conn.local_nonce {
        return Err(HandshakeError::InvalidFormat(
            "ACK is not bound to this handshake".to_string(),
        ));
    }
    if conn.peer_key != Some(verified.key) || ack.tags != syn.tags {
        return Err(HandshakeError::InvalidFormat(
            "ACK identity differs from SYN".to_string(),
        ));
    }

    debug!("[{}] Verified ACK", conn.flow_id());
    conn.advance()
}
