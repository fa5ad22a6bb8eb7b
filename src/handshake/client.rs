//! Initiator side of the handshake.

use super::connection::Connection;
use super::error::{HandshakeError, HandshakeResult};
use super::{HandshakeConfig, receive_verified, send_claims};
use crate::policy::{PuContext, Verdict};
use crate::token::{Claims, MessageKind, NONCE_LEN};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Drive `conn` from `ClientTokenSend` to `Done` over `stream`.
pub(crate) async fn run<S>(
    context: &PuContext,
    config: &HandshakeConfig,
    stream: &mut S,
    conn: &mut Connection,
) -> HandshakeResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let identity = context.policy().identity.clone();

    // ClientTokenSend
    let syn = Claims::new(
        MessageKind::Syn,
        identity.clone(),
        conn.local_nonce.clone(),
        config.token_validity,
    );
    send_claims(context, config, stream, conn.state(), &syn).await?;
    debug!("[{}] Sent SYN to {}", conn.flow_id(), conn.destination());
    conn.advance()?;

    // ClientPeerTokenReceive
    let state = conn.state();
    let verified = receive_verified(context, config, stream, conn, state).await?;
    let claims = verified.claims;

    if claims.kind != MessageKind::SynAck {
        return Err(HandshakeError::InvalidToken {
            state,
            reason: format!("expected SYNACK, got {}", claims.kind),
        });
    }
    if claims.peer_nonce != conn.local_nonce {
        return Err(HandshakeError::InvalidToken {
            state,
            reason: "SYNACK does not acknowledge our nonce".to_string(),
        });
    }
    if claims.nonce.len() != NONCE_LEN {
        return Err(HandshakeError::InvalidToken {
            state,
            reason: format!("nonce is {} bytes", claims.nonce.len()),
        });
    }

    conn.peer_nonce = Some(claims.nonce.clone());
    conn.peer_key = Some(verified.key);
    conn.peer_tags = claims.tags.with_port(conn.destination_port());

    match context
        .policy()
        .transmitter
        .evaluate(&conn.peer_tags, config.mutual_auth)
    {
        Verdict::Accepted(policy) => conn.policy = policy,
        Verdict::Rejected(policy) => return Err(HandshakeError::PolicyDrop { policy }),
    }
    debug!("[{}] Accepted server identity {}", conn.flow_id(), conn.peer_tags);
    conn.advance()?;

    // ClientSendSignedPair
    let ack = Claims::new(
        MessageKind::Ack,
        identity,
        conn.local_nonce.clone(),
        config.token_validity,
    )
    .acknowledging(&claims.nonce);
    send_claims(context, config, stream, conn.state(), &ack).await?;
    debug!("[{}] Sent ACK", conn.flow_id());
    conn.advance()
}
