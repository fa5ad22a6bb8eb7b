//! Claims carried inside identity tokens.

use crate::tags::TagSet;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Length of a handshake nonce in bytes.
pub const NONCE_LEN: usize = 16;

/// Which handshake message a token was minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Client to server, first message.
    Syn,
    /// Server to client, second message.
    SynAck,
    /// Client to server, third message.
    Ack,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Syn => write!(f, "SYN"),
            MessageKind::SynAck => write!(f, "SYNACK"),
            MessageKind::Ack => write!(f, "ACK"),
        }
    }
}

/// Token payload.
///
/// Field order is fixed by the struct definition and tags are key-ordered,
/// so serialization is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Handshake message this token belongs to.
    pub kind: MessageKind,
    /// Sender identity tags.
    pub tags: TagSet,
    /// Freshness bound.
    pub expiry: DateTime<Utc>,
    /// Sender's nonce for this handshake.
    #[serde(with = "hex::serde")]
    pub nonce: Vec<u8>,
    /// The peer's nonce being acknowledged; empty on Syn.
    #[serde(with = "hex::serde")]
    pub peer_nonce: Vec<u8>,
}

impl Claims {
    /// Build claims valid for `validity` from now.
    pub fn new(kind: MessageKind, tags: TagSet, nonce: Vec<u8>, validity: Duration) -> Self {
        let validity = ChronoDuration::from_std(validity).unwrap_or(ChronoDuration::MAX);
        Self {
            kind,
            tags,
            expiry: Utc::now()
                .checked_add_signed(validity)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            nonce,
            peer_nonce: Vec::new(),
        }
    }

    /// Attach the peer's nonce.
    pub fn acknowledging(mut self, peer_nonce: &[u8]) -> Self {
        self.peer_nonce = peer_nonce.to_vec();
        self
    }

    /// Time left before expiry, or `None` when already expired.
    pub fn remaining_validity(&self) -> Option<Duration> {
        (self.expiry - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
    }

    /// Whether the expiry has passed.
    pub fn is_expired(&self) -> bool {
        self.remaining_validity().is_none()
    }
}

/// Generate a fresh random nonce.
pub fn new_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}
