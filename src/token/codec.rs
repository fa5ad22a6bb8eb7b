//! Token encoding.
//!
//! # Wire Format
//!
//! A token is a bincode-encoded envelope:
//!
//! ```text
//! Envelope {
//!     claims:    JSON-serialized Claims (key-ordered, deterministic)
//!     signature: Ed25519 signature over the claims bytes (64 bytes)
//! }
//! ```
//!
//! The signature is detached from the claims so the verifier checks the
//! exact bytes that were signed, never a re-serialization.

use super::claims::Claims;
use super::error::{TokenError, TokenResult};
use bincode::Options;
use ed25519_dalek::{Signature, Signer, SigningKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on a decoded envelope.
pub const MAX_ENVELOPE_SIZE: u64 = 64 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    claims: Vec<u8>,
    signature: Vec<u8>,
}

/// A signed, opaque token.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(Vec<u8>);

impl Token {
    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Consume into raw bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({} bytes)", self.0.len())
    }
}

fn envelope_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_ENVELOPE_SIZE)
}

/// Serialize `claims` and sign them with `key`.
pub fn create_token(claims: &Claims, key: &SigningKey) -> TokenResult<Token> {
    let claims_bytes = serde_json::to_vec(claims)?;
    let signature = key.sign(&claims_bytes);
    let envelope = Envelope {
        claims: claims_bytes,
        signature: signature.to_bytes().to_vec(),
    };
    Ok(Token(envelope_options().serialize(&envelope)?))
}

/// A decoded but not yet authenticated token.
pub(crate) struct Unverified {
    pub claims_bytes: Vec<u8>,
    pub signature: Signature,
}

impl Unverified {
    pub(crate) fn claims(&self) -> TokenResult<Claims> {
        Ok(serde_json::from_slice(&self.claims_bytes)?)
    }
}

/// Split a token into its claims bytes and signature.
pub(crate) fn decode(token: &[u8]) -> TokenResult<Unverified> {
    let envelope: Envelope = envelope_options()
        .deserialize(token)
        .map_err(|e| TokenError::Malformed(e.to_string()))?;
    let signature = Signature::from_slice(&envelope.signature)
        .map_err(|e| TokenError::Malformed(format!("bad signature encoding: {}", e)))?;
    Ok(Unverified {
        claims_bytes: envelope.claims,
        signature,
    })
}
