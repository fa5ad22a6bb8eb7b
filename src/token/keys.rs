//! Key parsing helpers.

use super::error::{TokenError, TokenResult};
use ed25519_dalek::{SigningKey, VerifyingKey};

/// Parse a hex-encoded 32-byte Ed25519 seed.
pub fn signing_key_from_hex(s: &str) -> TokenResult<SigningKey> {
    let bytes = decode_32(s)?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Parse a hex-encoded 32-byte Ed25519 public key.
pub fn verifying_key_from_hex(s: &str) -> TokenResult<VerifyingKey> {
    let bytes = decode_32(s)?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| TokenError::InvalidKey(e.to_string()))
}

/// Short printable identifier for a public key (first 8 bytes, hex).
pub fn key_id(key: &VerifyingKey) -> String {
    hex::encode(&key.as_bytes()[..8])
}

fn decode_32(s: &str) -> TokenResult<[u8; 32]> {
    let bytes = hex::decode(s.trim()).map_err(|e| TokenError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| TokenError::InvalidKey(format!("expected 32 bytes, got {}", b.len())))
}
