//! Identity tokens: claims, signing, and cached verification.
//!
//! Every handshake message carries a freshly minted token:
//! `sign(serialize(Claims), sender_private_key)`. Tokens are never
//! persisted. The receiver verifies them against zero or more trusted
//! public keys through [`TokenVerifier`], which caches successes by exact
//! token bytes for at most the configured TTL (and never past the claims
//! expiry).
//!
//! # Example
//!
//! ```
//! use pu_enforcer::tags::TagSet;
//! use pu_enforcer::token::{Claims, MessageKind, TokenVerifier, create_token, new_nonce};
//! use ed25519_dalek::SigningKey;
//! use std::time::Duration;
//!
//! let key = SigningKey::from_bytes(&[42u8; 32]);
//! let tags: TagSet = [("app", "web")].into_iter().collect();
//! let claims = Claims::new(MessageKind::Syn, tags, new_nonce(), Duration::from_secs(60));
//!
//! let token = create_token(&claims, &key).unwrap();
//! let verifier = TokenVerifier::new(vec![key.verifying_key()], Duration::from_secs(10));
//! assert_eq!(*verifier.verify(token.as_bytes()).unwrap().claims, claims);
//! ```

mod cache;
mod claims;
mod codec;
mod error;
mod keys;
mod verifier;

pub use cache::{CachedVerification, VerificationCache};
pub use claims::{Claims, MessageKind, NONCE_LEN, new_nonce};
pub use codec::{MAX_ENVELOPE_SIZE, Token, create_token};
pub use error::{TokenError, TokenResult};
pub use keys::{key_id, signing_key_from_hex, verifying_key_from_hex};
pub use verifier::{TokenVerifier, Verified, VerifierStats};
