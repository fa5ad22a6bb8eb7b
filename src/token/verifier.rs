//! Token verification against a set of trusted keys.
//!
//! Asymmetric verification dominates per-handshake cost, so successful
//! results are cached by exact token bytes. The cache key is never derived
//! from claims content: two distinct tokens with equal claims are verified
//! independently.

use super::cache::{CachedVerification, VerificationCache};
use super::claims::Claims;
use super::codec::decode;
use super::error::{TokenError, TokenResult};
use super::keys::key_id;
use ed25519_dalek::VerifyingKey;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Result of a successful verification.
#[derive(Debug, Clone)]
pub struct Verified {
    /// Trusted key that verified the signature.
    pub key: VerifyingKey,
    /// Claims carried by the token.
    pub claims: Arc<Claims>,
}

/// Verification counters.
#[derive(Debug, Default)]
pub struct VerifierStats {
    signature_checks: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl VerifierStats {
    /// Number of asymmetric signature checks performed.
    pub fn signature_checks(&self) -> u64 {
        self.signature_checks.load(Ordering::Relaxed)
    }

    /// Number of verifications answered from the cache.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Number of verifications that missed the cache.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }
}

/// Verifies tokens against trusted public keys, caching successes.
#[derive(Debug)]
pub struct TokenVerifier {
    trusted: Vec<VerifyingKey>,
    cache_ttl: Duration,
    cache: VerificationCache,
    stats: VerifierStats,
}

impl TokenVerifier {
    /// Create a verifier.
    ///
    /// # Arguments
    ///
    /// * `trusted` - Keys tried in order; the first that verifies wins.
    /// * `cache_ttl` - Upper bound on how long a verification result is reused.
    pub fn new(trusted: Vec<VerifyingKey>, cache_ttl: Duration) -> Self {
        Self {
            trusted,
            cache_ttl,
            cache: VerificationCache::new(cache_ttl),
            stats: VerifierStats::default(),
        }
    }

    /// Verify a token and return the verifying key with its claims.
    pub fn verify(&self, token: &[u8]) -> TokenResult<Verified> {
        let now = Instant::now();

        if let Some(hit) = self.cache.get(token, now) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            if hit.claims.is_expired() {
                return Err(TokenError::Expired(hit.claims.expiry));
            }
            trace!("Token verification served from cache");
            return Ok(Verified {
                key: hit.key,
                claims: hit.claims,
            });
        }
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

        let unverified = decode(token)?;
        let key = self
            .trusted
            .iter()
            .find(|key| {
                self.stats.signature_checks.fetch_add(1, Ordering::Relaxed);
                key.verify_strict(&unverified.claims_bytes, &unverified.signature)
                    .is_ok()
            })
            .copied()
            .ok_or(TokenError::Unauthenticated)?;

        let claims = Arc::new(unverified.claims()?);
        let Some(remaining) = claims.remaining_validity() else {
            return Err(TokenError::Expired(claims.expiry));
        };

        if remaining > self.cache_ttl {
            self.cache.insert(
                token.to_vec(),
                CachedVerification {
                    key,
                    claims: claims.clone(),
                    expires_at: now + self.cache_ttl.min(remaining),
                },
                now,
            );
        }

        debug!("Token verified by key {}", key_id(&key));
        Ok(Verified { key, claims })
    }

    /// Verification counters.
    pub fn stats(&self) -> &VerifierStats {
        &self.stats
    }

    /// Number of cached verification results.
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Trusted keys, in verification order.
    pub fn trusted_keys(&self) -> &[VerifyingKey] {
        &self.trusted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::TagSet;
    use crate::token::claims::{MessageKind, new_nonce};
    use crate::token::codec::create_token;
    use ed25519_dalek::SigningKey;

    fn claims(validity: Duration) -> Claims {
        let tags: TagSet = [("app", "web")].into_iter().collect();
        Claims::new(MessageKind::Syn, tags, new_nonce(), validity)
    }

    fn key(seed: u8) -> SigningKey {
        SigningKey::from_bytes(&[seed; 32])
    }

    #[test]
    fn test_round_trip() {
        let signer = key(1);
        let verifier = TokenVerifier::new(vec![signer.verifying_key()], Duration::from_secs(10));
        let original = claims(Duration::from_secs(60));

        let token = create_token(&original, &signer).unwrap();
        let verified = verifier.verify(token.as_bytes()).unwrap();

        assert_eq!(verified.key, signer.verifying_key());
        assert_eq!(*verified.claims, original);
    }

    #[test]
    fn test_second_verify_uses_cache() {
        let signer = key(1);
        let verifier = TokenVerifier::new(vec![signer.verifying_key()], Duration::from_secs(10));
        let token = create_token(&claims(Duration::from_secs(60)), &signer).unwrap();

        let first = verifier.verify(token.as_bytes()).unwrap();
        assert_eq!(verifier.stats().signature_checks(), 1);

        let second = verifier.verify(token.as_bytes()).unwrap();
        assert_eq!(verifier.stats().signature_checks(), 1);
        assert_eq!(verifier.stats().cache_hits(), 1);
        assert_eq!(first.key, second.key);
        assert_eq!(first.claims, second.claims);
    }

    #[test]
    fn test_replay_keeps_one_entry() {
        let signer = key(1);
        let verifier = TokenVerifier::new(vec![signer.verifying_key()], Duration::from_secs(10));
        let token = create_token(&claims(Duration::from_secs(60)), &signer).unwrap();

        for _ in 0..20 {
            let verified = verifier.verify(token.as_bytes()).unwrap();
            assert_eq!(verified.key, signer.verifying_key());
        }
        assert_eq!(verifier.cached_entries(), 1);
        assert_eq!(verifier.stats().signature_checks(), 1);
    }

    #[test]
    fn test_tries_trusted_keys_in_order() {
        let signer = key(3);
        let verifier = TokenVerifier::new(
            vec![key(1).verifying_key(), key(2).verifying_key(), signer.verifying_key()],
            Duration::from_secs(10),
        );
        let token = create_token(&claims(Duration::from_secs(60)), &signer).unwrap();

        let verified = verifier.verify(token.as_bytes()).unwrap();
        assert_eq!(verified.key, signer.verifying_key());
        assert_eq!(verifier.stats().signature_checks(), 3);
    }

    #[test]
    fn test_untrusted_key_rejected() {
        let verifier = TokenVerifier::new(vec![key(1).verifying_key()], Duration::from_secs(10));
        let token = create_token(&claims(Duration::from_secs(60)), &key(9)).unwrap();

        assert!(matches!(
            verifier.verify(token.as_bytes()),
            Err(TokenError::Unauthenticated)
        ));
        assert_eq!(verifier.cached_entries(), 0);
    }

    #[test]
    fn test_no_trusted_keys_rejects_everything() {
        let verifier = TokenVerifier::new(Vec::new(), Duration::from_secs(10));
        let token = create_token(&claims(Duration::from_secs(60)), &key(1)).unwrap();
        assert!(matches!(
            verifier.verify(token.as_bytes()),
            Err(TokenError::Unauthenticated)
        ));
    }

    #[test]
    fn test_malformed_token() {
        let verifier = TokenVerifier::new(vec![key(1).verifying_key()], Duration::from_secs(10));
        assert!(matches!(
            verifier.verify(b"definitely not a token"),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn test_tampered_claims_rejected() {
        let signer = key(1);
        let verifier = TokenVerifier::new(vec![signer.verifying_key()], Duration::from_secs(10));
        let token = create_token(&claims(Duration::from_secs(60)), &signer).unwrap();

        let mut bytes = token.into_bytes();
        // Flip a byte inside the JSON claims ("app" -> "apq").
        let pos = bytes.windows(3).position(|w| w == b"app").unwrap();
        bytes[pos + 2] = b'q';

        assert!(matches!(verifier.verify(&bytes), Err(TokenError::Unauthenticated)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let signer = key(1);
        let verifier = TokenVerifier::new(vec![signer.verifying_key()], Duration::from_secs(10));
        let mut stale = claims(Duration::from_secs(60));
        stale.expiry = chrono::Utc::now() - chrono::Duration::seconds(5);
        let token = create_token(&stale, &signer).unwrap();

        assert!(matches!(verifier.verify(token.as_bytes()), Err(TokenError::Expired(_))));
    }

    #[test]
    fn test_short_lived_token_not_cached() {
        let signer = key(1);
        let verifier = TokenVerifier::new(vec![signer.verifying_key()], Duration::from_secs(30));
        let token = create_token(&claims(Duration::from_secs(5)), &signer).unwrap();

        verifier.verify(token.as_bytes()).unwrap();
        verifier.verify(token.as_bytes()).unwrap();
        assert_eq!(verifier.cached_entries(), 0);
        assert_eq!(verifier.stats().signature_checks(), 2);
    }

    #[test]
    fn test_cache_entry_expires_after_ttl() {
        let signer = key(1);
        let verifier = TokenVerifier::new(vec![signer.verifying_key()], Duration::from_millis(50));
        let token = create_token(&claims(Duration::from_secs(60)), &signer).unwrap();

        verifier.verify(token.as_bytes()).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        verifier.verify(token.as_bytes()).unwrap();

        assert_eq!(verifier.stats().signature_checks(), 2);
        assert_eq!(verifier.cached_entries(), 1);
    }

    #[test]
    fn test_distinct_tokens_do_not_accumulate() {
        let signer = key(1);
        let verifier = TokenVerifier::new(vec![signer.verifying_key()], Duration::from_millis(20));

        for _ in 0..200 {
            let token = create_token(&claims(Duration::from_secs(60)), &signer).unwrap();
            verifier.verify(token.as_bytes()).unwrap();
        }

        std::thread::sleep(Duration::from_millis(50));
        let token = create_token(&claims(Duration::from_secs(60)), &signer).unwrap();
        verifier.verify(token.as_bytes()).unwrap();

        assert_eq!(verifier.cached_entries(), 1);
    }
}
