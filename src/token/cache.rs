//! Verification cache keyed by raw token bytes.
//!
//! Entries expire passively, there is no background sweep. A lookup drops
//! the expired entry it finds, and an insert drops every expired entry at
//! most once per purge interval. Handshake tokens carry fresh nonces and
//! are rarely looked up twice, so the insert-side purge is what bounds the
//! map to roughly the tokens seen in the last two intervals.

use super::claims::Claims;
use dashmap::DashMap;
use ed25519_dalek::VerifyingKey;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// A cached verification result.
#[derive(Debug, Clone)]
pub struct CachedVerification {
    /// Key that verified the token.
    pub key: VerifyingKey,
    /// Parsed claims of the token.
    pub claims: Arc<Claims>,
    /// Entry is valid strictly before this instant.
    pub expires_at: Instant,
}

/// Concurrent token-bytes to verification-result map.
#[derive(Debug)]
pub struct VerificationCache {
    entries: DashMap<Vec<u8>, CachedVerification>,
    purge_interval: Duration,
    next_purge: Mutex<Instant>,
}

impl VerificationCache {
    /// Create an empty cache that purges expired entries at most once per
    /// `purge_interval`.
    pub fn new(purge_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            purge_interval,
            next_purge: Mutex::new(Instant::now()),
        }
    }

    /// Look up a token, evicting the entry if it has expired.
    pub fn get(&self, token: &[u8], now: Instant) -> Option<CachedVerification> {
        // The shard read guard must be released before remove_if takes the
        // write lock on the same shard.
        let hit = self.entries.get(token).map(|e| e.value().clone());
        match hit {
            Some(entry) if now < entry.expires_at => Some(entry),
            Some(_) => {
                self.entries.remove_if(token, |_, e| now >= e.expires_at);
                None
            }
            None => None,
        }
    }

    /// Insert or replace the entry for `token`, purging expired entries
    /// first when a purge is due.
    pub fn insert(&self, token: Vec<u8>, entry: CachedVerification, now: Instant) {
        self.purge_if_due(now);
        self.entries.insert(token, entry);
    }

    fn purge_if_due(&self, now: Instant) {
        // Another inserter is already purging.
        let Some(mut next) = self.next_purge.try_lock() else {
            return;
        };
        if now < *next {
            return;
        }
        *next = now + self.purge_interval;
        drop(next);

        let removed = self.purge_expired(now);
        if removed > 0 {
            trace!("Purged {} expired verifications", removed);
        }
    }

    /// Drop every entry expired at `now`, returning how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| now < e.expires_at);
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
