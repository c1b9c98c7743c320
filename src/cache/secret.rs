//! Time-bounded cache of decrypted secret values
//!
//! Entries are keyed by the full filesystem path that was read. An entry is
//! served only while it is younger than the TTL; older entries are treated
//! as misses and physically removed by [`SecretCache::sweep_expired`].

use crate::cache::clock::{Clock, SystemClock};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use zeroize::Zeroizing;

/// Decrypted plaintext, wiped when the last reference is dropped
pub type SecretValue = Arc<Zeroizing<String>>;

/// A cached decrypted value
struct CachedSecret {
    value: SecretValue,
    produced_at: Instant,
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Entries currently held, including expired ones not yet swept
    pub entries: usize,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that missed or found an expired entry
    pub misses: u64,
    /// Entries removed by sweeps
    pub expired_removed: u64,
    /// Configured time-to-live
    pub ttl: Duration,
}

impl CacheStats {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Decrypted-value cache shared by all filesystem calls
pub struct SecretCache {
    entries: RwLock<HashMap<String, CachedSecret>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    hits: AtomicU64,
    misses: AtomicU64,
    expired_removed: AtomicU64,
}

impl SecretCache {
    /// Create a cache using the system clock
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    /// Create a cache reading time from `clock`
    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        SecretCache {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired_removed: AtomicU64::new(0),
        }
    }

    /// Look up a path. Expired entries are reported as misses but left in
    /// place for the sweeper.
    pub fn get(&self, path: &str) -> Option<SecretValue> {
        let now = self.clock.now();
        let entries = self.entries.read();

        let hit = entries
            .get(path)
            .filter(|cached| now.saturating_duration_since(cached.produced_at) < self.ttl)
            .map(|cached| Arc::clone(&cached.value));

        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Store a freshly decrypted value, replacing any previous entry
    pub fn put(&self, path: &str, value: String) -> SecretValue {
        let value: SecretValue = Arc::new(Zeroizing::new(value));
        let cached = CachedSecret {
            value: Arc::clone(&value),
            produced_at: self.clock.now(),
        };
        self.entries.write().insert(path.to_string(), cached);
        value
    }

    /// Remove every entry that has reached the TTL
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(self.clock.now())
    }

    /// Remove every entry whose age at `now` has reached the TTL
    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let ttl = self.ttl;
        let mut entries = self.entries.write();
        let before = entries.len();

        entries.retain(|path, cached| {
            let keep = now.saturating_duration_since(cached.produced_at) < ttl;
            if !keep {
                debug!("Removed expired cache entry for {}", path);
            }
            keep
        });

        let removed = before - entries.len();
        self.expired_removed
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of held entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Configured time-to-live
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired_removed: self.expired_removed.load(Ordering::Relaxed),
            ttl: self.ttl,
        }
    }
}
