//! Decision cache
//!
//! Bounded mapping from fingerprint to `(Outcome, policy_version,
//! expires_at)`. TTL expiry is the primary eviction; when the size bound is
//! hit, the least-recently-accessed tenth of entries is dropped. Entries
//! whose `policy_version` no longer matches the loaded version read as
//! misses and are purged lazily.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::Outcome;

struct CacheEntry {
    outcome: Outcome,
    policy_version: String,
    expires_at: Instant,
    /// Monotonic access stamp for LRU eviction
    last_access: AtomicU64,
}

/// Cache statistics tracked atomically.
#[derive(Debug, Default)]
struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Snapshot of cache statistics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Entries served from cache
    pub hits: u64,
    /// Lookups that found nothing usable
    pub misses: u64,
    /// Entries removed by TTL, version mismatch, or LRU pressure
    pub evictions: u64,
    /// Current entry count
    pub size: usize,
}

/// Fingerprint-keyed decision cache.
pub struct DecisionCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
    clock: AtomicU64,
    stats: CacheStats,
}

impl DecisionCache {
    /// Create with a size bound.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    /// Look up a fingerprint under the currently loaded policy version.
    ///
    /// Expired entries and entries cached under another version are evicted
    /// on access and read as misses.
    pub fn get(&self, fingerprint: &str, current_version: &str) -> Option<Outcome> {
        let usable = match self.entries.get(fingerprint) {
            None => None,
            Some(entry) => {
                if entry.expires_at <= Instant::now() || entry.policy_version != current_version {
                    None
                } else {
                    entry
                        .last_access
                        .store(self.tick(), Ordering::Relaxed);
                    Some(entry.outcome.clone())
                }
            }
        };

        match usable {
            Some(outcome) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(outcome)
            }
            None => {
                // Lazy purge of whatever made the entry unusable.
                if self.entries.remove(fingerprint).is_some() {
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                }
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert an outcome under the version that produced it.
    pub fn insert(&self, fingerprint: &str, outcome: Outcome, policy_version: &str, ttl: Duration) {
        if self.entries.len() >= self.max_entries {
            self.evict_lru();
        }
        self.entries.insert(
            fingerprint.to_string(),
            CacheEntry {
                outcome,
                policy_version: policy_version.to_string(),
                expires_at: Instant::now() + ttl,
                last_access: AtomicU64::new(self.tick()),
            },
        );
    }

    /// Statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }

    /// Drop all entries (used by tests and policy reload sweeps).
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Remove the least-recently-accessed ~10% of entries.
    fn evict_lru(&self) {
        let mut stamps: Vec<(String, u64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.last_access.load(Ordering::Relaxed)))
            .collect();
        stamps.sort_by_key(|(_, stamp)| *stamp);

        let victims = (stamps.len() / 10).max(1);
        for (key, _) in stamps.into_iter().take(victims) {
            if self.entries.remove(&key).is_some() {
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
