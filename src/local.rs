//! Local Tier - In-Process Hot Cache
//!
//! Bounded per-process cache holding interchange bytes for the hottest keys.
//! Every entry carries its own deadline, so a local hit can never outlive the
//! shared tier copy it was projected from.
//!
//! # Design
//!
//! - DashMap storage for low-contention concurrent access
//! - Count-bounded with batch eviction, least recently accessed first
//! - Expired entries are dropped lazily on read and during eviction sweeps
//! - Tag and pattern sweeps back the invalidation fan-out

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;

use crate::key::pattern_matches;

// =============================================================================
// Configuration
// =============================================================================

/// Local tier configuration
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Entries removed per eviction sweep
    pub eviction_batch_size: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            eviction_batch_size: 1_000,
        }
    }
}

// =============================================================================
// Entry
// =============================================================================

struct LocalEntry {
    /// Interchange bytes, never compressed
    bytes: Bytes,
    /// Tags the entry was stored under
    tags: Vec<String>,
    /// Absolute deadline
    expires_at: Instant,
    /// Access clock tick of the most recent read or write
    last_access: AtomicU64,
}

impl LocalEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

// =============================================================================
// Local tier
// =============================================================================

/// In-process cache tier
pub struct LocalTier {
    /// Entry storage
    entries: DashMap<String, LocalEntry>,
    /// Configuration
    config: LocalConfig,
    /// Monotonic access clock for recency ordering
    access_clock: AtomicU64,
    /// Current payload bytes held
    current_bytes: AtomicU64,
    /// Hit count
    hits: AtomicU64,
    /// Miss count
    misses: AtomicU64,
    /// Capacity eviction count
    evictions: AtomicU64,
    /// Lazy expiry count
    expired: AtomicU64,
}

impl LocalTier {
    /// Create a local tier with default configuration
    pub fn new() -> Self {
        Self::with_config(LocalConfig::default())
    }

    /// Create a local tier with custom configuration
    pub fn with_config(config: LocalConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            access_clock: AtomicU64::new(0),
            current_bytes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Get the interchange bytes stored under a key
    pub fn get(&self, key: &str) -> Option<Bytes> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                entry.last_access.store(self.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.bytes.clone());
            }
        }

        // Drop the expired copy, if that is what we found
        if let Some((_, entry)) = self.entries.remove_if(key, |_, e| e.is_expired()) {
            self.current_bytes
                .fetch_sub(entry.bytes.len() as u64, Ordering::Relaxed);
            self.expired.fetch_add(1, Ordering::Relaxed);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store interchange bytes under a key with a bounded lifetime
    pub fn insert(&self, key: String, bytes: Bytes, ttl: Duration, tags: &[String]) {
        if self.entries.len() >= self.config.max_entries && !self.entries.contains_key(&key) {
            self.evict_batch();
        }

        let size = bytes.len() as u64;
        let entry = LocalEntry {
            bytes,
            tags: tags.to_vec(),
            expires_at: Instant::now() + ttl,
            last_access: AtomicU64::new(self.tick()),
        };

        if let Some(old) = self.entries.insert(key, entry) {
            self.current_bytes
                .fetch_sub(old.bytes.len() as u64, Ordering::Relaxed);
        }
        self.current_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Remove a single entry
    pub fn remove(&self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some((_, entry)) => {
                self.current_bytes
                    .fetch_sub(entry.bytes.len() as u64, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Remove every entry stored under a tag, returning how many were dropped
    pub fn remove_by_tag(&self, tag: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().tags.iter().any(|t| t == tag))
            .map(|e| e.key().clone())
            .collect();

        keys.iter().filter(|k| self.remove(k)).count()
    }

    /// Remove every entry whose key matches a glob pattern
    pub fn remove_by_pattern(&self, pattern: &str) -> usize {
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| pattern_matches(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();

        keys.iter().filter(|k| self.remove(k)).count()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
        self.current_bytes.store(0, Ordering::Relaxed);
    }

    /// Check if a live copy of the key is present
    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| !e.is_expired())
            .unwrap_or(false)
    }

    fn tick(&self) -> u64 {
        self.access_clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Evict the least recently accessed batch; expired entries go first
    fn evict_batch(&self) {
        let mut candidates: Vec<(String, bool, u64)> = self
            .entries
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.value().is_expired(),
                    e.value().last_access.load(Ordering::Relaxed),
                )
            })
            .collect();

        candidates.sort_by_key(|&(_, expired, tick)| (!expired, tick));

        for (key, _, _) in candidates
            .into_iter()
            .take(self.config.eviction_batch_size)
        {
            if self.remove(&key) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the tier is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get current payload bytes held
    pub fn bytes(&self) -> u64 {
        self.current_bytes.load(Ordering::Relaxed)
    }

    /// Get hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Get capacity eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get lazy expiry count
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    /// Get tier statistics
    pub fn stats(&self) -> LocalStats {
        LocalStats {
            entries: self.len(),
            max_entries: self.config.max_entries,
            bytes: self.bytes(),
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            evictions: self.evictions(),
            expired: self.expired(),
        }
    }
}

impl Default for LocalTier {
    fn default() -> Self {
        Self::new()
    }
}

/// Local tier statistics
#[derive(Debug, Clone, Serialize)]
pub struct LocalStats {
    /// Number of entries
    pub entries: usize,
    /// Configured entry bound
    pub max_entries: usize,
    /// Payload bytes held
    pub bytes: u64,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
    /// Capacity eviction count
    pub evictions: u64,
    /// Lazy expiry count
    pub expired: u64,
}

// =============================================================================
// Tests
// =============================================================================
