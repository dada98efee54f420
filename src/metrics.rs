//! Cache Metrics Collection
//!
//! Counters, occupancy gauges, and latency sample windows for monitoring
//! engine health. [`CacheMetrics::snapshot_and_reset`] produces disjoint
//! observation windows: every counter and latency sample is cleared the
//! moment the snapshot is taken, so consecutive snapshots never overlap.
//! Occupancy gauges are point-in-time readings and survive the reset.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Maximum latency samples retained per window; older samples are
/// overwritten once the window is full.
const SAMPLE_CAPACITY: usize = 2048;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Local tier counters
    local_hits: AtomicU64,
    local_misses: AtomicU64,

    // Shared tier counters
    shared_hits: AtomicU64,
    shared_misses: AtomicU64,

    // Write path counters
    sets: AtomicU64,
    deletes: AtomicU64,
    invalidations: AtomicU64,

    // Stampede control counters
    locks_acquired: AtomicU64,
    lock_waits: AtomicU64,
    stampede_timeouts: AtomicU64,
    stale_serves: AtomicU64,

    // Fail-open read path counters
    read_errors: AtomicU64,
    decode_failures: AtomicU64,

    // Local tier occupancy gauges
    local_entries: AtomicU64,
    local_bytes: AtomicU64,

    // Latency sample windows (microseconds)
    read_latency: Mutex<LatencyWindow>,
    write_latency: Mutex<LatencyWindow>,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    // Local tier counters
    pub fn record_local_hit(&self) {
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_miss(&self) {
        self.local_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn local_hits(&self) -> u64 {
        self.local_hits.load(Ordering::Relaxed)
    }

    pub fn local_misses(&self) -> u64 {
        self.local_misses.load(Ordering::Relaxed)
    }

    pub fn local_hit_ratio(&self) -> f64 {
        let hits = self.local_hits() as f64;
        let total = hits + self.local_misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    // Shared tier counters
    pub fn record_shared_hit(&self) {
        self.shared_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shared_miss(&self) {
        self.shared_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn shared_hits(&self) -> u64 {
        self.shared_hits.load(Ordering::Relaxed)
    }

    pub fn shared_misses(&self) -> u64 {
        self.shared_misses.load(Ordering::Relaxed)
    }

    pub fn shared_hit_ratio(&self) -> f64 {
        let hits = self.shared_hits() as f64;
        let total = hits + self.shared_misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    // Write path counters
    pub fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidations(&self, count: u64) {
        self.invalidations.fetch_add(count, Ordering::Relaxed);
    }

    // Stampede control counters
    pub fn record_lock_acquired(&self) {
        self.locks_acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_wait(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stampede_timeout(&self) {
        self.stampede_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_serve(&self) {
        self.stale_serves.fetch_add(1, Ordering::Relaxed);
    }

    // Fail-open read path counters
    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Update local tier occupancy gauges
    pub fn update_local_stats(&self, bytes: u64, entries: u64) {
        self.local_bytes.store(bytes, Ordering::Relaxed);
        self.local_entries.store(entries, Ordering::Relaxed);
    }

    // Latency windows
    pub fn record_read_latency(&self, duration: Duration) {
        self.read_latency.lock().record(duration.as_micros() as u64);
    }

    pub fn record_write_latency(&self, duration: Duration) {
        self.write_latency
            .lock()
            .record(duration.as_micros() as u64);
    }

    /// Get overall cache hit ratio
    pub fn overall_hit_ratio(&self) -> f64 {
        let total_hits = self.local_hits() + self.shared_hits();
        let total_misses = self.shared_misses(); // Only count final misses
        let total = total_hits + total_misses;

        if total == 0 {
            0.0
        } else {
            total_hits as f64 / total as f64
        }
    }

    /// Get snapshot of all metrics without disturbing the current window
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            timestamp: Utc::now(),

            local_hits: self.local_hits(),
            local_misses: self.local_misses(),
            local_hit_ratio: self.local_hit_ratio(),
            local_entries: self.local_entries.load(Ordering::Relaxed),
            local_bytes: self.local_bytes.load(Ordering::Relaxed),

            shared_hits: self.shared_hits(),
            shared_misses: self.shared_misses(),
            shared_hit_ratio: self.shared_hit_ratio(),

            overall_hit_ratio: self.overall_hit_ratio(),

            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),

            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            lock_waits: self.lock_waits.load(Ordering::Relaxed),
            stampede_timeouts: self.stampede_timeouts.load(Ordering::Relaxed),
            stale_serves: self.stale_serves.load(Ordering::Relaxed),

            read_errors: self.read_errors.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),

            read_latency: self.read_latency.lock().summarize(),
            write_latency: self.write_latency.lock().summarize(),
        }
    }

    /// Get snapshot of all metrics and immediately start a fresh window.
    /// Counters and latency samples are cleared; occupancy gauges are not.
    pub fn snapshot_and_reset(&self) -> CacheStats {
        let stats = self.snapshot();
        self.reset();
        stats
    }

    /// Reset all counters and latency samples
    pub fn reset(&self) {
        self.local_hits.store(0, Ordering::Relaxed);
        self.local_misses.store(0, Ordering::Relaxed);
        self.shared_hits.store(0, Ordering::Relaxed);
        self.shared_misses.store(0, Ordering::Relaxed);
        self.sets.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
        self.locks_acquired.store(0, Ordering::Relaxed);
        self.lock_waits.store(0, Ordering::Relaxed);
        self.stampede_timeouts.store(0, Ordering::Relaxed);
        self.stale_serves.store(0, Ordering::Relaxed);
        self.read_errors.store(0, Ordering::Relaxed);
        self.decode_failures.store(0, Ordering::Relaxed);
        self.read_latency.lock().clear();
        self.write_latency.lock().clear();
    }
}

/// Bounded window of latency observations in microseconds.
#[derive(Debug, Default)]
struct LatencyWindow {
    samples: Vec<u64>,
    next: usize,
}

impl LatencyWindow {
    fn record(&mut self, micros: u64) {
        if self.samples.len() < SAMPLE_CAPACITY {
            self.samples.push(micros);
        } else {
            self.samples[self.next] = micros;
            self.next = (self.next + 1) % SAMPLE_CAPACITY;
        }
    }

    fn summarize(&self) -> LatencySummary {
        if self.samples.is_empty() {
            return LatencySummary::default();
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let sum: u64 = sorted.iter().sum();
        LatencySummary {
            avg_us: sum / sorted.len() as u64,
            p50_us: percentile(&sorted, 0.50),
            p95_us: percentile(&sorted, 0.95),
            p99_us: percentile(&sorted, 0.99),
            samples: sorted.len() as u64,
        }
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.next = 0;
    }
}

/// Nearest-rank lookup over an already sorted sample set.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

/// Latency distribution over one observation window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LatencySummary {
    pub avg_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub samples: u64,
}

/// Snapshot of all cache metrics for one observation window
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// When the snapshot was produced
    pub timestamp: DateTime<Utc>,

    // Local tier
    pub local_hits: u64,
    pub local_misses: u64,
    pub local_hit_ratio: f64,
    pub local_entries: u64,
    pub local_bytes: u64,

    // Shared tier
    pub shared_hits: u64,
    pub shared_misses: u64,
    pub shared_hit_ratio: f64,

    // Overall
    pub overall_hit_ratio: f64,

    // Write path
    pub sets: u64,
    pub deletes: u64,
    pub invalidations: u64,

    // Stampede control
    pub locks_acquired: u64,
    pub lock_waits: u64,
    pub stampede_timeouts: u64,
    pub stale_serves: u64,

    // Fail-open read path
    pub read_errors: u64,
    pub decode_failures: u64,

    // Latency
    pub read_latency: LatencySummary,
    pub write_latency: LatencySummary,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
