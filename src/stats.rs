//! Cache statistics and metrics.
//!
//! Thread-safe counters for each tier's get/put/remove/eviction activity,
//! using cache-line-aligned atomics to reduce false sharing under
//! concurrent access.

#![allow(clippy::cast_precision_loss)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[repr(align(64))]
#[derive(Debug)]
struct CacheAlignedAtomicU64(AtomicU64);

#[repr(align(64))]
#[derive(Debug)]
struct CacheAlignedAtomicUsize(AtomicUsize);

impl CacheAlignedAtomicU64 {
    fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    #[inline]
    fn load(&self, ordering: Ordering) -> u64 {
        self.0.load(ordering)
    }

    #[inline]
    fn fetch_add(&self, value: u64, ordering: Ordering) -> u64 {
        self.0.fetch_add(value, ordering)
    }
}

impl CacheAlignedAtomicUsize {
    fn new(value: usize) -> Self {
        Self(AtomicUsize::new(value))
    }

    #[inline]
    fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering)
    }

    #[inline]
    fn fetch_add(&self, value: usize, ordering: Ordering) -> usize {
        self.0.fetch_add(value, ordering)
    }

    #[inline]
    fn fetch_sub(&self, value: usize, ordering: Ordering) -> usize {
        self.0.fetch_sub(value, ordering)
    }

    #[inline]
    fn fetch_max(&self, value: usize, ordering: Ordering) -> usize {
        self.0.fetch_max(value, ordering)
    }

    #[inline]
    fn store(&self, value: usize, ordering: Ordering) {
        self.0.store(value, ordering);
    }
}

/// Point-in-time statistics snapshot for one cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Total number of `get` calls.
    pub get_count: u64,
    /// Number of `get` calls that found an entry.
    pub hit_count: u64,
    /// Number of `get` calls that found nothing.
    pub miss_count: u64,
    /// Total number of `put` calls.
    pub put_count: u64,
    /// Total number of `remove` calls.
    pub remove_count: u64,
    /// Total number of entries evicted under a limit.
    pub eviction_count: u64,
    /// Current number of resident entries.
    pub entry_count: usize,
    /// Current total cost/bytes of resident entries.
    pub total_cost: usize,
}

impl CacheStats {
    /// Fraction of `get` calls that were hits, or `0.0` with no gets yet.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        if self.get_count == 0 {
            0.0
        } else {
            self.hit_count as f64 / self.get_count as f64
        }
    }
}

/// Atomic counters backing a [`CacheStats`] snapshot.
///
/// Each independently-updated counter sits on its own cache line so that,
/// e.g., a hot `get_count` increment on one thread does not invalidate the
/// cache line a concurrent `put` is updating on another.
#[derive(Debug)]
pub struct AtomicCacheMetrics {
    get_count: CacheAlignedAtomicU64,
    hit_count: CacheAlignedAtomicU64,
    miss_count: CacheAlignedAtomicU64,
    put_count: CacheAlignedAtomicU64,
    remove_count: CacheAlignedAtomicU64,
    eviction_count: CacheAlignedAtomicU64,
    entry_count: CacheAlignedAtomicUsize,
    total_cost: CacheAlignedAtomicUsize,
}

impl AtomicCacheMetrics {
    /// Creates a zeroed set of counters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            get_count: CacheAlignedAtomicU64::new(0),
            hit_count: CacheAlignedAtomicU64::new(0),
            miss_count: CacheAlignedAtomicU64::new(0),
            put_count: CacheAlignedAtomicU64::new(0),
            remove_count: CacheAlignedAtomicU64::new(0),
            eviction_count: CacheAlignedAtomicU64::new(0),
            entry_count: CacheAlignedAtomicUsize::new(0),
            total_cost: CacheAlignedAtomicUsize::new(0),
        }
    }

    /// Records a `get`, hit or miss.
    #[inline]
    pub fn record_get(&self, hit: bool) {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hit_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.miss_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a `put` that added `cost` to the tier (0 if it only
    /// overwrote an existing entry of equal cost).
    #[inline]
    pub fn record_put(&self, cost_delta: i64, is_new_entry: bool) {
        self.put_count.fetch_add(1, Ordering::Relaxed);
        if is_new_entry {
            self.entry_count.fetch_add(1, Ordering::Relaxed);
        }
        if cost_delta >= 0 {
            self.total_cost
                .fetch_add(cost_delta as usize, Ordering::Relaxed);
        } else {
            self.total_cost
                .fetch_sub((-cost_delta) as usize, Ordering::Relaxed);
        }
    }

    /// Records a `remove` (or an eviction, via `evicted = true`).
    #[inline]
    pub fn record_remove(&self, cost: usize, evicted: bool) {
        if evicted {
            self.eviction_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.remove_count.fetch_add(1, Ordering::Relaxed);
        }
        self.entry_count.fetch_sub(1, Ordering::Relaxed);
        self.total_cost.fetch_sub(cost, Ordering::Relaxed);
    }

    /// Resets the resident-entry counters to zero, for a tier-wide
    /// `clear()`. Cumulative counters (`get_count`, `put_count`, ...) are
    /// left untouched.
    #[inline]
    pub fn reset_residency(&self) {
        self.entry_count.store(0, Ordering::Relaxed);
        self.total_cost.store(0, Ordering::Relaxed);
    }

    /// Takes a consistent point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            get_count: self.get_count.load(Ordering::Acquire),
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            put_count: self.put_count.load(Ordering::Relaxed),
            remove_count: self.remove_count.load(Ordering::Relaxed),
            eviction_count: self.eviction_count.load(Ordering::Relaxed),
            entry_count: self.entry_count.load(Ordering::Relaxed),
            total_cost: self.total_cost.load(Ordering::Relaxed),
        }
    }

    /// Peak memory tracking is intentionally not kept here; callers needing
    /// a high-water mark should sample `snapshot().total_cost` externally
    /// (the metrics here only track hot-path counters, not derived maxima).
    #[inline]
    #[must_use]
    pub fn fetch_max_entry_count(&self, candidate: usize) -> usize {
        self.entry_count.fetch_max(candidate, Ordering::Relaxed)
    }
}

impl Default for AtomicCacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}
