//! Bounded in-memory cache tier with arena-indexed LRU eviction.
//!
//! The map and the doubly-linked recency list live behind a single
//! [`parking_lot::Mutex`]; the list itself is realized as a `Vec<Node>`
//! addressed by stable `u32` indices rather than `Rc`/`Weak` pointers, which
//! keeps every operation free of borrow-checker friction and O(1). A
//! background task re-applies eviction on a timer using a try-lock with a
//! short backoff sleep, so a contended trim pass never blocks a foreground
//! `get`/`put`.

use crate::{
    config::MemoryStoreLimits,
    image::CachedImage,
    key::CacheKey,
    stats::{AtomicCacheMetrics, CacheStats},
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::watch, task::JoinHandle, time::interval};
use tracing::debug;

const TRIM_BACKOFF: Duration = Duration::from_millis(10);

struct Node {
    key: CacheKey,
    value: CachedImage,
    cost: u64,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Inner {
    nodes: Vec<Option<Node>>,
    free: Vec<u32>,
    map: HashMap<CacheKey, u32>,
    head: Option<u32>,
    tail: Option<u32>,
    total_cost: u64,
    total_count: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            map: HashMap::new(),
            head: None,
            tail: None,
            total_cost: 0,
            total_count: 0,
        }
    }

    fn detach(&mut self, idx: u32) {
        let (prev, next) = {
            let node = self.nodes[idx as usize].as_ref().expect("node must exist");
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.nodes[p as usize].as_mut().expect("prev exists").next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n as usize].as_mut().expect("next exists").prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: u32) {
        let old_head = self.head;
        {
            let node = self.nodes[idx as usize].as_mut().expect("node must exist");
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.nodes[h as usize].as_mut().expect("head exists").prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn promote(&mut self, idx: u32) {
        if self.head == Some(idx) {
            return;
        }
        self.detach(idx);
        self.push_front(idx);
    }

    fn alloc(&mut self, node: Node) -> u32 {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = Some(node);
            idx
        } else {
            let idx = u32::try_from(self.nodes.len()).unwrap_or(u32::MAX);
            self.nodes.push(Some(node));
            idx
        }
    }

    fn remove_idx(&mut self, idx: u32) -> Node {
        self.detach(idx);
        let node = self.nodes[idx as usize].take().expect("node must exist");
        self.free.push(idx);
        self.total_cost -= node.cost;
        self.total_count -= 1;
        node
    }

    /// Pops the tail node, if any, returning it without freeing its slot
    /// (the caller frees it via [`Inner::remove_idx`]-equivalent bookkeeping
    /// after also removing it from `map`).
    fn pop_tail(&mut self) -> Option<u32> {
        self.tail
    }
}

/// Bounded, single-mutex-guarded in-memory cache with LRU-by-cost-and-count
/// eviction.
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    limits_rx: watch::Receiver<MemoryStoreLimits>,
    metrics: Arc<AtomicCacheMetrics>,
    trim_handle: Option<JoinHandle<()>>,
}

impl MemoryStore {
    /// Creates a store with a fixed pair of limits and no background trim
    /// task.
    #[must_use]
    pub fn new(limits: MemoryStoreLimits) -> Self {
        let (_tx, rx) = watch::channel(limits);
        Self {
            inner: Arc::new(Mutex::new(Inner::new())),
            limits_rx: rx,
            metrics: Arc::new(AtomicCacheMetrics::new()),
            trim_handle: None,
        }
    }

    /// Creates a store whose limits track `limits_rx` live, and starts a
    /// background trim task that re-applies eviction every
    /// `auto_trim_interval`.
    #[must_use]
    pub fn with_live_limits(
        limits_rx: watch::Receiver<MemoryStoreLimits>,
        auto_trim_interval: Duration,
    ) -> Self {
        let mut store = Self {
            inner: Arc::new(Mutex::new(Inner::new())),
            limits_rx,
            metrics: Arc::new(AtomicCacheMetrics::new()),
            trim_handle: None,
        };
        if auto_trim_interval > Duration::ZERO {
            store.start_trim_task(auto_trim_interval);
        }
        store
    }

    fn start_trim_task(&mut self, period: Duration) {
        let inner = Arc::clone(&self.inner);
        let limits_rx = self.limits_rx.clone();
        let metrics = Arc::clone(&self.metrics);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                Self::trim_once_with_backoff(&inner, &limits_rx, &metrics).await;
            }
        });
        self.trim_handle = Some(handle);
    }

    async fn trim_once_with_backoff(
        inner: &Arc<Mutex<Inner>>,
        limits_rx: &watch::Receiver<MemoryStoreLimits>,
        metrics: &AtomicCacheMetrics,
    ) {
        loop {
            if let Some(mut guard) = inner.try_lock() {
                let limits = *limits_rx.borrow();
                Self::evict_to_limits(&mut guard, limits, metrics);
                return;
            }
            tokio::time::sleep(TRIM_BACKOFF).await;
        }
    }

    fn evict_to_limits(inner: &mut Inner, limits: MemoryStoreLimits, metrics: &AtomicCacheMetrics) {
        while (limits.max_cost > 0 && inner.total_cost > limits.max_cost)
            || (limits.max_count > 0 && inner.total_count > limits.max_count)
        {
            let Some(tail_idx) = inner.pop_tail() else {
                break;
            };
            let key = inner.nodes[tail_idx as usize]
                .as_ref()
                .expect("tail node must exist")
                .key
                .clone();
            inner.map.remove(&key);
            let node = inner.remove_idx(tail_idx);
            metrics.record_remove(node.cost as usize, true);
            debug!(key = %key, cost = node.cost, "memory store evicted entry");
        }
    }

    /// Looks up `key`, promoting it to the front of the recency list on a
    /// hit.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CachedImage> {
        let mut guard = self.inner.lock();
        let Some(&idx) = guard.map.get(key) else {
            self.metrics.record_get(false);
            return None;
        };
        guard.promote(idx);
        let value = guard.nodes[idx as usize]
            .as_ref()
            .expect("node must exist")
            .value
            .clone();
        self.metrics.record_get(true);
        Some(value)
    }

    /// Stores `value` under `key` with the given `cost`, promoting it to
    /// the front. Overwrites any existing entry in place. Triggers
    /// immediate eviction if a limit is now exceeded.
    pub fn put(&self, key: CacheKey, value: CachedImage, cost: u64) {
        let mut guard = self.inner.lock();
        let is_new_entry;
        let cost_delta: i64;

        if let Some(&idx) = guard.map.get(&key) {
            let old_cost = {
                let node = guard.nodes[idx as usize].as_mut().expect("node must exist");
                let old_cost = node.cost;
                node.value = value;
                node.cost = cost;
                old_cost
            };
            guard.total_cost = guard.total_cost - old_cost + cost;
            guard.promote(idx);
            is_new_entry = false;
            cost_delta = i64::try_from(cost).unwrap_or(i64::MAX) - i64::try_from(old_cost).unwrap_or(i64::MAX);
        } else {
            let idx = guard.alloc(Node {
                key: key.clone(),
                value,
                cost,
                prev: None,
                next: None,
            });
            guard.push_front(idx);
            guard.map.insert(key, idx);
            guard.total_cost += cost;
            guard.total_count += 1;
            is_new_entry = true;
            cost_delta = i64::try_from(cost).unwrap_or(i64::MAX);
        }

        self.metrics.record_put(cost_delta, is_new_entry);

        let limits = *self.limits_rx.borrow();
        Self::evict_to_limits(&mut guard, limits, &self.metrics);
    }

    /// Removes `key`. A no-op if absent.
    pub fn remove(&self, key: &CacheKey) {
        let mut guard = self.inner.lock();
        if let Some(idx) = guard.map.remove(key) {
            let node = guard.remove_idx(idx);
            self.metrics.record_remove(node.cost as usize, false);
        }
    }

    /// Removes every entry. The previous backing map and node arena are
    /// dropped on a low-priority worker rather than on the caller's thread,
    /// so a large cache does not stall whoever called `clear()`.
    pub fn clear(&self) {
        let old = {
            let mut guard = self.inner.lock();
            self.metrics.reset_residency();
            std::mem::replace(&mut *guard, Inner::new())
        };
        tokio::task::spawn_blocking(move || drop(old));
    }

    /// Current resident entry count and total cost.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot()
    }

    /// Whether `key` is resident, without promoting it (a presence check is
    /// not an access for eviction purposes).
    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().map.contains_key(key)
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if let Some(handle) = self.trim_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn image(cost_bytes: u64) -> CachedImage {
        CachedImage {
            width: 1,
            height: 1,
            scale: 1,
            frame_count: 1,
            format: "raw".to_string(),
            encoded: bytes::Bytes::from(vec![0u8; cost_bytes as usize]),
        }
    }

    #[test]
    fn put_then_get_roundtrips() {
        let store = MemoryStore::new(MemoryStoreLimits::default());
        let key = CacheKey::from_url("http://h/a.png");
        store.put(key.clone(), image(10), 10);
        assert_eq!(store.get(&key).expect("should be present").width, 1);
    }

    #[test]
    fn unbounded_limits_never_evict() {
        let store = MemoryStore::new(MemoryStoreLimits { max_cost: 0, max_count: 0 });
        for i in 0..100 {
            let key = CacheKey::from_url(&format!("http://h/{i}.png"));
            store.put(key, image(1_000_000), 1_000_000);
        }
        assert_eq!(store.stats().entry_count, 100);
    }

    #[test]
    fn max_count_evicts_lru_tail() {
        let store = MemoryStore::new(MemoryStoreLimits { max_cost: 0, max_count: 3 });
        let a = CacheKey::from_url("http://h/a.png");
        let b = CacheKey::from_url("http://h/b.png");
        let c = CacheKey::from_url("http://h/c.png");
        let d = CacheKey::from_url("http://h/d.png");

        store.put(a.clone(), image(1), 1);
        store.put(b.clone(), image(1), 1);
        store.put(c.clone(), image(1), 1);
        store.put(d.clone(), image(1), 1);

        assert!(store.get(&a).is_none(), "a should have been evicted");
        assert!(store.get(&b).is_some());
        assert!(store.get(&c).is_some());
        assert!(store.get(&d).is_some());
        assert_eq!(store.stats().entry_count, 3);
    }

    #[test]
    fn get_promotes_entry_ahead_of_eviction() {
        let store = MemoryStore::new(MemoryStoreLimits { max_cost: 0, max_count: 2 });
        let a = CacheKey::from_url("http://h/a.png");
        let b = CacheKey::from_url("http://h/b.png");
        let c = CacheKey::from_url("http://h/c.png");

        store.put(a.clone(), image(1), 1);
        store.put(b.clone(), image(1), 1);
        // touch a so it is most-recently-used, pushing b toward eviction
        assert!(store.get(&a).is_some());
        store.put(c.clone(), image(1), 1);

        assert!(store.get(&a).is_some());
        assert!(store.get(&b).is_none(), "b should have been evicted, not a");
        assert!(store.get(&c).is_some());
    }

    #[test]
    fn max_cost_evicts_by_total_cost() {
        let store = MemoryStore::new(MemoryStoreLimits { max_cost: 25, max_count: 0 });
        let a = CacheKey::from_url("http://h/a.png");
        let b = CacheKey::from_url("http://h/b.png");

        store.put(a.clone(), image(20), 20);
        store.put(b.clone(), image(20), 20);

        assert!(store.get(&a).is_none());
        assert!(store.get(&b).is_some());
        assert_eq!(store.stats().total_cost, 20);
    }

    #[test]
    fn remove_is_noop_on_absent_key() {
        let store = MemoryStore::new(MemoryStoreLimits::default());
        store.remove(&CacheKey::from_url("http://h/missing.png"));
        assert_eq!(store.stats().entry_count, 0);
    }

    #[test]
    fn clear_empties_the_store() {
        let store = MemoryStore::new(MemoryStoreLimits::default());
        store.put(CacheKey::from_url("http://h/a.png"), image(1), 1);
        store.clear();
        assert_eq!(store.stats().entry_count, 0);
        assert!(store.get(&CacheKey::from_url("http://h/a.png")).is_none());
    }

    #[test]
    fn overwriting_existing_key_updates_cost_without_duplicating_entry() {
        let store = MemoryStore::new(MemoryStoreLimits::default());
        let key = CacheKey::from_url("http://h/a.png");
        store.put(key.clone(), image(10), 10);
        store.put(key.clone(), image(30), 30);
        assert_eq!(store.stats().entry_count, 1);
        assert_eq!(store.stats().total_cost, 30);
    }

    #[test]
    fn contains_does_not_affect_eviction_order() {
        let store = MemoryStore::new(MemoryStoreLimits { max_cost: 0, max_count: 2 });
        let a = CacheKey::from_url("http://h/a.png");
        let b = CacheKey::from_url("http://h/b.png");
        let c = CacheKey::from_url("http://h/c.png");

        store.put(a.clone(), image(1), 1);
        store.put(b.clone(), image(1), 1);
        assert!(store.contains(&a));
        store.put(c.clone(), image(1), 1);

        // contains() must not have promoted `a`; `a` is still the LRU tail.
        assert!(store.get(&a).is_none());
    }

    #[tokio::test]
    async fn concurrent_puts_and_gets_stay_consistent() {
        let store = Arc::new(MemoryStore::new(MemoryStoreLimits { max_cost: 0, max_count: 50 }));
        let mut handles = Vec::new();
        for i in 0..10 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for j in 0..20 {
                    let key = CacheKey::from_url(&format!("http://h/{i}-{j}.png"));
                    store.put(key.clone(), image(1), 1);
                    let _ = store.get(&key);
                }
            }));
        }
        for handle in handles {
            handle.await.expect("task should not panic");
        }
        assert!(store.stats().entry_count <= 50);
    }
}
