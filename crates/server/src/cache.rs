use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Hit/miss counters shared with the metrics registry.
#[derive(Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

struct Entry<V> {
    value: V,
    inserted: Instant,
    seq: u64,
}

struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,
    /// Recency queue of (key, seq). Entries whose seq no longer matches the
    /// map are stale markers and skipped during eviction.
    order: VecDeque<(K, u64)>,
    seq: u64,
}

/// Small in-memory LRU with per-entry TTL. Lock is held only for map
/// bookkeeping; values are cloned out.
pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    ttl: Duration,
    stats: Arc<CacheStats>,
}

impl<K: Hash + Eq + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
                seq: 0,
            }),
            capacity: capacity.max(1),
            ttl,
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<CacheStats> {
        Arc::clone(&self.stats)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *guard;
        let now = Instant::now();

        let expired = matches!(inner.map.get(key), Some(e) if now.duration_since(e.inserted) >= self.ttl);
        if expired {
            inner.map.remove(key);
        }

        inner.seq += 1;
        let seq = inner.seq;
        match inner.map.get_mut(key) {
            Some(entry) => {
                entry.seq = seq;
                let value = entry.value.clone();
                inner.order.push_back((key.clone(), seq));
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let inner = &mut *guard;
        inner.seq += 1;
        let seq = inner.seq;
        inner.order.push_back((key.clone(), seq));
        inner.map.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
                seq,
            },
        );

        // Evict least-recently-used entries, skipping stale queue markers.
        while inner.map.len() > self.capacity {
            let Some((candidate, marker_seq)) = inner.order.pop_front() else {
                break;
            };
            let is_current = inner
                .map
                .get(&candidate)
                .is_some_and(|e| e.seq == marker_seq);
            if is_current {
                inner.map.remove(&candidate);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).map.len()
    }
}
