use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{Value, json};

use crate::cache::CacheStats;

/// Per-operation latency samples kept for percentile estimates.
const SAMPLE_WINDOW: usize = 256;

struct OpStats {
    count: u64,
    total_micros: u64,
    samples: VecDeque<u64>,
}

impl OpStats {
    fn record(&mut self, micros: u64) {
        self.count += 1;
        self.total_micros += micros;
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(micros);
    }

    fn avg_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_micros as f64 / self.count as f64 / 1000.0
        }
    }

    fn p95_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.95).ceil() as usize - 1;
        sorted[idx.min(sorted.len() - 1)] as f64 / 1000.0
    }
}

/// In-process performance counters: per-operation latency, plus named cache
/// hit/miss counters registered by their owners.
pub struct Metrics {
    ops: Mutex<HashMap<&'static str, OpStats>>,
    caches: Mutex<Vec<(&'static str, Arc<CacheStats>)>>,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(HashMap::new()),
            caches: Mutex::new(Vec::new()),
        })
    }

    pub fn record(&self, op: &'static str, elapsed: Duration) {
        let mut ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        ops.entry(op)
            .or_insert_with(|| OpStats {
                count: 0,
                total_micros: 0,
                samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            })
            .record(elapsed.as_micros() as u64);
    }

    pub fn register_cache(&self, name: &'static str, stats: Arc<CacheStats>) {
        let mut caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        caches.retain(|(n, _)| *n != name);
        caches.push((name, stats));
    }

    pub fn operations_json(&self) -> Value {
        let ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = serde_json::Map::new();
        for (name, stats) in ops.iter() {
            out.insert(
                name.to_string(),
                json!({
                    "count": stats.count,
                    "avg_ms": stats.avg_ms(),
                    "p95_ms": stats.p95_ms(),
                }),
            );
        }
        Value::Object(out)
    }

    pub fn caches_json(&self) -> Value {
        let caches = self.caches.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = serde_json::Map::new();
        for (name, stats) in caches.iter() {
            out.insert(
                name.to_string(),
                json!({
                    "hits": stats.hits(),
                    "misses": stats.misses(),
                    "hit_ratio": stats.hit_ratio(),
                }),
            );
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_counts_and_averages() {
        let metrics = Metrics::new();
        metrics.record("tool.add_message", Duration::from_millis(10));
        metrics.record("tool.add_message", Duration::from_millis(20));
        metrics.record("tool.get_messages", Duration::from_millis(5));

        let ops = metrics.operations_json();
        assert_eq!(ops["tool.add_message"]["count"], 2);
        let avg = ops["tool.add_message"]["avg_ms"].as_f64().unwrap();
        assert!((avg - 15.0).abs() < 1.0, "avg was {avg}");
        assert_eq!(ops["tool.get_messages"]["count"], 1);
    }

    #[test]
    fn p95_tracks_the_tail() {
        let metrics = Metrics::new();
        for _ in 0..99 {
            metrics.record("op", Duration::from_millis(1));
        }
        metrics.record("op", Duration::from_millis(100));
        let p95 = metrics.operations_json()["op"]["p95_ms"].as_f64().unwrap();
        assert!(p95 >= 1.0);

        // with a tail-heavy distribution, p95 reflects the slow samples
        let metrics = Metrics::new();
        for i in 0..100u64 {
            metrics.record("op", Duration::from_millis(i));
        }
        let p95 = metrics.operations_json()["op"]["p95_ms"].as_f64().unwrap();
        assert!(p95 >= 90.0, "p95 was {p95}");
    }

    #[test]
    fn sample_window_is_bounded() {
        let metrics = Metrics::new();
        for _ in 0..(SAMPLE_WINDOW + 100) {
            metrics.record("op", Duration::from_millis(1));
        }
        let ops = metrics.ops.lock().unwrap();
        assert_eq!(ops["op"].samples.len(), SAMPLE_WINDOW);
        assert_eq!(ops["op"].count, (SAMPLE_WINDOW + 100) as u64);
    }

    #[test]
    fn cache_registration_dedupes_by_name() {
        let metrics = Metrics::new();
        let a = Arc::new(CacheStats::default());
        let b = Arc::new(CacheStats::default());
        metrics.register_cache("search", a);
        metrics.register_cache("search", b);
        let json = metrics.caches_json();
        assert!(json.get("search").is_some());
        assert_eq!(json.as_object().unwrap().len(), 1);
    }
}
