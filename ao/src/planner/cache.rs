//! LRU cache for planning results
//!
//! Repeated queries skip decomposition entirely. Keys hash the
//! normalized query, the strategy and the planning-relevant subset of
//! the context; per-request identifiers never reach the key, so
//! logically identical requests collide as intended.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use super::{PlanningResult, PlanningStrategy};

/// Context keys that influence planning; everything else is ignored
const RELEVANT_CONTEXT_KEYS: &[&str] = &["max_depth", "constraints", "preferences"];

/// Cache counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub sets: u64,
    pub current_size: usize,
    pub max_size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: PlanningResult,
    cached_at: DateTime<Utc>,
    access_count: u64,
}

impl CacheEntry {
    fn is_expired(&self, ttl_seconds: Option<u64>) -> bool {
        match ttl_seconds {
            Some(ttl) => (Utc::now() - self.cached_at).num_seconds() as u64 > ttl,
            None => false,
        }
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// LRU order: front = least recently used
    order: VecDeque<String>,
    stats: CacheStats,
}

impl CacheInner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
    }
}

/// Bounded LRU memoizing planner outputs
pub struct PlanCache {
    max_size: usize,
    ttl_seconds: Option<u64>,
    inner: Mutex<CacheInner>,
}

impl PlanCache {
    pub fn new(max_size: usize, ttl_seconds: Option<u64>) -> Self {
        Self {
            max_size: max_size.max(1),
            ttl_seconds,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Cache key: SHA-256 over the canonical JSON of the normalized
    /// query, strategy name and planning-relevant context subset
    pub fn key(query: &str, strategy: PlanningStrategy, context: Option<&Map<String, Value>>) -> String {
        let normalized_query = query.trim().to_lowercase();
        let relevant: Map<String, Value> = context
            .map(|ctx| {
                RELEVANT_CONTEXT_KEYS
                    .iter()
                    .filter_map(|k| ctx.get(*k).map(|v| (k.to_string(), v.clone())))
                    .collect()
            })
            .unwrap_or_default();

        let payload = json!({
            "context": relevant,
            "query": normalized_query,
            "strategy": strategy.to_string(),
        });

        let mut hasher = Sha256::new();
        hasher.update(canonical(&payload).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Fetch an entry; an expired entry is purged and counts as a miss
    pub fn get(&self, key: &str) -> Option<PlanningResult> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        let Some(entry) = inner.entries.get(key) else {
            inner.stats.misses += 1;
            return None;
        };

        if entry.is_expired(self.ttl_seconds) {
            inner.remove(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            return None;
        }

        inner.touch(key);
        let entry = inner.entries.get_mut(key).expect("entry present after touch");
        entry.access_count += 1;
        let result = entry.result.clone();
        inner.stats.hits += 1;
        Some(result)
    }

    /// Insert an entry, evicting the least recently used when full
    pub fn put(&self, key: &str, result: PlanningResult) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        let entry = CacheEntry {
            result,
            cached_at: Utc::now(),
            access_count: 0,
        };

        if inner.entries.contains_key(key) {
            inner.entries.insert(key.to_string(), entry);
            inner.touch(key);
        } else {
            if inner.entries.len() >= self.max_size
                && let Some(lru) = inner.order.pop_front()
            {
                inner.entries.remove(&lru);
                inner.stats.evictions += 1;
            }
            inner.entries.insert(key.to_string(), entry);
            inner.order.push_back(key.to_string());
        }

        inner.stats.sets += 1;
    }

    /// Drop one entry, or everything when no key is given
    pub fn invalidate(&self, key: Option<&str>) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        match key {
            Some(k) => inner.remove(k),
            None => {
                inner.entries.clear();
                inner.order.clear();
            }
        }
    }

    /// Purge every expired entry
    pub fn clear_expired(&self) {
        if self.ttl_seconds.is_none() {
            return;
        }
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(self.ttl_seconds))
            .map(|(k, _)| k.clone())
            .collect();

        inner.stats.expirations += expired.len() as u64;
        for key in expired {
            inner.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().expect("cache lock poisoned");
        CacheStats {
            current_size: inner.entries.len(),
            max_size: self.max_size,
            ..inner.stats.clone()
        }
    }
}

fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::to_string(k).unwrap(), canonical(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", rendered.join(","))
        }
        other => serde_json::to_string(other).unwrap(),
    }
}

// Process-wide instance. Tests reset it via `reset_global`.
static GLOBAL: Mutex<Option<Arc<PlanCache>>> = Mutex::new(None);

/// Initialize the process-wide plan cache
pub fn init_global(max_size: usize, ttl_seconds: Option<u64>) -> Arc<PlanCache> {
    let cache = Arc::new(PlanCache::new(max_size, ttl_seconds));
    *GLOBAL.lock().expect("cache global lock poisoned") = Some(cache.clone());
    cache
}

/// The process-wide plan cache, if initialized
pub fn global() -> Option<Arc<PlanCache>> {
    GLOBAL.lock().expect("cache global lock poisoned").clone()
}

/// Drop the process-wide plan cache
pub fn reset_global() {
    *GLOBAL.lock().expect("cache global lock poisoned") = None;
}
