//! Task result cache
//!
//! Nodes with a [`CachePolicy`] have their writes memoized: before running
//! such a task the runner derives a [`CacheKey`] from the task input and asks
//! the graph's [`Cache`]; on a hit the cached writes are used and the node is
//! not executed. Entries are grouped by namespace (one per node) so they can
//! be cleared per node.
//!
//! ```rust
//! use pregel_core::cache::{Cache, CacheKey, InMemoryCache};
//! use serde_json::json;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let cache = InMemoryCache::default();
//! let key = CacheKey::new(vec!["writes".into(), "summarize".into()], "abc", None);
//! cache.set(vec![(key.clone(), json!([["summary", "hi"]]))]).await;
//!
//! let hits = cache.get(&[key.clone()]).await;
//! assert_eq!(hits.get(&key), Some(&json!([["summary", "hi"]])));
//! assert_eq!(cache.metrics().await.hits, 1);
//! # }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Address of a cached entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub ns: Vec<String>,
    pub key: String,
    /// Time to live in seconds
    pub ttl: Option<u64>,
}

impl CacheKey {
    pub fn new(ns: Vec<String>, key: impl Into<String>, ttl: Option<u64>) -> Self {
        Self {
            ns,
            key: key.into(),
            ttl,
        }
    }

    fn slot(&self) -> (Vec<String>, String) {
        (self.ns.clone(), self.key.clone())
    }
}

/// How a node's cache key is derived from its input
#[derive(Clone)]
pub struct CachePolicy {
    pub key_func: Arc<dyn Fn(&Value) -> String + Send + Sync>,
    /// Time to live in seconds; `None` keeps entries until cleared
    pub ttl: Option<u64>,
}

impl CachePolicy {
    pub fn new<F>(key_func: F) -> Self
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        Self {
            key_func: Arc::new(key_func),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl = Some(seconds);
        self
    }

    pub fn key_for(&self, input: &Value) -> String {
        (self.key_func)(input)
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new(|input| {
            let mut hasher = DefaultHasher::new();
            input.to_string().hash(&mut hasher);
            format!("{:x}", hasher.finish())
        })
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePolicy")
            .field("key_func", &"<function>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Storage for memoized task writes
#[async_trait]
pub trait Cache: Send + Sync {
    /// Look up several keys; missing or expired keys are absent from the result.
    async fn get(&self, keys: &[CacheKey]) -> HashMap<CacheKey, Value>;

    /// Store values, each with the TTL of its key.
    async fn set(&self, entries: Vec<(CacheKey, Value)>);

    /// Drop every entry in `namespaces`, or everything when `None`.
    async fn clear(&self, namespaces: Option<&[Vec<String>]>);
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    last_accessed: Instant,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            value,
            last_accessed: now,
            expires_at: ttl.map(|duration| now + duration),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.map_or(false, |expiry| Instant::now() > expiry)
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entries kept before the least recently used one is evicted
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_size: 1000 }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: usize,
    pub misses: usize,
    pub evictions: usize,
    pub entries: usize,
}

impl CacheMetrics {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

type Slot = (Vec<String>, String);

/// In-process LRU [`Cache`] with per-entry TTL.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    storage: Arc<RwLock<HashMap<Slot, CacheEntry>>>,
    metrics: Arc<RwLock<CacheMetrics>>,
    config: CacheConfig,
}

impl InMemoryCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub async fn metrics(&self) -> CacheMetrics {
        self.metrics.read().await.clone()
    }

    fn evict_lru(storage: &mut HashMap<Slot, CacheEntry>) -> bool {
        let oldest = storage
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(slot, _)| slot.clone());
        oldest.map_or(false, |slot| storage.remove(&slot).is_some())
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, keys: &[CacheKey]) -> HashMap<CacheKey, Value> {
        let mut storage = self.storage.write().await;
        let mut metrics = self.metrics.write().await;
        let mut found = HashMap::new();

        for key in keys {
            let slot = key.slot();
            match storage.get_mut(&slot) {
                Some(entry) if !entry.is_expired() => {
                    entry.last_accessed = Instant::now();
                    metrics.hits += 1;
                    found.insert(key.clone(), entry.value.clone());
                }
                Some(_) => {
                    storage.remove(&slot);
                    metrics.misses += 1;
                }
                None => metrics.misses += 1,
            }
        }
        metrics.entries = storage.len();
        found
    }

    async fn set(&self, entries: Vec<(CacheKey, Value)>) {
        let mut storage = self.storage.write().await;
        let mut metrics = self.metrics.write().await;

        for (key, value) in entries {
            let slot = key.slot();
            if storage.len() >= self.config.max_size
                && !storage.contains_key(&slot)
                && Self::evict_lru(&mut storage)
            {
                metrics.evictions += 1;
            }
            storage.insert(slot, CacheEntry::new(value, key.ttl.map(Duration::from_secs)));
        }
        metrics.entries = storage.len();
    }

    async fn clear(&self, namespaces: Option<&[Vec<String>]>) {
        let mut storage = self.storage.write().await;
        match namespaces {
            Some(namespaces) => storage.retain(|(ns, _), _| !namespaces.contains(ns)),
            None => storage.clear(),
        }
        self.metrics.write().await.entries = storage.len();
    }
}
