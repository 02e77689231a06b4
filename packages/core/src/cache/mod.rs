//! In-process cache-aside layer for read operations.
//!
//! Repository reads go through [`QueryCache::get_or_compute`]: a live entry
//! is returned without running the computation; otherwise the computation
//! runs, its latency is reported to the [`QueryMonitor`], and a successful
//! result is stored with `expires_at = now + ttl`. Errors propagate to the
//! caller and are never stored.
//!
//! The entry map is guarded by one async mutex that covers lookups, inserts
//! and eviction scans. It is never held while a computation runs, so two
//! concurrent misses on the same key may both compute; the later insert wins.
//!
//! Single-process memory only: separate instances diverge until TTL expiry.

pub mod key;
pub mod monitor;

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::metrics::AppMetrics;

pub use key::CacheKey;
pub use monitor::{QueryMonitor, QueryStats, SlowQuery};

/// Cache tuning, usually taken from [`Config`](crate::config::Config).
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub default_ttl: Duration,
    pub max_entries: usize,
    pub slow_query_threshold: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl: Duration::from_secs(60),
            max_entries: 1000,
            slow_query_threshold: Duration::from_secs(1),
        }
    }
}

struct CacheEntry {
    function: String,
    readable_key: String,
    value: Arc<dyn Any + Send + Sync>,
    expires_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_ratio: f64,
    pub queries: QueryStats,
}

pub struct QueryCache {
    settings: CacheSettings,
    entries: Mutex<HashMap<String, CacheEntry>>,
    monitor: QueryMonitor,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    metrics: Option<Arc<AppMetrics>>,
}

impl QueryCache {
    pub fn new(settings: CacheSettings) -> Self {
        let monitor = QueryMonitor::new(settings.slow_query_threshold);
        Self {
            settings,
            entries: Mutex::new(HashMap::new()),
            monitor,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<AppMetrics>) -> Self {
        self.monitor = QueryMonitor::new(self.settings.slow_query_threshold)
            .with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn monitor(&self) -> &QueryMonitor {
        &self.monitor
    }

    /// Bind a function identity and TTL once; see [`CachedQuery`]. `None`
    /// uses the configured default TTL.
    pub fn wrap(
        self: &Arc<Self>,
        function: impl Into<String>,
        ttl: impl Into<Option<Duration>>,
    ) -> CachedQuery {
        CachedQuery {
            cache: Arc::clone(self),
            function: function.into(),
            ttl: ttl.into().unwrap_or(self.settings.default_ttl),
        }
    }

    /// Return the cached value for `key`, or run `compute` and cache its
    /// successful result for `ttl`.
    ///
    /// A stored value of a different type than `T` is treated as a miss and
    /// overwritten.
    pub async fn get_or_compute<T, F, Fut, E>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        compute: F,
    ) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.settings.enabled {
            return self.timed(key.function(), compute).await;
        }
        if let Some(reason) = key.unserializable() {
            tracing::warn!("Not caching {}: unserializable argument ({})", key.function(), reason);
            return self.timed(key.function(), compute).await;
        }

        let digest = key.digest();
        {
            let entries = self.entries.lock().await;
            if let Some(entry) = entries.get(&digest) {
                if Instant::now() < entry.expires_at {
                    if let Some(value) = entry.value.downcast_ref::<T>() {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        if let Some(metrics) = &self.metrics {
                            metrics.cache_hits_total.inc();
                        }
                        tracing::debug!("Cache hit for {}", key.function());
                        return Ok(value.clone());
                    }
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.cache_misses_total.inc();
        }
        tracing::debug!("Cache miss for {}", key.function());

        let value = self.timed(key.function(), compute).await?;

        let mut entries = self.entries.lock().await;
        entries.insert(
            digest,
            CacheEntry {
                function: key.function().to_string(),
                readable_key: key.readable(),
                value: Arc::new(value.clone()),
                expires_at: Instant::now() + ttl,
            },
        );
        let evicted = self.evict(&mut entries);
        self.record_size(entries.len(), evicted);

        Ok(value)
    }

    /// Remove every entry whose readable key contains `pattern`, or every
    /// entry when `pattern` is `None`. Returns the number removed.
    pub async fn invalidate(&self, pattern: Option<&str>) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        match pattern {
            None => entries.clear(),
            Some(pattern) => entries.retain(|_, entry| !entry.readable_key.contains(pattern)),
        }
        let removed = before - entries.len();
        self.record_size(entries.len(), 0);

        match pattern {
            None => tracing::info!("Cache cleared ({} entries)", removed),
            Some(p) => tracing::info!("Invalidated {} cache entries matching '{}'", removed, p),
        }
        removed
    }

    /// Remove every entry cached for exactly this function identity.
    pub async fn invalidate_function(&self, function: &str) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.function != function);
        let removed = before - entries.len();
        self.record_size(entries.len(), 0);

        tracing::info!("Invalidated {} cache entries for {}", removed, function);
        removed
    }

    /// Drop every expired entry regardless of the size cap.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();
        self.record_size(entries.len(), 0);
        removed
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.len().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;

        CacheStats {
            enabled: self.settings.enabled,
            entries,
            max_entries: self.settings.max_entries,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_ratio: if lookups > 0 {
                hits as f64 / lookups as f64
            } else {
                0.0
            },
            queries: self.monitor.stats(),
        }
    }

    async fn timed<T, F, Fut, E>(&self, function: &str, compute: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = compute().await;
        self.monitor.record(function, started.elapsed());
        result
    }

    /// Two-pass eviction, only when over the cap: expired entries first,
    /// then soonest-expiring until the cap is met.
    fn evict(&self, entries: &mut HashMap<String, CacheEntry>) -> usize {
        let cap = self.settings.max_entries;
        if entries.len() <= cap {
            return 0;
        }

        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);

        if entries.len() > cap {
            let mut by_expiry: Vec<(Instant, String)> = entries
                .iter()
                .map(|(digest, entry)| (entry.expires_at, digest.clone()))
                .collect();
            by_expiry.sort();

            let excess = entries.len() - cap;
            for (_, digest) in by_expiry.into_iter().take(excess) {
                entries.remove(&digest);
            }
        }

        let evicted = before - entries.len();
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        tracing::debug!("Evicted {} cache entries", evicted);
        evicted
    }

    fn record_size(&self, len: usize, evicted: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.cache_entries.set(len as i64);
            if evicted > 0 {
                metrics.cache_evictions_total.inc_by(evicted as f64);
            }
        }
    }
}

/// A read function bound to a cache with a fixed identity and TTL.
///
/// ```ignore
/// let teams = cache.wrap("get_teams", Duration::from_secs(300));
/// let list = teams.call(teams.key(), || repo.fetch_teams()).await?;
/// ```
#[derive(Clone)]
pub struct CachedQuery {
    cache: Arc<QueryCache>,
    function: String,
    ttl: Duration,
}

impl CachedQuery {
    /// Fresh key for this function; add arguments with
    /// [`CacheKey::arg`] / [`CacheKey::kwarg`].
    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.function.clone())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn call<T, F, Fut, E>(&self, key: CacheKey, compute: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.cache.get_or_compute(&key, self.ttl, compute).await
    }
}
