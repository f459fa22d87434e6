//! Multi-Level Cache - Unified Two-Tier Cache
//!
//! Composes the in-process L1 and an optional distributed L2 behind one
//! get/set/invalidate/warm API. Reads fall through L1 to L2 and promote L2 hits
//! into L1; writes go through to every configured level. L2 failures degrade
//! to L1-only operation and never fail a read or a write.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::entry::{CacheEntry, CacheLevel, KeyPattern};
use super::l1::{L1Cache, L1Config};
use super::l2::{DistributedStore, L2Cache, L2Config};
use super::metrics::{
    AnalyticsThresholds, CacheAnalytics, CacheMetrics, CacheMetricsSnapshot, LatencyTracker,
    LevelStats,
};
use super::redis::RedisStore;
use super::warming::{order_strategies, WarmingFailure, WarmingReport, WarmingStrategy};
use crate::dedup::{DedupConfig, DedupOptions, RequestDeduplicator};
use crate::error::{Error, Result};

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// L1 configuration
    pub l1: L1Config,
    /// L2 configuration; `None` runs L1 only
    pub l2: Option<L2Config>,
    /// Period of the background expiry sweep
    pub sweep_interval_ms: u64,
    /// Efficiency bands and recommendation triggers
    pub analytics: AnalyticsThresholds,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1: L1Config::default(),
            l2: None,
            sweep_interval_ms: 60_000,
            analytics: AnalyticsThresholds::default(),
        }
    }
}

impl CacheConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.l1.validate()?;
        if let Some(l2) = &self.l2 {
            l2.validate()?;
        }
        if self.sweep_interval_ms == 0 {
            return Err(Error::Config("cache.sweep_interval_ms must be positive".into()));
        }
        self.analytics.validate()
    }
}

/// Levels written by one `set`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetReport {
    pub succeeded: Vec<CacheLevel>,
    pub failed: Vec<(CacheLevel, Error)>,
}

impl SetReport {
    /// Some level failed while another succeeded
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty() && !self.succeeded.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Tiers plus the counters that span them
struct Levels {
    l1: L1Cache,
    l2: Option<L2Cache>,
    metrics: CacheMetrics,
    /// Patterns L2 rejected during `invalidate`; matching L2 values stay
    /// hidden until the removal goes through
    pending: Mutex<Vec<KeyPattern>>,
    /// Bumped by every invalidation. Held for reading while a fallback result
    /// is stored so an invalidation cannot interleave with the write.
    generation: tokio::sync::RwLock<u64>,
}

impl Levels {
    fn defer_invalidation(&self, pattern: KeyPattern) {
        let mut pending = self.pending.lock();
        if !pending.contains(&pattern) {
            pending.push(pattern);
        }
    }

    fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().iter().any(|pattern| pattern.matches(key))
    }

    /// Retry deferred L2 invalidations, stopping at the first failure
    async fn flush_pending(&self, l2: &L2Cache) -> Result<()> {
        let pending: Vec<KeyPattern> = self.pending.lock().clone();
        for pattern in pending {
            let removed = l2.remove_matching(&pattern).await?;
            self.pending.lock().retain(|p| p != &pattern);
            self.metrics.record_invalidation(removed as u64);
            info!(%pattern, removed, "Deferred L2 invalidation applied");
        }
        Ok(())
    }

    async fn lookup(&self, key: &str) -> Option<Bytes> {
        let tracker = LatencyTracker::start();
        if let Some(value) = self.l1.get(key) {
            self.metrics.record_l1_read_latency(tracker.elapsed());
            debug!(key, "L1 hit");
            return Some(value);
        }

        if let Some(l2) = &self.l2 {
            let hidden = self.is_pending(key) && self.flush_pending(l2).await.is_err();
            let tracker = LatencyTracker::start();
            let result = if hidden {
                debug!(key, "L2 value hidden by a pending invalidation");
                Ok(None)
            } else {
                l2.get_with_ttl(key).await
            };
            match result {
                Ok(Some((value, remaining))) => {
                    self.metrics.record_l2_read_latency(tracker.elapsed());
                    // An L1 copy never outlives the L2 original
                    let ttl = remaining.min(self.l1.default_ttl());
                    if !ttl.is_zero() {
                        self.l1.put(key, CacheEntry::new(value.clone(), ttl));
                        self.metrics.record_promotion();
                        debug!(key, ttl_ms = ttl.as_millis() as u64, "L2 hit, promoted to L1");
                    }
                    return Some(value);
                }
                Ok(None) => {}
                Err(e) => {
                    self.metrics.record_l2_degraded_read();
                    warn!(key, error = %e, "L2 read failed, continuing with L1 only");
                }
            }
        }

        self.metrics.record_miss();
        debug!(key, "Cache miss");
        None
    }

    async fn store(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        levels: &[CacheLevel],
    ) -> SetReport {
        let mut report = SetReport::default();

        if levels.contains(&CacheLevel::L1) {
            let ttl = ttl.unwrap_or_else(|| self.l1.default_ttl());
            self.l1.put(key, CacheEntry::new(value.clone(), ttl));
            report.succeeded.push(CacheLevel::L1);
        }

        if let (Some(l2), true) = (&self.l2, levels.contains(&CacheLevel::L2)) {
            let ttl = ttl.unwrap_or_else(|| l2.default_ttl());
            // A deferred invalidation must land before newer values do
            let written = match self.flush_pending(l2).await {
                Ok(()) => l2.set(key, value, ttl).await,
                Err(e) => Err(e),
            };
            match written {
                Ok(()) => report.succeeded.push(CacheLevel::L2),
                Err(e) => {
                    warn!(key, error = %e, "L2 write failed, value kept in L1");
                    report.failed.push((CacheLevel::L2, e));
                }
            }
        }

        self.metrics.record_set(report.is_partial());
        report
    }

    /// Store unless an invalidation ran since `seen` was read
    async fn store_if_current(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
        levels: &[CacheLevel],
        seen: u64,
    ) -> Option<SetReport> {
        let generation = self.generation.read().await;
        if *generation != seen {
            debug!(key, "Invalidated while computing, result not cached");
            return None;
        }
        let report = self.store(key, value, ttl, levels).await;
        drop(generation);
        Some(report)
    }

    fn configured(&self) -> Vec<CacheLevel> {
        if self.l2.is_some() {
            CacheLevel::all()
        } else {
            vec![CacheLevel::L1]
        }
    }
}

/// Unified multi-level cache
pub struct MultiLevelCache {
    levels: Arc<Levels>,
    inflight: RequestDeduplicator<Bytes>,
    config: CacheConfig,
    destroyed: AtomicBool,
    sweeper: Mutex<Option<CancellationToken>>,
}

impl MultiLevelCache {
    /// Build a cache over an already connected L2 store (or none)
    ///
    /// A supplied store without an `l2` section uses the default L2 settings.
    pub fn new(config: CacheConfig, store: Option<Arc<dyn DistributedStore>>) -> Result<Self> {
        config.validate()?;

        let l2 = match (store, &config.l2) {
            (Some(store), l2_config) => Some(L2Cache::new(
                store,
                l2_config.clone().unwrap_or_default(),
            )),
            (None, Some(_)) => {
                return Err(Error::Config(
                    "cache.l2 is configured but no distributed store was supplied".into(),
                ))
            }
            (None, None) => None,
        };

        info!(
            l1_max_size = config.l1.max_size,
            l2 = l2.as_ref().map(|l2| l2.backend_type()).unwrap_or("disabled"),
            "Multi-level cache created"
        );

        Ok(Self {
            levels: Arc::new(Levels {
                l1: L1Cache::with_config(config.l1.clone()),
                l2,
                metrics: CacheMetrics::new(),
                pending: Mutex::new(Vec::new()),
                generation: tokio::sync::RwLock::new(0),
            }),
            inflight: RequestDeduplicator::new(&DedupConfig::default()),
            config,
            destroyed: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        })
    }

    /// L1 only
    pub fn in_memory(l1: L1Config) -> Result<Self> {
        Self::new(
            CacheConfig {
                l1,
                ..Default::default()
            },
            None,
        )
    }

    /// Build the cache, connecting to Redis when `config.l2` is set
    pub async fn connect(config: CacheConfig) -> Result<Self> {
        let store: Option<Arc<dyn DistributedStore>> = match &config.l2 {
            Some(l2) => Some(Arc::new(RedisStore::connect(l2).await?)),
            None => None,
        };
        Self::new(config, store)
    }

    fn ensure_live(&self, operation: &'static str) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(Error::Destroyed(operation))
        } else {
            Ok(())
        }
    }

    /// Look a key up in L1, then L2
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_live("cache get")?;
        Ok(self.levels.lookup(key).await)
    }

    /// Look a key up and resolve a miss with `fallback`
    ///
    /// Concurrent callers on the same cold key share one fallback execution.
    /// The resolved value is stored at every configured level with the default
    /// TTL; a failed fallback stores nothing.
    #[instrument(skip(self, fallback))]
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fallback: F) -> Result<Bytes>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.ensure_live("cache get")?;
        if let Some(value) = self.levels.lookup(key).await {
            return Ok(value);
        }

        let levels = Arc::clone(&self.levels);
        let owned_key = key.to_string();
        self.inflight
            .deduplicate(
                key,
                move || async move {
                    // A previous flight may have landed between lookup and join
                    if let Some(value) = levels.l1.peek(&owned_key) {
                        return Ok(value);
                    }

                    let seen = *levels.generation.read().await;

                    let started = Instant::now();
                    let result = fallback().await;
                    levels
                        .metrics
                        .record_fallback(started.elapsed(), result.is_ok());

                    let value = match result {
                        Ok(value) => value,
                        Err(e) => return Err(e),
                    };
                    let targets = levels.configured();
                    levels
                        .store_if_current(&owned_key, value.clone(), None, &targets, seen)
                        .await;
                    Ok(value)
                },
                DedupOptions::default(),
            )
            .await
    }

    /// Look a key up in L1 without touching hit/miss counters or recency
    pub fn peek(&self, key: &str) -> Result<Option<Bytes>> {
        self.ensure_live("cache get")?;
        Ok(self.levels.l1.peek(key))
    }

    /// Invalidation generation, for use with [`set_if_current`](Self::set_if_current)
    pub async fn generation(&self) -> u64 {
        *self.levels.generation.read().await
    }

    /// Like [`set`](Self::set), but skipped (`Ok(None)`) when an invalidation
    /// has run since `generation` was read
    pub async fn set_if_current(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
        generation: u64,
    ) -> Result<Option<SetReport>> {
        self.ensure_live("cache set")?;
        let targets = self.levels.configured();
        Ok(self
            .levels
            .store_if_current(key, value.into(), ttl, &targets, generation)
            .await)
    }

    /// Typed read of a JSON value
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write-through to every configured level
    ///
    /// An L2 failure is reported but does not fail the call.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<Bytes>,
        ttl: Option<Duration>,
    ) -> Result<SetReport> {
        self.ensure_live("cache set")?;
        let targets = self.levels.configured();
        Ok(self.levels.store(key, value.into(), ttl, &targets).await)
    }

    /// Typed write of a JSON value
    pub async fn set_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<SetReport> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes, ttl).await
    }

    /// Remove an exact key or every key under `prefix*` from all levels
    ///
    /// Returns the number of entries removed, summed over levels. When L2
    /// rejects the removal, the pattern is kept pending: matching L2 values
    /// are treated as misses and the removal is retried by later writes and
    /// the sweeper until it succeeds.
    #[instrument(skip(self))]
    pub async fn invalidate(&self, pattern: &str) -> Result<usize> {
        self.ensure_live("cache invalidate")?;
        let pattern = KeyPattern::parse(pattern);

        let mut generation = self.levels.generation.write().await;
        *generation += 1;

        let mut removed = self.levels.l1.remove_matching(&pattern);
        if let Some(l2) = &self.levels.l2 {
            match l2.remove_matching(&pattern).await {
                Ok(n) => removed += n,
                Err(e) => {
                    warn!(%pattern, error = %e, "L2 invalidation failed, retrying in background");
                    self.levels.defer_invalidation(pattern.clone());
                }
            }
        }
        drop(generation);

        self.levels.metrics.record_invalidation(removed as u64);
        debug!(%pattern, removed, "Invalidated cache entries");
        Ok(removed)
    }

    /// Run warming strategies, highest priority first
    ///
    /// A failing strategy is logged and reported; the rest still run.
    pub async fn warm_cache(&self, mut strategies: Vec<WarmingStrategy>) -> Result<WarmingReport> {
        self.ensure_live("cache warm")?;
        let started = Instant::now();
        order_strategies(&mut strategies);

        let configured = self.levels.configured();
        let mut report = WarmingReport::default();

        for strategy in strategies {
            let targets: Vec<CacheLevel> = strategy
                .target_levels
                .iter()
                .copied()
                .filter(|level| configured.contains(level))
                .collect();
            if targets.is_empty() {
                warn!(key = %strategy.key, "Warming skipped: no target level is configured");
                report.failed.push(WarmingFailure {
                    key: strategy.key,
                    reason: "no configured target level".into(),
                });
                continue;
            }

            match (strategy.data_fetcher)().await {
                Ok(value) => {
                    let set = self
                        .levels
                        .store(&strategy.key, value, strategy.ttl, &targets)
                        .await;
                    if set.succeeded.is_empty() {
                        let reason = set
                            .failed
                            .first()
                            .map(|(_, e)| e.to_string())
                            .unwrap_or_default();
                        report.failed.push(WarmingFailure {
                            key: strategy.key,
                            reason,
                        });
                    } else {
                        report.warmed.push(strategy.key);
                    }
                }
                Err(e) => {
                    warn!(key = %strategy.key, error = %e, "Cache warming strategy failed");
                    report.failed.push(WarmingFailure {
                        key: strategy.key,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            warmed = report.warmed.len(),
            failed = report.failed.len(),
            "Cache warming complete"
        );
        Ok(report)
    }

    /// Get metrics snapshot
    pub fn get_metrics(&self) -> CacheMetricsSnapshot {
        let levels = &self.levels;
        let l1 = LevelStats::new(
            levels.l1.hits(),
            levels.l1.misses(),
            levels.l1.len() as u64,
            levels.l1.evictions(),
            0,
        );
        let l2 = levels.l2.as_ref().map(|l2| {
            LevelStats::new(l2.hits(), l2.misses(), l2.tracked_entries() as u64, 0, l2.errors())
        });

        let total_hits = l1.hits + l2.as_ref().map_or(0, |l2| l2.hits);
        let total_misses = levels.metrics.misses();
        let lookups = total_hits + total_misses;
        let overall_hit_rate = if lookups == 0 {
            0.0
        } else {
            total_hits as f64 / lookups as f64
        };

        CacheMetricsSnapshot {
            l1,
            l2,
            total_hits,
            total_misses,
            overall_hit_rate,
            l1_writes: levels.l1.writes(),
            promotions: levels.metrics.promotions(),
            fallback_executions: levels.metrics.fallback_executions(),
            fallback_failures: levels.metrics.fallback_failures(),
            sets: levels.metrics.sets(),
            partial_sets: levels.metrics.partial_sets(),
            invalidated_keys: levels.metrics.invalidated_keys(),
            pending_invalidations: levels.pending.lock().len() as u64,
            l2_degraded_reads: levels.metrics.l2_degraded_reads(),
            l1_read_latency_us: levels.metrics.l1_read_latency().as_micros() as u64,
            l2_read_latency_us: levels.metrics.l2_read_latency().as_micros() as u64,
            fallback_latency_us: levels.metrics.fallback_latency().as_micros() as u64,
        }
    }

    /// Hit rates, efficiency band, and recommendations
    pub fn get_advanced_analytics(&self) -> CacheAnalytics {
        CacheAnalytics::from_snapshot(&self.get_metrics(), &self.config.analytics)
    }

    /// Remove expired L1 entries and prune the L2 key index
    pub async fn sweep_expired(&self) -> usize {
        let mut removed = self.levels.l1.purge_expired();
        if let Some(l2) = &self.levels.l2 {
            if let Err(e) = self.levels.flush_pending(l2).await {
                debug!(error = %e, "Deferred L2 invalidation still failing");
            }
            match l2.sweep().await {
                Ok(n) => removed += n,
                Err(e) => warn!(error = %e, "L2 sweep failed"),
            }
        }
        if removed > 0 {
            debug!(removed, "Expired cache entries swept");
        }
        removed
    }

    /// Start the periodic expiry sweep; stopped by `destroy`
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let token = CancellationToken::new();
        if let Some(previous) = self.sweeper.lock().replace(token.clone()) {
            previous.cancel();
        }

        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        cache.sweep_expired().await;
                    }
                }
            }
            debug!("Cache sweeper stopped");
        })
    }

    /// Probe L2; `None` when no L2 is configured
    pub async fn ping_l2(&self) -> Option<Result<()>> {
        match &self.levels.l2 {
            Some(l2) => Some(l2.ping().await),
            None => None,
        }
    }

    /// Invalidations L2 has not applied yet
    pub fn pending_invalidations(&self) -> usize {
        self.levels.pending.lock().len()
    }

    pub fn has_l2(&self) -> bool {
        self.levels.l2.is_some()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// In-flight fallback fetches
    pub fn pending_fetches(&self) -> usize {
        self.inflight.get_stats().pending_requests
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Release L1, stop the sweeper, close L2. Safe to call repeatedly.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(token) = self.sweeper.lock().take() {
            token.cancel();
        }
        self.levels.l1.clear();
        if let Some(l2) = &self.levels.l2 {
            if let Err(e) = l2.close().await {
                warn!(error = %e, "Closing L2 failed");
            }
        }

        info!("Multi-level cache destroyed");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
