//! Performance Optimizer
//!
//! Runs an API response through the optimization pipeline:
//!
//! ```text
//!  request + rows
//!       │
//!       ▼
//!  ┌──────────────┐   ┌──────────────────────────────┐   ┌─────────────────────┐
//!  │  Pagination  │──▶│ Cache read-through           │──▶│ Adaptive compressor │──▶ body
//!  │  planner     │   │ (single flight per page key) │   └─────────────────────┘
//!  └──────────────┘   └──────────────────────────────┘
//!       │                        ▲
//!       └── prefetch next pages ─┘ (background)
//! ```
//!
//! Cached pages hold the uncompressed JSON so clients with different
//! `Accept-Encoding` headers share entries.

mod report;
mod request;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use report::{AppliedOptimization, OptimizedResponse, PerformanceReport, StageTimings};
pub use request::{ApiRequest, ResponseOptions};

use crate::cache::{DistributedStore, MultiLevelCache};
use crate::compression::{AdaptiveCompressor, Encoding};
use crate::config::OptimizerConfig;
use crate::dedup::{DedupOptions, RequestDeduplicator};
use crate::error::{Error, Result};
use crate::monitoring::{timed, HealthCheckResult, HealthResponse, MetricsCollector};
use crate::pagination::{
    create_paginated_response, PageInfo, PaginationOptions, PaginationPlanner,
};

/// A computed page body and where it came from
#[derive(Clone)]
struct CachedPage {
    body: Bytes,
    from_cache: bool,
}

/// Which rows make up one page
#[derive(Debug, Clone, Copy)]
struct PageWindow {
    page: u64,
    limit: u64,
    offset: u64,
    total: u64,
    /// Rows are the full result set and this page is cut from them
    sliced: bool,
}

enum CacheOutcome {
    Hit,
    Stored,
    Deduplicated,
}

/// Serialize the response body for `window`, or the whole row set when unpaged
fn render_body(rows: &[Value], window: Option<PageWindow>) -> Result<Bytes> {
    let Some(window) = window else {
        return Ok(Bytes::from(serde_json::to_vec(rows)?));
    };

    let page_rows = if window.sliced {
        let skip = usize::try_from(window.offset).unwrap_or(usize::MAX);
        let take = usize::try_from(window.limit).unwrap_or(usize::MAX);
        rows.iter().skip(skip).take(take).cloned().collect()
    } else {
        rows.to_vec()
    };
    let envelope =
        create_paginated_response(page_rows, window.total, window.page, window.limit);
    Ok(Bytes::from(serde_json::to_vec(&envelope)?))
}

/// Resolve a page inside a single flight; peeks at the cache first since an
/// earlier flight may have stored it
async fn compute_page(
    cache: Arc<MultiLevelCache>,
    key: String,
    rows: Arc<Vec<Value>>,
    window: Option<PageWindow>,
    ttl: Option<Duration>,
    ran: Arc<AtomicBool>,
    generation: u64,
) -> Result<CachedPage> {
    ran.store(true, Ordering::SeqCst);
    if let Some(body) = cache.peek(&key)? {
        return Ok(CachedPage {
            body,
            from_cache: true,
        });
    }

    let body = render_body(&rows, window)?;
    match cache.set_if_current(&key, body.clone(), ttl, generation).await? {
        Some(report) if report.is_partial() => {
            debug!(key, failed = report.failed.len(), "Page cached on a subset of levels");
        }
        Some(_) => {}
        None => debug!(key, "Page not cached, invalidated while rendering"),
    }
    Ok(CachedPage {
        body,
        from_cache: false,
    })
}

async fn prefetch_pages(
    cache: Arc<MultiLevelCache>,
    jobs: Vec<(String, PageWindow)>,
    rows: Arc<Vec<Value>>,
    ttl: Option<Duration>,
    prefetched: Arc<AtomicU64>,
    generation: u64,
) {
    for (key, window) in jobs {
        let body = match render_body(&rows, Some(window)) {
            Ok(body) => body,
            Err(e) => {
                warn!(key, error = %e, "Prefetch render failed");
                continue;
            }
        };
        match cache.set_if_current(&key, body, ttl, generation).await {
            Ok(Some(_)) => {
                prefetched.fetch_add(1, Ordering::Relaxed);
                debug!(key, page = window.page, "Page prefetched");
            }
            Ok(None) => {
                debug!(key, "Prefetch stopped, cache invalidated");
                return;
            }
            Err(e) => {
                debug!(key, error = %e, "Prefetch stopped");
                return;
            }
        }
    }
}

/// Run a health check under a deadline
async fn bounded<F>(name: &str, limit: Duration, check: F) -> HealthCheckResult
where
    F: Future<Output = HealthCheckResult>,
{
    let started = Instant::now();
    match tokio::time::timeout(limit, check).await {
        Ok(result) => result.with_duration(started.elapsed()),
        Err(_) => {
            warn!(check = name, limit_ms = limit.as_millis() as u64, "Health check timed out");
            HealthCheckResult::timeout(name, limit)
        }
    }
}

/// Facade over cache, deduplicator, compressor and pagination planner
pub struct PerformanceOptimizer {
    config: OptimizerConfig,
    cache: Arc<MultiLevelCache>,
    dedup: RequestDeduplicator<CachedPage>,
    compressor: AdaptiveCompressor,
    planner: PaginationPlanner,
    collector: Arc<MetricsCollector>,
    background: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    responses: AtomicU64,
    failures: AtomicU64,
    prefetched: Arc<AtomicU64>,
    destroyed: AtomicBool,
}

impl PerformanceOptimizer {
    /// Validate `config`, connect Redis when `cache.l2` is set and start the
    /// cache sweeper
    pub async fn initialize(config: OptimizerConfig) -> Result<Self> {
        config.validate()?;
        let cache = MultiLevelCache::connect(config.cache.clone()).await?;
        Ok(Self::assemble(config, cache))
    }

    /// Like [`initialize`](Self::initialize) over an already connected store
    pub async fn initialize_with_store(
        config: OptimizerConfig,
        store: Option<Arc<dyn DistributedStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let cache = MultiLevelCache::new(config.cache.clone(), store)?;
        Ok(Self::assemble(config, cache))
    }

    fn assemble(config: OptimizerConfig, cache: MultiLevelCache) -> Self {
        let cache = Arc::new(cache);
        let sweeper = cache.spawn_sweeper();

        info!(
            l2 = cache.has_l2(),
            cdn = config.cdn.enabled,
            db_max_connections = config.database.max_connections,
            "Performance optimizer initialized"
        );

        Self {
            dedup: RequestDeduplicator::new(&config.deduplication),
            compressor: AdaptiveCompressor::new(config.compression.clone()),
            planner: PaginationPlanner::new(config.pagination.clone()),
            collector: Arc::new(MetricsCollector::new(config.monitoring.clone())),
            cache,
            config,
            background: CancellationToken::new(),
            sweeper: Mutex::new(Some(sweeper)),
            responses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            prefetched: Arc::new(AtomicU64::new(0)),
            destroyed: AtomicBool::new(false),
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(Error::Destroyed("optimizer"))
        } else {
            Ok(())
        }
    }

    /// Paginate, cache and compress a response
    ///
    /// `rows` is the full result set unless `options.total_count` is given, in
    /// which case it is already the requested page.
    #[instrument(skip(self, request, rows, options), fields(method = %request.method, path = %request.path))]
    pub async fn optimize_api_response(
        &self,
        request: &ApiRequest,
        rows: Vec<Value>,
        options: ResponseOptions,
    ) -> Result<OptimizedResponse> {
        self.ensure_live()?;

        let started = Instant::now();
        let result = self.run_pipeline(request, rows, &options).await;
        self.collector
            .record_stage("response", started.elapsed(), result.is_ok());

        match &result {
            Ok(response) => {
                self.responses.fetch_add(1, Ordering::Relaxed);
                debug!(
                    encoding = %response.encoding,
                    size = response.compressed_size,
                    total_us = response.performance_metrics.total_us,
                    "Response optimized"
                );
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Response optimization failed");
            }
        }
        result
    }

    async fn run_pipeline(
        &self,
        request: &ApiRequest,
        rows: Vec<Value>,
        options: &ResponseOptions,
    ) -> Result<OptimizedResponse> {
        let pipeline_started = Instant::now();
        let mut timings = StageTimings::default();
        let mut optimizations = Vec::new();
        let rows = Arc::new(rows);
        // Results computed from `rows` are only cached if nothing is
        // invalidated meanwhile
        let generation = self.cache.generation().await;

        // Pagination
        let stage = Instant::now();
        let plan = options.enable_pagination.then(|| {
            let total = options.total_count.unwrap_or(rows.len() as u64);
            let plan = self.planner.optimize_pagination(
                &request.pagination_query(),
                &PaginationOptions {
                    enable_prefetch: options.enable_prefetch,
                    estimated_total_count: Some(total),
                },
            );
            let window = PageWindow {
                page: plan.page,
                limit: plan.limit,
                offset: plan.offset,
                total,
                sliced: options.total_count.is_none(),
            };
            (plan, window)
        });
        let elapsed = stage.elapsed();
        self.collector.record_stage("pagination", elapsed, true);
        timings.pagination_us = StageTimings::micros(elapsed);

        let window = plan.as_ref().map(|(_, window)| *window);
        if let Some((plan, _)) = &plan {
            optimizations.push(AppliedOptimization::Pagination {
                page: plan.page,
                limit: plan.limit,
            });
            if plan.optimization.use_cursor_pagination {
                optimizations.push(AppliedOptimization::CursorPaginationSuggested);
            }
        }

        // Cache read-through
        let key = match &plan {
            Some((plan, _)) => request.cache_key(plan.page, plan.limit),
            None => request.unpaged_cache_key(),
        };
        let body = if options.enable_caching {
            let (result, elapsed) = timed(
                &self.collector,
                "cache",
                self.read_through(&key, Arc::clone(&rows), window, options, generation),
            )
            .await;
            timings.cache_us = StageTimings::micros(elapsed);

            let (body, outcome) = result?;
            optimizations.push(match outcome {
                CacheOutcome::Hit => AppliedOptimization::CacheHit { key: key.clone() },
                CacheOutcome::Stored => AppliedOptimization::CacheStore { key: key.clone() },
                CacheOutcome::Deduplicated => {
                    AppliedOptimization::Deduplicated { key: key.clone() }
                }
            });
            body
        } else {
            render_body(&rows, window)?
        };

        // Compression
        let stage = Instant::now();
        let accept = if options.enable_compression {
            request.accept_encoding.as_deref()
        } else {
            None
        };
        let result = self
            .compressor
            .compress_bytes(body, accept, request.content_type.as_deref());
        let elapsed = stage.elapsed();
        self.collector
            .record_stage("compression", elapsed, result.is_ok());
        timings.compression_us = StageTimings::micros(elapsed);
        let compressed = result?;
        if compressed.encoding != Encoding::None {
            optimizations.push(AppliedOptimization::Compression {
                encoding: compressed.encoding,
                ratio: compressed.compression_ratio,
            });
        }

        // Prefetch
        if let Some((plan, window)) = &plan {
            if plan.should_prefetch && options.enable_caching && window.sliced {
                let pages = plan.prefetch_pages.clone();
                self.spawn_prefetch(request, pages, *window, rows, options, generation);
                optimizations.push(AppliedOptimization::Prefetch {
                    pages: plan.prefetch_pages.clone(),
                });
            }
        }

        timings.total_us = StageTimings::micros(pipeline_started.elapsed());

        Ok(OptimizedResponse {
            optimized_data: compressed.compressed,
            encoding: compressed.encoding,
            original_size: compressed.original_size,
            compressed_size: compressed.compressed_size,
            optimizations,
            performance_metrics: timings,
            pagination: window.map(|w| PageInfo::new(w.total, w.page, w.limit)),
            plan: plan.map(|(plan, _)| plan),
        })
    }

    async fn read_through(
        &self,
        key: &str,
        rows: Arc<Vec<Value>>,
        window: Option<PageWindow>,
        options: &ResponseOptions,
        generation: u64,
    ) -> Result<(Bytes, CacheOutcome)> {
        if let Some(body) = self.cache.get(key).await? {
            return Ok((body, CacheOutcome::Hit));
        }

        let ran = Arc::new(AtomicBool::new(false));
        let cache = Arc::clone(&self.cache);
        let owned_key = key.to_string();
        let ttl = options.cache_ttl;
        let flag = Arc::clone(&ran);
        let dedup_options = options
            .batch_key
            .clone()
            .map(DedupOptions::batched)
            .unwrap_or_default();

        let page = self
            .dedup
            .deduplicate(
                key,
                move || compute_page(cache, owned_key, rows, window, ttl, flag, generation),
                dedup_options,
            )
            .await?;

        let outcome = if !ran.load(Ordering::SeqCst) {
            CacheOutcome::Deduplicated
        } else if page.from_cache {
            CacheOutcome::Hit
        } else {
            CacheOutcome::Stored
        };
        Ok((page.body, outcome))
    }

    fn spawn_prefetch(
        &self,
        request: &ApiRequest,
        pages: Vec<u64>,
        current: PageWindow,
        rows: Arc<Vec<Value>>,
        options: &ResponseOptions,
        generation: u64,
    ) {
        let jobs: Vec<(String, PageWindow)> = pages
            .into_iter()
            .map(|page| {
                let window = PageWindow {
                    page,
                    offset: (page - 1).saturating_mul(current.limit),
                    ..current
                };
                (request.cache_key(page, current.limit), window)
            })
            .collect();

        let cache = Arc::clone(&self.cache);
        let prefetched = Arc::clone(&self.prefetched);
        let token = self.background.child_token();
        let ttl = options.cache_ttl;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("Prefetch cancelled"),
                _ = prefetch_pages(cache, jobs, rows, ttl, prefetched, generation) => {}
            }
        });
    }

    /// Every subsystem's statistics
    pub fn get_performance_metrics(&self) -> PerformanceReport {
        PerformanceReport {
            cache: self.cache.get_metrics(),
            cache_analytics: self.cache.get_advanced_analytics(),
            deduplication: self.dedup.get_stats(),
            compression: self.compressor.stats(),
            responses_optimized: self.responses.load(Ordering::Relaxed),
            response_failures: self.failures.load(Ordering::Relaxed),
            prefetched_pages: self.prefetched.load(Ordering::Relaxed),
            uptime_seconds: self.collector.uptime().as_secs(),
            generated_at: Utc::now(),
        }
    }

    /// Prometheus text for the collector, with subsystem gauges refreshed
    pub fn export_metrics(&self) -> String {
        let report = self.get_performance_metrics();
        let gauges = [
            ("cache_hit_rate", report.cache.overall_hit_rate),
            ("cache_l1_entries", report.cache.l1.entries as f64),
            ("cache_l1_evictions", report.cache.l1.evictions as f64),
            ("cache_fallback_executions", report.cache.fallback_executions as f64),
            ("dedup_pending_requests", report.deduplication.pending_requests as f64),
            ("dedup_ratio", report.deduplication.dedup_ratio()),
            ("compression_ratio", report.compression.overall_ratio()),
            (
                "compression_bytes_saved",
                report.compression.bytes_in.saturating_sub(report.compression.bytes_out) as f64,
            ),
            ("responses_optimized", report.responses_optimized as f64),
            ("response_failures", report.response_failures as f64),
            ("prefetched_pages", report.prefetched_pages as f64),
        ];
        for (name, value) in gauges {
            self.collector.gauge(name).set(value);
        }
        self.collector.export_text()
    }

    /// Check every subsystem, each under the configured timeout
    pub async fn health_check(&self) -> HealthResponse {
        let limit = self.config.health.timeout();
        let (cache, deduplication, compression) = tokio::join!(
            bounded("cache", limit, self.check_cache()),
            bounded("deduplication", limit, self.check_deduplication()),
            bounded("compression", limit, self.check_compression()),
        );

        let response = HealthResponse::new(
            vec![cache, deduplication, compression],
            self.collector.uptime(),
        );
        if !response.status.is_healthy() {
            warn!(status = %response.status, "Optimizer health degraded");
        }
        response
    }

    async fn check_cache(&self) -> HealthCheckResult {
        if self.cache.is_destroyed() {
            return HealthCheckResult::fail("cache", "destroyed");
        }
        let pending = self.cache.pending_invalidations();
        match self.cache.ping_l2().await {
            None | Some(Ok(())) if pending > 0 => HealthCheckResult::warn(
                "cache",
                format!("{} invalidations not yet applied to L2", pending),
            ),
            None | Some(Ok(())) => HealthCheckResult::pass("cache"),
            Some(Err(e)) => {
                HealthCheckResult::warn("cache", format!("L2 unreachable, serving from L1: {}", e))
            }
        }
    }

    async fn check_deduplication(&self) -> HealthCheckResult {
        let stats = self.dedup.get_stats();
        let stale_after = self.config.health.stale_request_ms;
        if stats.pending_requests > 0 && stats.oldest_pending_ms > stale_after {
            HealthCheckResult::warn(
                "deduplication",
                format!(
                    "{} requests in flight, oldest for {}ms",
                    stats.pending_requests, stats.oldest_pending_ms
                ),
            )
        } else {
            HealthCheckResult::pass("deduplication")
        }
    }

    async fn check_compression(&self) -> HealthCheckResult {
        match self.compressor.self_test() {
            Ok(()) => HealthCheckResult::pass("compression"),
            Err(e) => HealthCheckResult::fail("compression", e.to_string()),
        }
    }

    pub fn cache(&self) -> &Arc<MultiLevelCache> {
        &self.cache
    }

    pub fn compressor(&self) -> &AdaptiveCompressor {
        &self.compressor
    }

    pub fn planner(&self) -> &PaginationPlanner {
        &self.planner
    }

    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.collector
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Stop background work and release the cache. Safe to call repeatedly.
    pub async fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.background.cancel();
        self.cache.destroy().await?;

        let sweeper = self.sweeper.lock().take();
        if let Some(handle) = sweeper {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cache sweeper ended abnormally");
            }
        }

        info!("Performance optimizer destroyed");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryStore;
    use crate::monitoring::{CheckStatus, HealthStatus};
    use crate::pagination::PaginatedResponse;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::json;

    async fn optimizer() -> PerformanceOptimizer {
        PerformanceOptimizer::initialize_with_store(OptimizerConfig::default(), None)
            .await
            .unwrap()
    }

    fn rows(n: usize) -> Vec<Value> {
        (0..n)
            .map(|i| json!({ "id": i, "name": format!("trip-{}", i), "status": "open" }))
            .collect()
    }

    fn wide_rows(n: usize) -> Vec<Value> {
        (0..n)
            .map(|i| json!({ "id": i, "description": "scheduled inter-city trip ".repeat(8) }))
            .collect()
    }

    fn page_of(response: &OptimizedResponse) -> PaginatedResponse<Value> {
        assert_eq!(response.encoding, Encoding::None);
        serde_json::from_slice(&response.optimized_data).unwrap()
    }

    #[tokio::test]
    async fn test_slices_and_describes_the_page() {
        let optimizer = optimizer().await;
        let request = ApiRequest::new("GET", "/trips").with_query_string("page=2&limit=20");

        let response = optimizer
            .optimize_api_response(&request, rows(45), ResponseOptions::default())
            .await
            .unwrap();

        let page = page_of(&response);
        assert_eq!(page.data.len(), 20);
        assert_eq!(page.data[0]["id"], 20);
        assert_eq!(page.pagination.total_count, 45);
        assert_eq!(page.pagination.total_pages, 3);
        assert!(page.pagination.has_next);
        assert!(page.pagination.has_prev);

        assert_eq!(response.pagination, Some(page.pagination.clone()));
        assert!(response
            .optimizations
            .contains(&AppliedOptimization::Pagination { page: 2, limit: 20 }));
        assert!(response.optimizations.contains(&AppliedOptimization::CacheStore {
            key: "api:GET:/trips?limit=20&page=2".into()
        }));
        assert!(!response.served_from_cache());
    }

    #[tokio::test]
    async fn test_repeat_request_served_from_cache() {
        let optimizer = optimizer().await;
        let request = ApiRequest::new("GET", "/trips").with_query_string("page=1&limit=10");

        let first = optimizer
            .optimize_api_response(&request, rows(30), ResponseOptions::default())
            .await
            .unwrap();
        let second = optimizer
            .optimize_api_response(&request, rows(30), ResponseOptions::default())
            .await
            .unwrap();

        assert!(second.served_from_cache());
        assert_eq!(first.optimized_data, second.optimized_data);
        assert!(optimizer.get_performance_metrics().cache.l1.hits >= 1);
    }

    #[tokio::test]
    async fn test_cold_then_warm_request_counts_one_miss() {
        let optimizer = optimizer().await;
        let request = ApiRequest::new("GET", "/trips").with_query_string("page=1&limit=10");

        for _ in 0..2 {
            optimizer
                .optimize_api_response(&request, rows(30), ResponseOptions::default())
                .await
                .unwrap();
        }

        let cache = optimizer.get_performance_metrics().cache;
        assert_eq!(cache.total_hits, 1);
        assert_eq!(cache.total_misses, 1);
        assert_eq!(cache.l1.misses, 1);
        assert_eq!(cache.overall_hit_rate, 0.5);
    }

    #[tokio::test]
    async fn test_large_page_compressed_for_client() {
        let optimizer = optimizer().await;
        let request = ApiRequest::new("GET", "/trips")
            .with_query_string("limit=100")
            .with_accept_encoding("br, gzip");

        let response = optimizer
            .optimize_api_response(&request, wide_rows(100), ResponseOptions::default())
            .await
            .unwrap();

        assert_eq!(response.encoding, Encoding::Br);
        assert_eq!(response.content_encoding(), Some("br"));
        assert!(response.compressed_size < response.original_size);

        let body = optimizer
            .compressor()
            .decompress(&response.optimized_data, Encoding::Br)
            .unwrap();
        let page: PaginatedResponse<Value> = serde_json::from_slice(&body).unwrap();
        assert_eq!(page.data.len(), 100);
        assert!(response
            .optimizations
            .iter()
            .any(|o| matches!(o, AppliedOptimization::Compression { encoding: Encoding::Br, .. })));
    }

    #[tokio::test]
    async fn test_precompressed_content_type_is_left_alone() {
        let optimizer = optimizer().await;
        let request = ApiRequest::new("GET", "/trips")
            .with_query_string("limit=100")
            .with_accept_encoding("gzip")
            .with_content_type("application/zip");

        let response = optimizer
            .optimize_api_response(&request, wide_rows(100), ResponseOptions::default())
            .await
            .unwrap();
        assert_eq!(response.encoding, Encoding::None);
    }

    #[tokio::test]
    async fn test_compression_can_be_disabled() {
        let optimizer = optimizer().await;
        let request = ApiRequest::new("GET", "/trips")
            .with_query_string("limit=100")
            .with_accept_encoding("gzip");
        let options = ResponseOptions {
            enable_compression: false,
            ..Default::default()
        };

        let response = optimizer
            .optimize_api_response(&request, rows(100), options)
            .await
            .unwrap();
        assert_eq!(response.encoding, Encoding::None);
        assert_eq!(response.compressed_size, response.original_size);
    }

    #[tokio::test]
    async fn test_concurrent_requests_compute_once() {
        let optimizer = Arc::new(optimizer().await);
        let request = ApiRequest::new("GET", "/trips").with_query_string("page=1");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let optimizer = Arc::clone(&optimizer);
            let request = request.clone();
            handles.push(tokio::spawn(async move {
                optimizer
                    .optimize_api_response(&request, rows(50), ResponseOptions::default())
                    .await
                    .unwrap()
            }));
        }

        let mut stores = 0;
        let mut bodies = Vec::new();
        for handle in handles {
            let response = handle.await.unwrap();
            stores += response
                .optimizations
                .iter()
                .filter(|o| matches!(o, AppliedOptimization::CacheStore { .. }))
                .count();
            bodies.push(response.optimized_data);
        }

        assert_eq!(stores, 1);
        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(optimizer.get_performance_metrics().responses_optimized, 10);
    }

    #[tokio::test]
    async fn test_prefetch_fills_following_pages() {
        let optimizer = optimizer().await;
        let request = ApiRequest::new("GET", "/trips").with_query_string("page=1&limit=10");

        let response = optimizer
            .optimize_api_response(&request, rows(100), ResponseOptions::default().with_prefetch())
            .await
            .unwrap();
        assert!(response
            .optimizations
            .contains(&AppliedOptimization::Prefetch { pages: vec![2, 3] }));

        let key = request.cache_key(3, 10);
        let mut cached = None;
        for _ in 0..100 {
            cached = optimizer.cache().get(&key).await.unwrap();
            if cached.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let page: PaginatedResponse<Value> = serde_json::from_slice(&cached.unwrap()).unwrap();
        assert_eq!(page.pagination.page, 3);
        assert_eq!(page.data[0]["id"], 20);
    }

    #[tokio::test]
    async fn test_caller_supplied_page_is_not_sliced() {
        let optimizer = optimizer().await;
        let request = ApiRequest::new("GET", "/trips").with_query_string("page=3&limit=10");

        let response = optimizer
            .optimize_api_response(
                &request,
                rows(10),
                ResponseOptions::default().with_total_count(95).with_prefetch(),
            )
            .await
            .unwrap();

        let page = page_of(&response);
        assert_eq!(page.data.len(), 10);
        assert_eq!(page.data[0]["id"], 0);
        assert_eq!(page.pagination.total_pages, 10);
        assert!(!response
            .optimizations
            .iter()
            .any(|o| matches!(o, AppliedOptimization::Prefetch { .. })));
    }

    #[tokio::test]
    async fn test_unpaged_uncached_response() {
        let optimizer = optimizer().await;
        let request = ApiRequest::new("GET", "/regions");
        let options = ResponseOptions {
            enable_pagination: false,
            ..ResponseOptions::default().without_cache()
        };

        let response = optimizer
            .optimize_api_response(&request, rows(3), options)
            .await
            .unwrap();

        let body: Vec<Value> = serde_json::from_slice(&response.optimized_data).unwrap();
        assert_eq!(body.len(), 3);
        assert!(response.optimizations.is_empty());
        assert!(response.plan.is_none());
    }

    #[tokio::test]
    async fn test_deep_page_suggests_cursor() {
        let optimizer = optimizer().await;
        let request = ApiRequest::new("GET", "/trips").with_query_string("page=150&limit=20");

        let response = optimizer
            .optimize_api_response(&request, Vec::new(), ResponseOptions::default().with_total_count(5000))
            .await
            .unwrap();
        assert!(response
            .optimizations
            .contains(&AppliedOptimization::CursorPaginationSuggested));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = OptimizerConfig::default();
        config.database.min_connections = 50;
        assert!(matches!(
            PerformanceOptimizer::initialize(config).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_healthy_by_default() {
        let optimizer = optimizer().await;
        let health = optimizer.health_check().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.checks.len(), 3);
    }

    #[tokio::test]
    async fn test_l2_outage_degrades_health() {
        let store = Arc::new(InMemoryStore::new());
        let optimizer = PerformanceOptimizer::initialize_with_store(
            OptimizerConfig::default(),
            Some(store.clone()),
        )
        .await
        .unwrap();

        store.set_available(false);
        let health = optimizer.health_check().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.check("cache").unwrap().status, CheckStatus::Warn);

        // L1 keeps serving
        let request = ApiRequest::new("GET", "/trips");
        assert!(optimizer
            .optimize_api_response(&request, rows(5), ResponseOptions::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_pending_invalidation_degrades_health_until_applied() {
        let store = Arc::new(InMemoryStore::new());
        let optimizer = PerformanceOptimizer::initialize_with_store(
            OptimizerConfig::default(),
            Some(store.clone()),
        )
        .await
        .unwrap();
        let request = ApiRequest::new("GET", "/trips");
        optimizer
            .optimize_api_response(&request, rows(5), ResponseOptions::default())
            .await
            .unwrap();

        store.set_available(false);
        optimizer.cache().invalidate("api:GET:/trips*").await.unwrap();
        store.set_available(true);

        let health = optimizer.health_check().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.check("cache").unwrap().status, CheckStatus::Warn);

        // The stale page is not served once L2 answers again
        let response = optimizer
            .optimize_api_response(&request, rows(5), ResponseOptions::default())
            .await
            .unwrap();
        assert!(!response.served_from_cache());
        assert_eq!(optimizer.cache().pending_invalidations(), 0);
        assert_eq!(optimizer.health_check().await.status, HealthStatus::Healthy);
    }

    struct HangingStore;

    #[async_trait]
    impl DistributedStore for HangingStore {
        async fn get(&self, _key: &str) -> Result<Option<Bytes>> {
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> Result<()> {
            Ok(())
        }
        async fn delete(&self, _key: &str) -> Result<bool> {
            Ok(false)
        }
        async fn scan_prefix(&self, _prefix: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn ping(&self) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        fn backend_type(&self) -> &'static str {
            "hanging"
        }
    }

    #[tokio::test]
    async fn test_slow_check_times_out() {
        let mut config = OptimizerConfig::default();
        config.health.timeout_ms = 50;
        let optimizer =
            PerformanceOptimizer::initialize_with_store(config, Some(Arc::new(HangingStore)))
                .await
                .unwrap();

        let health = optimizer.health_check().await;
        assert_eq!(health.status, HealthStatus::Unhealthy);
        let cache = health.check("cache").unwrap();
        assert_eq!(cache.status, CheckStatus::Fail);
        assert_eq!(cache.output.as_deref(), Some("timeout"));
        assert_eq!(health.check("compression").unwrap().status, CheckStatus::Pass);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let optimizer = optimizer().await;
        optimizer.destroy().await.unwrap();
        optimizer.destroy().await.unwrap();
        assert!(optimizer.is_destroyed());
        assert!(optimizer.cache().is_destroyed());

        let request = ApiRequest::new("GET", "/trips");
        assert_matches!(
            optimizer
                .optimize_api_response(&request, rows(1), ResponseOptions::default())
                .await,
            Err(Error::Destroyed(_))
        );
        assert_eq!(optimizer.health_check().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_report_and_export() {
        let optimizer = optimizer().await;
        let request = ApiRequest::new("GET", "/trips");
        optimizer
            .optimize_api_response(&request, rows(5), ResponseOptions::default())
            .await
            .unwrap();

        let report = optimizer.get_performance_metrics();
        assert_eq!(report.responses_optimized, 1);
        assert_eq!(report.compression.responses, 1);
        assert_eq!(report.deduplication.executions, 1);

        let text = optimizer.export_metrics();
        assert!(text.contains("optlayer_responses_optimized 1"));
        assert!(text.contains("optlayer_cache_duration_seconds_count 1"));
        assert!(text.contains("optlayer_response_ok_total 1"));
    }
}
