//! Pipeline results and the aggregate performance report

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheAnalytics, CacheMetricsSnapshot};
use crate::compression::{CompressionStats, Encoding};
use crate::dedup::DedupStats;
use crate::pagination::{PageInfo, PaginationPlan};

/// One optimization applied while building a response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppliedOptimization {
    Pagination { page: u64, limit: u64 },
    CacheHit { key: String },
    CacheStore { key: String },
    /// Another caller computed this page concurrently
    Deduplicated { key: String },
    Compression { encoding: Encoding, ratio: f64 },
    Prefetch { pages: Vec<u64> },
    /// The planner recommends switching to cursor pagination
    CursorPaginationSuggested,
}

/// Time spent in each pipeline stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
    pub pagination_us: u64,
    pub cache_us: u64,
    pub compression_us: u64,
    pub total_us: u64,
}

impl StageTimings {
    pub(crate) fn micros(duration: Duration) -> u64 {
        u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
    }
}

/// A response body ready to send
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizedResponse {
    /// Encoded body; JSON when `encoding` is `none`
    pub optimized_data: Bytes,
    pub encoding: Encoding,
    pub original_size: usize,
    pub compressed_size: usize,
    pub optimizations: Vec<AppliedOptimization>,
    pub performance_metrics: StageTimings,
    pub pagination: Option<PageInfo>,
    /// Present when the request was paginated
    pub plan: Option<PaginationPlan>,
}

impl OptimizedResponse {
    /// `Content-Encoding` header value, if any
    pub fn content_encoding(&self) -> Option<&'static str> {
        self.encoding.header_value()
    }

    pub fn served_from_cache(&self) -> bool {
        self.optimizations
            .iter()
            .any(|o| matches!(o, AppliedOptimization::CacheHit { .. }))
    }
}

/// Every subsystem's statistics at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub cache: CacheMetricsSnapshot,
    pub cache_analytics: CacheAnalytics,
    pub deduplication: DedupStats,
    pub compression: CompressionStats,
    pub responses_optimized: u64,
    pub response_failures: u64,
    pub prefetched_pages: u64,
    pub uptime_seconds: u64,
    pub generated_at: DateTime<Utc>,
}
