//! optlayer - Performance Optimization Layer
//!
//! An in-process layer that sits between API handlers and their data
//! sources. It serves repeated reads from a two-level cache, collapses
//! concurrent identical requests into one execution, negotiates response
//! compression with the client and plans pagination.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      PerformanceOptimizer                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐  ┌─────────────────┐  ┌──────────────────────┐  │
//! │  │ Pagination │─▶│ MultiLevelCache │─▶│ AdaptiveCompressor   │  │
//! │  │ Planner    │  │ L1 (LRU) + L2   │  │ gzip / deflate / br  │  │
//! │  └────────────┘  └────────┬────────┘  └──────────────────────┘  │
//! │                           │                                     │
//! │                  ┌────────▼─────────┐                           │
//! │                  │ RequestDedup     │  single flight per key    │
//! │                  └──────────────────┘                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - L1/L2 cache, warming and analytics
//! - [`compression`] - `Accept-Encoding` negotiation and codecs
//! - [`config`] - Typed, validated configuration
//! - [`dedup`] - Single-flight request coalescing and batch windows
//! - [`error`] - Error types
//! - [`monitoring`] - Metrics collector and health reporting
//! - [`orchestrator`] - The response pipeline facade
//! - [`pagination`] - Page planning and response envelopes

pub mod cache;
pub mod compression;
pub mod config;
pub mod dedup;
pub mod error;
pub mod monitoring;
pub mod orchestrator;
pub mod pagination;

// Re-export commonly used types
pub use cache::{CacheConfig, DistributedStore, MultiLevelCache, WarmingStrategy};
pub use compression::{AdaptiveCompressor, CompressedResponse, Encoding};
pub use config::OptimizerConfig;
pub use dedup::{DedupOptions, RequestDeduplicator};
pub use error::{Error, Result};
pub use monitoring::{HealthResponse, HealthStatus};
pub use orchestrator::{ApiRequest, OptimizedResponse, PerformanceOptimizer, ResponseOptions};
pub use pagination::{PaginationPlanner, PaginationQuery};

/// Crate version reported by health responses
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
