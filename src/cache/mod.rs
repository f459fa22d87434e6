//! Two-Level Cache System
//!
//! An in-process L1 in front of an optional distributed L2.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      MultiLevelCache                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  L1 Cache (in-process)        │  L2 Cache (distributed)      │
//! │  ┌─────────────────────────┐  │  ┌────────────────────────┐  │
//! │  │ HashMap + LRU order     │  │  │ DistributedStore       │  │
//! │  │ max_size entries, TTL   │  │  │ (Redis / in-memory)    │  │
//! │  └─────────────────────────┘  │  │ + local prefix index   │  │
//! │              ▲                │  └────────────────────────┘  │
//! │              └── promotion ───┘                              │
//! │                                                              │
//! │       single-flight fallback (RequestDeduplicator)           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Semantics
//!
//! - Reads: L1, then L2; L2 hits are copied into L1
//! - Writes: through to every configured level; L2 failures degrade
//! - Invalidation: exact key or trailing `*` prefix, across all levels
//! - Expiry: lazily on read and by a periodic sweep

mod entry;
mod l1;
mod l2;
mod manager;
pub mod metrics;
mod redis;
pub mod warming;

pub use entry::{CacheEntry, CacheLevel, KeyPattern};
pub use l1::{L1Cache, L1Config};
pub use l2::{DistributedStore, InMemoryStore, L2Cache, L2Config};
pub use manager::{CacheConfig, MultiLevelCache, SetReport};
pub use metrics::{
    AnalyticsThresholds, CacheAnalytics, CacheMetricsSnapshot, Efficiency, LevelStats,
};
pub use redis::RedisStore;
pub use warming::{
    DataFetcher, WarmingFailure, WarmingPriority, WarmingReport, WarmingStrategy,
};

/// Default L1 capacity (entries)
pub const DEFAULT_L1_MAX_SIZE: usize = 1000;

/// Default L1 TTL (5 minutes)
pub const DEFAULT_L1_TTL_MS: u64 = 5 * 60 * 1000;

/// Default L2 TTL (1 hour)
pub const DEFAULT_L2_TTL_MS: u64 = 60 * 60 * 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_configs() {
        assert_eq!(L1Config::default().max_size, DEFAULT_L1_MAX_SIZE);
        assert_eq!(L1Config::default().ttl_ms, DEFAULT_L1_TTL_MS);
        assert_eq!(L2Config::default().default_ttl_ms, DEFAULT_L2_TTL_MS);
    }
}
