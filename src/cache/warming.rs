//! Cache Warming
//!
//! Strategies that pre-populate the cache before traffic arrives.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use super::entry::CacheLevel;
use crate::error::Result;

/// Produces the value a strategy warms
pub type DataFetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Bytes>> + Send + Sync>;

/// Warming order; `High` runs first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmingPriority {
    High,
    Medium,
    Low,
}

/// One key to pre-populate
#[derive(Clone)]
pub struct WarmingStrategy {
    pub key: String,
    pub data_fetcher: DataFetcher,
    pub priority: WarmingPriority,
    /// Level default TTL when absent
    pub ttl: Option<Duration>,
    pub target_levels: Vec<CacheLevel>,
}

impl WarmingStrategy {
    /// Medium priority, every level, default TTL
    pub fn new<F, Fut>(key: impl Into<String>, fetcher: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        Self {
            key: key.into(),
            data_fetcher: Arc::new(move || fetcher().boxed()),
            priority: WarmingPriority::Medium,
            ttl: None,
            target_levels: CacheLevel::all(),
        }
    }

    pub fn with_priority(mut self, priority: WarmingPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_levels(mut self, levels: Vec<CacheLevel>) -> Self {
        self.target_levels = levels;
        self
    }
}

impl fmt::Debug for WarmingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WarmingStrategy")
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("ttl", &self.ttl)
            .field("target_levels", &self.target_levels)
            .finish_non_exhaustive()
    }
}

/// Order strategies by priority, keeping submission order within a priority
pub fn order_strategies(strategies: &mut [WarmingStrategy]) {
    strategies.sort_by_key(|s| s.priority);
}

/// A strategy that could not be applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmingFailure {
    pub key: String,
    pub reason: String,
}

/// Outcome of one warming run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmingReport {
    /// Keys stored, in execution order
    pub warmed: Vec<String>,
    pub failed: Vec<WarmingFailure>,
    pub duration_ms: u64,
}

impl WarmingReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.warmed.len() + self.failed.len()
    }
}
