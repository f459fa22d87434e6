//! Cache Metrics Collection
//!
//! Counters owned by the manager, per-level snapshots, and the analytics
//! derived from them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Manager-level cache counters
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Lookups that missed every configured level
    misses: AtomicU64,
    promotions_l2_to_l1: AtomicU64,
    fallback_executions: AtomicU64,
    fallback_failures: AtomicU64,
    sets: AtomicU64,
    partial_sets: AtomicU64,
    invalidated_keys: AtomicU64,
    l2_degraded_reads: AtomicU64,

    // Operation latencies (microseconds, exponential moving average)
    l1_read_latency_us: AtomicU64,
    l2_read_latency_us: AtomicU64,
    fallback_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions_l2_to_l1.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self, duration: Duration, ok: bool) {
        self.fallback_executions.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.fallback_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.update_latency_ema(&self.fallback_latency_us, duration);
    }

    pub fn record_set(&self, partial: bool) {
        self.sets.fetch_add(1, Ordering::Relaxed);
        if partial {
            self.partial_sets.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_invalidation(&self, keys: u64) {
        self.invalidated_keys.fetch_add(keys, Ordering::Relaxed);
    }

    pub fn record_l2_degraded_read(&self) {
        self.l2_degraded_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l1_read_latency(&self, duration: Duration) {
        self.update_latency_ema(&self.l1_read_latency_us, duration);
    }

    pub fn record_l2_read_latency(&self, duration: Duration) {
        self.update_latency_ema(&self.l2_read_latency_us, duration);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions_l2_to_l1.load(Ordering::Relaxed)
    }

    pub fn fallback_executions(&self) -> u64 {
        self.fallback_executions.load(Ordering::Relaxed)
    }

    pub fn fallback_failures(&self) -> u64 {
        self.fallback_failures.load(Ordering::Relaxed)
    }

    pub fn sets(&self) -> u64 {
        self.sets.load(Ordering::Relaxed)
    }

    pub fn partial_sets(&self) -> u64 {
        self.partial_sets.load(Ordering::Relaxed)
    }

    pub fn invalidated_keys(&self) -> u64 {
        self.invalidated_keys.load(Ordering::Relaxed)
    }

    pub fn l2_degraded_reads(&self) -> u64 {
        self.l2_degraded_reads.load(Ordering::Relaxed)
    }

    pub fn l1_read_latency(&self) -> Duration {
        Duration::from_micros(self.l1_read_latency_us.load(Ordering::Relaxed))
    }

    pub fn l2_read_latency(&self) -> Duration {
        Duration::from_micros(self.l2_read_latency_us.load(Ordering::Relaxed))
    }

    pub fn fallback_latency(&self) -> Duration {
        Duration::from_micros(self.fallback_latency_us.load(Ordering::Relaxed))
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed time
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Point-in-time statistics for one level
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub evictions: u64,
    pub errors: u64,
    pub hit_rate: f64,
}

impl LevelStats {
    /// Build stats, deriving the hit rate
    pub fn new(hits: u64, misses: u64, entries: u64, evictions: u64, errors: u64) -> Self {
        Self {
            hits,
            misses,
            entries,
            evictions,
            errors,
            hit_rate: ratio(hits, hits + misses),
        }
    }
}

/// Snapshot of cache metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetricsSnapshot {
    pub l1: LevelStats,
    /// Absent when no L2 is configured
    pub l2: Option<LevelStats>,
    pub total_hits: u64,
    /// Lookups that missed every configured level
    pub total_misses: u64,
    pub overall_hit_rate: f64,
    pub l1_writes: u64,
    pub promotions: u64,
    pub fallback_executions: u64,
    pub fallback_failures: u64,
    pub sets: u64,
    pub partial_sets: u64,
    pub invalidated_keys: u64,
    /// Invalidations waiting for L2 to come back
    pub pending_invalidations: u64,
    pub l2_degraded_reads: u64,
    pub l1_read_latency_us: u64,
    pub l2_read_latency_us: u64,
    pub fallback_latency_us: u64,
}

impl CacheMetricsSnapshot {
    /// L1 evictions per L1 write
    pub fn l1_eviction_rate(&self) -> f64 {
        ratio(self.l1.evictions, self.l1_writes)
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

// =============================================================================
// Analytics
// =============================================================================

/// Cache efficiency classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Efficiency {
    Poor,
    Fair,
    Good,
}

impl std::fmt::Display for Efficiency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Efficiency::Poor => write!(f, "poor"),
            Efficiency::Fair => write!(f, "fair"),
            Efficiency::Good => write!(f, "good"),
        }
    }
}

/// Thresholds driving the efficiency classification and recommendations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsThresholds {
    /// Overall hit rate below this is poor
    pub poor_below: f64,
    /// Overall hit rate below this (and not poor) is fair
    pub fair_below: f64,
    /// L1 evictions per write considered high
    pub high_eviction_rate: f64,
    /// L2 hit rate considered high
    pub high_l2_hit_rate: f64,
    /// Lookups needed before recommendations are made
    pub min_samples: u64,
}

impl Default for AnalyticsThresholds {
    fn default() -> Self {
        Self {
            poor_below: 0.5,
            fair_below: 0.8,
            high_eviction_rate: 0.1,
            high_l2_hit_rate: 0.5,
            min_samples: 10,
        }
    }
}

impl AnalyticsThresholds {
    /// Reject thresholds that cannot classify consistently
    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.poor_below) || !in_unit(self.fair_below) {
            return Err(Error::Config(
                "analytics hit-rate bands must be within [0, 1]".into(),
            ));
        }
        if self.poor_below > self.fair_below {
            return Err(Error::Config(
                "analytics.poor_below must not exceed analytics.fair_below".into(),
            ));
        }
        Ok(())
    }

    /// Classify an overall hit rate
    pub fn classify(&self, hit_rate: f64) -> Efficiency {
        if hit_rate < self.poor_below {
            Efficiency::Poor
        } else if hit_rate < self.fair_below {
            Efficiency::Fair
        } else {
            Efficiency::Good
        }
    }
}

/// Derived cache analytics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheAnalytics {
    pub l1_hit_rate: f64,
    pub l2_hit_rate: Option<f64>,
    pub overall_hit_rate: f64,
    pub l1_eviction_rate: f64,
    pub efficiency: Efficiency,
    pub recommendations: Vec<String>,
}

impl CacheAnalytics {
    /// Analyse a snapshot
    pub fn from_snapshot(snapshot: &CacheMetricsSnapshot, thresholds: &AnalyticsThresholds) -> Self {
        let efficiency = thresholds.classify(snapshot.overall_hit_rate);
        let l1_eviction_rate = snapshot.l1_eviction_rate();
        let l2_hit_rate = snapshot.l2.as_ref().map(|l2| l2.hit_rate);
        let lookups = snapshot.total_hits + snapshot.total_misses;

        let mut recommendations = Vec::new();

        if l1_eviction_rate > thresholds.high_eviction_rate
            && l2_hit_rate.is_some_and(|rate| rate > thresholds.high_l2_hit_rate)
        {
            recommendations.push(format!(
                "L1 evicts {:.0}% of writes while L2 serves {:.0}% of its lookups; increase L1 max size",
                l1_eviction_rate * 100.0,
                l2_hit_rate.unwrap_or_default() * 100.0
            ));
        } else if l1_eviction_rate > thresholds.high_eviction_rate {
            recommendations.push(format!(
                "L1 evicts {:.0}% of writes; consider a larger L1 max size",
                l1_eviction_rate * 100.0
            ));
        }

        if lookups >= thresholds.min_samples {
            match efficiency {
                Efficiency::Poor => recommendations.push(
                    "Hit rate is poor; review TTLs and warm frequently requested keys at startup"
                        .to_string(),
                ),
                Efficiency::Fair if snapshot.l2.is_none() => recommendations.push(
                    "Hit rate is fair; enabling a distributed L2 tier would share results across processes"
                        .to_string(),
                ),
                _ => {}
            }
        }

        if let Some(l2) = &snapshot.l2 {
            if l2.errors > 0 {
                recommendations.push(format!(
                    "L2 reported {} errors; check connectivity to the distributed store",
                    l2.errors
                ));
            }
        }

        if snapshot.fallback_failures > 0 {
            recommendations.push(format!(
                "{} of {} fallback fetches failed; failed fetches are never cached",
                snapshot.fallback_failures, snapshot.fallback_executions
            ));
        }

        Self {
            l1_hit_rate: snapshot.l1.hit_rate,
            l2_hit_rate,
            overall_hit_rate: snapshot.overall_hit_rate,
            l1_eviction_rate,
            efficiency,
            recommendations,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(hits: u64, misses: u64) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            l1: LevelStats::new(hits, misses, 10, 0, 0),
            total_hits: hits,
            total_misses: misses,
            overall_hit_rate: ratio(hits, hits + misses),
            ..Default::default()
        }
    }

    #[test]
    fn test_counters() {
        let metrics = CacheMetrics::new();
        metrics.record_miss();
        metrics.record_promotion();
        metrics.record_set(true);
        metrics.record_set(false);
        metrics.record_fallback(Duration::from_micros(100), false);

        assert_eq!(metrics.misses(), 1);
        assert_eq!(metrics.promotions(), 1);
        assert_eq!(metrics.sets(), 2);
        assert_eq!(metrics.partial_sets(), 1);
        assert_eq!(metrics.fallback_executions(), 1);
        assert_eq!(metrics.fallback_failures(), 1);
    }

    #[test]
    fn test_latency_ema() {
        let metrics = CacheMetrics::new();
        metrics.record_l1_read_latency(Duration::from_micros(100));
        assert_eq!(metrics.l1_read_latency(), Duration::from_micros(100));

        metrics.record_l1_read_latency(Duration::from_micros(200));
        // 0.9 * 100 + 0.1 * 200
        let us = metrics.l1_read_latency().as_micros();
        assert!((109..=110).contains(&us), "got {}", us);
    }

    #[test]
    fn test_level_stats_hit_rate() {
        let stats = LevelStats::new(3, 1, 0, 0, 0);
        assert!((stats.hit_rate - 0.75).abs() < f64::EPSILON);
        assert_eq!(LevelStats::new(0, 0, 0, 0, 0).hit_rate, 0.0);
    }

    #[test]
    fn test_efficiency_bands() {
        let thresholds = AnalyticsThresholds::default();
        assert_eq!(thresholds.classify(0.2), Efficiency::Poor);
        assert_eq!(thresholds.classify(0.5), Efficiency::Fair);
        assert_eq!(thresholds.classify(0.79), Efficiency::Fair);
        assert_eq!(thresholds.classify(0.8), Efficiency::Good);
    }

    #[test]
    fn test_threshold_validation() {
        assert!(AnalyticsThresholds::default().validate().is_ok());
        let inverted = AnalyticsThresholds {
            poor_below: 0.9,
            fair_below: 0.5,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_recommend_larger_l1() {
        let mut snap = snapshot(80, 20);
        snap.l1 = LevelStats::new(40, 60, 10, 50, 0);
        snap.l1_writes = 100;
        snap.l2 = Some(LevelStats::new(40, 20, 0, 0, 0));

        let analytics = CacheAnalytics::from_snapshot(&snap, &AnalyticsThresholds::default());
        assert!(analytics
            .recommendations
            .iter()
            .any(|r| r.contains("increase L1 max size")));
        assert_eq!(analytics.efficiency, Efficiency::Good);
    }

    #[test]
    fn test_recommend_for_poor_hit_rate() {
        let snap = snapshot(2, 18);
        let analytics = CacheAnalytics::from_snapshot(&snap, &AnalyticsThresholds::default());
        assert_eq!(analytics.efficiency, Efficiency::Poor);
        assert!(analytics
            .recommendations
            .iter()
            .any(|r| r.contains("review TTLs")));
    }

    #[test]
    fn test_no_recommendations_without_samples() {
        let snap = snapshot(0, 1);
        let analytics = CacheAnalytics::from_snapshot(&snap, &AnalyticsThresholds::default());
        assert!(analytics.recommendations.is_empty());
    }

    #[test]
    fn test_efficiency_serializes_lowercase() {
        let json = serde_json::to_string(&Efficiency::Fair).unwrap();
        assert_eq!(json, "\"fair\"");
    }
}
