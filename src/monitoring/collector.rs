//! Metrics Collector
//!
//! Lock-free counters, gauges and histograms keyed by name, exported in the
//! Prometheus text format.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Monitoring configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Record metrics at all
    pub metrics_enabled: bool,
    /// Prefix for every exported metric name
    pub namespace: String,
    /// Stage latency bucket bounds in seconds
    pub latency_buckets: Vec<f64>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            namespace: "optlayer".to_string(),
            latency_buckets: vec![
                0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
            ],
        }
    }
}

impl MonitoringConfig {
    pub fn validate(&self) -> Result<()> {
        if self.latency_buckets.iter().any(|b| !b.is_finite() || *b <= 0.0) {
            return Err(Error::Config(
                "monitoring.latency_buckets must be positive and finite".into(),
            ));
        }
        let valid_name = !self.namespace.is_empty()
            && self
                .namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_name {
            return Err(Error::Config(
                "monitoring.namespace must be non-empty [A-Za-z0-9_]".into(),
            ));
        }
        Ok(())
    }
}

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Floating point gauge (bits stored in an `AtomicU64`)
#[derive(Debug, Default)]
pub struct Gauge {
    bits: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Histogram bucket
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramBucket {
    /// Upper bound (inclusive)
    pub le: f64,
    /// Cumulative count of observations
    pub count: u64,
}

/// Cumulative histogram
#[derive(Debug)]
pub struct Histogram {
    boundaries: Vec<f64>,
    buckets: Vec<AtomicU64>,
    /// Sum of observations in micro-units
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Histogram with the given upper bounds
    pub fn with_buckets(mut boundaries: Vec<f64>) -> Self {
        boundaries.retain(|b| b.is_finite());
        boundaries.sort_by(f64::total_cmp);
        boundaries.dedup();
        let buckets = boundaries.iter().map(|_| AtomicU64::new(0)).collect();

        Self {
            boundaries,
            buckets,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value.max(0.0) * 1_000_000.0) as u64, Ordering::Relaxed);

        for (bound, bucket) in self.boundaries.iter().zip(&self.buckets) {
            if value <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_secs_f64());
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn buckets(&self) -> Vec<HistogramBucket> {
        self.boundaries
            .iter()
            .zip(&self.buckets)
            .map(|(&le, count)| HistogramBucket {
                le,
                count: count.load(Ordering::Relaxed),
            })
            .collect()
    }

    pub fn average(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum() / n as f64,
        }
    }
}

/// Named metric registry
pub struct MetricsCollector {
    config: MonitoringConfig,
    counters: RwLock<HashMap<String, Arc<Counter>>>,
    gauges: RwLock<HashMap<String, Arc<Gauge>>>,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
    start_time: Instant,
}

impl MetricsCollector {
    pub fn new(config: MonitoringConfig) -> Self {
        Self {
            config,
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    fn full_name(&self, name: &str) -> String {
        format!("{}_{}", self.config.namespace, name)
    }

    /// Get or create a counter
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let key = self.full_name(name);
        if let Some(counter) = self.counters.read().get(&key) {
            return counter.clone();
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Counter::new()))
            .clone()
    }

    /// Get or create a gauge
    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        let key = self.full_name(name);
        if let Some(gauge) = self.gauges.read().get(&key) {
            return gauge.clone();
        }
        self.gauges
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Gauge::new()))
            .clone()
    }

    /// Get or create a latency histogram
    pub fn histogram(&self, name: &str) -> Arc<Histogram> {
        let key = self.full_name(name);
        if let Some(histogram) = self.histograms.read().get(&key) {
            return histogram.clone();
        }
        let buckets = self.config.latency_buckets.clone();
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(Histogram::with_buckets(buckets)))
            .clone()
    }

    /// Record one stage execution
    pub fn record_stage(&self, stage: &str, elapsed: Duration, ok: bool) {
        if !self.config.metrics_enabled {
            return;
        }
        self.histogram(&format!("{}_duration_seconds", stage))
            .observe_duration(elapsed);
        let outcome = if ok { "ok" } else { "error" };
        self.counter(&format!("{}_{}_total", stage, outcome)).inc();
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Counter values by exported name
    pub fn get_counters(&self) -> HashMap<String, u64> {
        self.counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.get()))
            .collect()
    }

    /// Gauge values by exported name
    pub fn get_gauges(&self) -> HashMap<String, f64> {
        self.gauges
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.get()))
            .collect()
    }

    /// Export every metric in the Prometheus text format, sorted by name
    pub fn export_text(&self) -> String {
        let mut output = String::new();

        let mut counters: Vec<_> = self.get_counters().into_iter().collect();
        counters.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in counters {
            output.push_str(&format!("# TYPE {} counter\n{} {}\n", name, name, value));
        }

        let mut gauges: Vec<_> = self.get_gauges().into_iter().collect();
        gauges.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in gauges {
            output.push_str(&format!("# TYPE {} gauge\n{} {}\n", name, name, value));
        }

        let histograms = self.histograms.read();
        let mut names: Vec<_> = histograms.keys().cloned().collect();
        names.sort();
        for name in names {
            let Some(histogram) = histograms.get(&name) else {
                continue;
            };
            output.push_str(&format!("# TYPE {} histogram\n", name));
            for bucket in histogram.buckets() {
                output.push_str(&format!(
                    "{}_bucket{{le=\"{}\"}} {}\n",
                    name, bucket.le, bucket.count
                ));
            }
            output.push_str(&format!(
                "{}_bucket{{le=\"+Inf\"}} {}\n",
                name,
                histogram.count()
            ));
            output.push_str(&format!("{}_sum {}\n", name, histogram.sum()));
            output.push_str(&format!("{}_count {}\n", name, histogram.count()));
        }

        output
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(MonitoringConfig::default())
    }
}

/// Run `fut` as the named stage, recording its latency and outcome
pub async fn timed<T, F>(collector: &MetricsCollector, stage: &str, fut: F) -> (Result<T>, Duration)
where
    F: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let result = fut.await;
    let elapsed = started.elapsed();
    collector.record_stage(stage, elapsed, result.is_ok());
    (result, elapsed)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new();
        counter.inc();
        counter.add(10);
        assert_eq!(counter.get(), 11);
    }

    #[test]
    fn test_gauge_holds_fractions() {
        let gauge = Gauge::new();
        assert_eq!(gauge.get(), 0.0);
        gauge.set(0.875);
        assert_eq!(gauge.get(), 0.875);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let histogram = Histogram::with_buckets(vec![0.1, 0.01, 1.0, f64::NAN]);
        histogram.observe(0.005);
        histogram.observe(0.05);
        histogram.observe(5.0);

        let buckets = histogram.buckets();
        let counts: Vec<_> = buckets.iter().map(|b| (b.le, b.count)).collect();
        assert_eq!(counts, vec![(0.01, 1), (0.1, 2), (1.0, 2)]);
        assert_eq!(histogram.count(), 3);
        assert!((histogram.sum() - 5.055).abs() < 1e-5);
    }

    #[test]
    fn test_names_are_namespaced() {
        let collector = MetricsCollector::default();
        collector.counter("responses_total").add(3);
        collector.gauge("cache_hit_rate").set(0.5);

        assert_eq!(
            collector.get_counters().get("optlayer_responses_total"),
            Some(&3)
        );
        assert_eq!(
            collector.get_gauges().get("optlayer_cache_hit_rate"),
            Some(&0.5)
        );
    }

    #[test]
    fn test_same_counter_returned() {
        let collector = MetricsCollector::default();
        let c1 = collector.counter("x");
        let c2 = collector.counter("x");
        c1.inc();
        assert_eq!(c2.get(), 1);
    }

    #[test]
    fn test_export_text() {
        let collector = MetricsCollector::default();
        collector.counter("requests_total").add(100);
        collector.gauge("pending").set(2.0);
        collector.record_stage("compression", Duration::from_millis(2), true);

        let output = collector.export_text();
        assert!(output.contains("optlayer_requests_total 100"));
        assert!(output.contains("optlayer_pending 2"));
        assert!(output.contains("# TYPE optlayer_compression_duration_seconds histogram"));
        assert!(output.contains("optlayer_compression_duration_seconds_bucket{le=\"+Inf\"} 1"));
        assert!(output.contains("optlayer_compression_ok_total 1"));
    }

    #[test]
    fn test_disabled_collector_records_nothing() {
        let collector = MetricsCollector::new(MonitoringConfig {
            metrics_enabled: false,
            ..Default::default()
        });
        collector.record_stage("cache", Duration::from_millis(1), true);
        assert!(collector.get_counters().is_empty());
    }

    #[tokio::test]
    async fn test_timed_records_outcome() {
        let collector = MetricsCollector::default();
        let (ok, _) = timed(&collector, "fetch", async { Ok::<_, Error>(1) }).await;
        let (err, _) = timed(&collector, "fetch", async {
            Err::<u32, _>(Error::Internal("boom".into()))
        })
        .await;

        assert_eq!(ok, Ok(1));
        assert!(err.is_err());
        let counters = collector.get_counters();
        assert_eq!(counters.get("optlayer_fetch_ok_total"), Some(&1));
        assert_eq!(counters.get("optlayer_fetch_error_total"), Some(&1));
        assert_eq!(collector.histogram("fetch_duration_seconds").count(), 2);
    }

    #[test]
    fn test_config_validation() {
        assert!(MonitoringConfig::default().validate().is_ok());
        let bad = MonitoringConfig {
            namespace: "opt-layer".into(),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
