//! Observability
//!
//! Metrics and health reporting shared by every subsystem.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Observability                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────┐    ┌──────────────────────────┐  │
//! │  │ MetricsCollector       │    │ Health Checks            │  │
//! │  │ counters / gauges /    │    │ per-subsystem results,   │  │
//! │  │ stage histograms       │    │ liveness / readiness     │  │
//! │  └────────────────────────┘    └──────────────────────────┘  │
//! │              ▲                                               │
//! │      timed(collector, stage, future)                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Instrumentation is explicit: call sites wrap the work they want measured
//! in [`timed`].

mod collector;
mod health;

pub use collector::{
    timed, Counter, Gauge, Histogram, HistogramBucket, MetricsCollector, MonitoringConfig,
};
pub use health::{CheckStatus, HealthCheck, HealthCheckResult, HealthResponse, HealthStatus};
