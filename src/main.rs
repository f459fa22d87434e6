//! optlayer daemon
//!
//! Builds the performance optimizer from a YAML file and environment, keeps
//! the cache sweeper running and serves probe and metrics endpoints.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         optlayer daemon                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────────────┐    ┌───────────┐  │
//! │  │ Health server│───▶│ PerformanceOptimizer │◀───│  Metrics  │  │
//! │  │ /healthz     │    │ cache, dedup,        │    │  server   │  │
//! │  │ /livez       │    │ compression,         │    │  /metrics │  │
//! │  │ /readyz      │    │ pagination           │    │           │  │
//! │  └──────────────┘    └──────────────────────┘    └───────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use optlayer::cache::L2Config;
use optlayer::monitoring::HealthCheck;
use optlayer::{Error, OptimizerConfig, PerformanceOptimizer, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// optlayer - caching, deduplication and compression for API responses
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "OPTLAYER_CONFIG")]
    config: Option<String>,

    /// Redis host for the L2 cache; overrides the file
    #[arg(long, env = "REDIS_HOST")]
    redis_host: Option<String>,

    /// Redis port
    #[arg(long, env = "REDIS_PORT", default_value = "6379")]
    redis_port: u16,

    /// Redis password
    #[arg(long, env = "REDIS_PASSWORD", hide_env_values = true)]
    redis_password: Option<String>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

/// State shared by the HTTP servers
struct AppState {
    optimizer: PerformanceOptimizer,
    probes: HealthCheck,
    http_requests: prometheus::IntCounterVec,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting optlayer {}", optlayer::VERSION);

    let config = load_config(&args)?;
    info!(
        "  L2 cache: {}",
        config
            .cache
            .l2
            .as_ref()
            .map(|l2| format!("{}:{}", l2.host, l2.port))
            .unwrap_or_else(|| "disabled".to_string())
    );
    info!("  L1 max size: {}", config.cache.l1.max_size);
    info!("  Health check timeout: {}ms", config.health.timeout_ms);

    let optimizer = PerformanceOptimizer::initialize(config).await.map_err(|e| {
        error!("Failed to initialize optimizer: {}", e);
        e
    })?;

    let http_requests = prometheus::register_int_counter_vec!(
        "optlayer_daemon_http_requests_total",
        "Requests served by the daemon's HTTP endpoints",
        &["endpoint"]
    )
    .map_err(|e| Error::Internal(format!("Failed to register metrics: {}", e)))?;

    let state = Arc::new(AppState {
        optimizer,
        probes: HealthCheck::new(),
        http_requests,
    });

    // Start health server
    let health_state = Arc::clone(&state);
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_state).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_state = Arc::clone(&state);
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_state).await {
            error!("Metrics server error: {}", e);
        }
    });

    state.probes.set_ready(true);
    info!("optlayer ready");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Internal(format!("Failed to listen for shutdown signal: {}", e)))?;

    info!("Shutdown signal received");
    state.probes.set_ready(false);
    state.probes.set_live(false);
    state.optimizer.destroy().await?;

    info!("optlayer shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> Result<OptimizerConfig> {
    let mut config = match &args.config {
        Some(path) => OptimizerConfig::from_yaml_file(path)?,
        None => OptimizerConfig::default(),
    };

    if let Some(host) = &args.redis_host {
        let l2 = config.cache.l2.get_or_insert_with(L2Config::default);
        l2.host = host.clone();
        l2.port = args.redis_port;
        if args.redis_password.is_some() {
            l2.password = args.redis_password.clone();
        }
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// HTTP Helpers
// =============================================================================

type HttpResponse = hyper::Response<http_body_util::Full<hyper::body::Bytes>>;

fn respond(
    status: hyper::StatusCode,
    content_type: &'static str,
    body: impl Into<hyper::body::Bytes>,
) -> HttpResponse {
    use http_body_util::Full;
    use hyper::header::{HeaderValue, CONTENT_TYPE};

    let mut response = hyper::Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response<T: serde::Serialize>(status: hyper::StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", body),
        Err(e) => respond(
            hyper::StatusCode::INTERNAL_SERVER_ERROR,
            "text/plain",
            format!("serialization failed: {}", e),
        ),
    }
}

// =============================================================================
// Health Server
// =============================================================================

async fn health_handler(
    req: hyper::Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> std::result::Result<HttpResponse, std::convert::Infallible> {
    use hyper::StatusCode;

    let path = req.uri().path();
    let response = match path {
        "/livez" => {
            let check = state.probes.liveness_check();
            let status = if state.probes.is_live() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(status, &check)
        }
        "/readyz" => {
            if !state.probes.is_ready() {
                json_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    &state.probes.readiness_check(),
                )
            } else {
                let health = state.optimizer.health_check().await;
                let status = if health.status.is_operational() {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                json_response(status, &health)
            }
        }
        "/healthz" => {
            let health = state.optimizer.health_check().await;
            let status = if health.status.is_operational() {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            json_response(status, &health)
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };

    let endpoint = match path {
        "/livez" | "/readyz" | "/healthz" => path,
        _ => "other",
    };
    state.http_requests.with_label_values(&[endpoint]).inc();
    Ok(response)
}

async fn run_health_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?;

    info!("Health server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Health server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, Arc::clone(&state)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn metrics_handler(
    req: hyper::Request<hyper::body::Incoming>,
    state: Arc<AppState>,
) -> std::result::Result<HttpResponse, std::convert::Infallible> {
    use hyper::StatusCode;
    use prometheus::{Encoder, TextEncoder};

    let response = match req.uri().path() {
        "/metrics" => {
            state.http_requests.with_label_values(&["/metrics"]).inc();

            let encoder = TextEncoder::new();
            let metric_families = prometheus::gather();
            let mut buffer = Vec::new();
            match encoder.encode(&metric_families, &mut buffer) {
                Ok(()) => {
                    buffer.extend_from_slice(state.optimizer.export_metrics().as_bytes());
                    respond(StatusCode::OK, "text/plain; version=0.0.4", buffer)
                }
                Err(e) => respond(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain",
                    format!("metrics encoding failed: {}", e),
                ),
            }
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    };
    Ok(response)
}

async fn run_metrics_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|e| Error::Internal(format!("Metrics server accept error: {}", e)))?;

        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req| metrics_handler(req, Arc::clone(&state)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
