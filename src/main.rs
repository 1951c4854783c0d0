//! Stratacache Server
//!
//! Runs a cache from a YAML config and serves its metrics and health.
//!
//! # Endpoints
//!
//! ```text
//! GET /metrics   Prometheus text exposition
//! GET /healthz   JSON health report (503 when critical)
//! GET /readyz    200 once background tasks are running
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use stratacache::monitoring::{HealthReport, HealthStatus, PrometheusExporter};
use stratacache::{Cache, CacheConfig, Tier};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Stratacache - three-tier cache with health monitoring
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file (defaults apply when absent)
    #[arg(long, env = "STRATACACHE_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP bind address for metrics and health
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let config = match &args.config {
        Some(path) => CacheConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => CacheConfig::default(),
    };

    if args.check_config {
        info!("Configuration is valid");
        return Ok(());
    }

    info!("Starting Stratacache");
    for tier in Tier::ALL {
        let tier_config = config.tier(tier);
        info!(
            "  {}: max_keys={}, default_ttl={}s, eviction={:?}",
            tier, tier_config.max_keys, tier_config.default_ttl, tier_config.eviction
        );
    }
    info!("  L3 backend: {:?}", config.l3_backend);

    let cache: Arc<Cache<Value>> = Arc::new(
        Cache::new(config)
            .await
            .context("Failed to initialize cache")?,
    );
    let exporter = Arc::new(PrometheusExporter::new().context("Failed to register metrics")?);
    let tasks = cache.start_background(Some(Arc::clone(&exporter)));

    let state = Arc::new(ServerState {
        cache,
        exporter,
        ready: AtomicBool::new(true),
    });

    let addr: SocketAddr = args
        .metrics_addr
        .parse()
        .with_context(|| format!("Invalid metrics address: {}", args.metrics_addr))?;

    tokio::select! {
        result = run_http_server(addr, Arc::clone(&state)) => {
            if let Err(e) = result {
                error!("HTTP server error: {:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    state.ready.store(false, Ordering::Relaxed);
    tasks.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?);

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
    Ok(())
}

// =============================================================================
// HTTP Server
// =============================================================================

struct ServerState {
    cache: Arc<Cache<Value>>,
    exporter: Arc<PrometheusExporter>,
    ready: AtomicBool,
}

async fn run_http_server(addr: SocketAddr, state: Arc<ServerState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server on {}", addr))?;

    info!("HTTP server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("HTTP server accept error")?;

        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, Arc::clone(&state)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("HTTP connection error: {}", e);
            }
        });
    }
}

async fn handle(
    req: Request<hyper::body::Incoming>,
    state: Arc<ServerState>,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    if req.method() != Method::GET {
        return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"));
    }

    let response = match req.uri().path() {
        "/metrics" => metrics(&state).await,
        "/healthz" | "/livez" => health(&state).await,
        "/readyz" => {
            if state.ready.load(Ordering::Relaxed) {
                text(StatusCode::OK, "ok")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "not ready")
            }
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn metrics(state: &ServerState) -> Response<Full<Bytes>> {
    let metrics = state.cache.all_metrics().await;
    let report = HealthReport::evaluate(
        &metrics,
        state.cache.l3_available(),
        &state.cache.config().health,
    );
    state.exporter.update_tiers(&metrics);
    state.exporter.update_health(&report);

    match state.exporter.encode() {
        Ok(buffer) => {
            let mut response = Response::new(Full::new(Bytes::from(buffer)));
            if let Ok(value) = HeaderValue::from_str(&state.exporter.content_type()) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
        }
    }
}

async fn health(state: &ServerState) -> Response<Full<Bytes>> {
    let report = state.cache.health_check().await;
    let status = if report.status == HealthStatus::Critical {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    match serde_json::to_vec(&report) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!("Failed to serialize health report: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "health unavailable")
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}
