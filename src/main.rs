//! Declarative Control Plane
//!
//! Serves the resource-provider REST API, plus separate health and metrics
//! endpoints, over a configurable document store and provider set.

use clap::Parser;
use prometheus::Registry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use declarative_control_plane::config::StorageBackend;
use declarative_control_plane::{
    open_store, ApiServer, ApiServerConfig, ControlPlane, ControlPlaneConfig,
    ControlPlaneMetrics, Error, ProviderRegistry, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Declarative Control Plane - provisions declared resources through provider plugins
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR")]
    api_addr: Option<SocketAddr>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<SocketAddr>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,

    /// Base URL used in operation-status links
    #[arg(long, env = "PUBLIC_BASE_URL")]
    public_base_url: Option<String>,

    /// Persist documents under this directory instead of in memory
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Number of concurrent plugin operations
    #[arg(long, env = "WORKER_COUNT")]
    worker_count: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args)?;
    let config = load_config(&args)?;

    info!("Starting Declarative Control Plane");
    info!("  Version: {}", declarative_control_plane::VERSION);
    info!("  REST API: {}", config.server.rest_addr);
    info!("  Public URL: {}", config.server.public_base_url);
    info!("  Storage: {:?}", config.storage.backend);
    info!("  Workers: {}", config.orchestrator.worker_count);

    let registry = Registry::new();
    let metrics = Arc::new(ControlPlaneMetrics::new(&registry)?);
    let providers = Arc::new(ProviderRegistry::from_config(&config.providers)?);
    let store = open_store(&config.storage).await?;

    let shutdown = CancellationToken::new();
    let control_plane = Arc::new(ControlPlane::start(
        &config,
        store,
        providers,
        metrics.clone(),
        shutdown.clone(),
    ));

    let health = tokio::spawn(run_health_server(
        config.server.health_addr,
        control_plane.clone(),
        shutdown.clone(),
    ));
    let metrics_server = tokio::spawn(run_metrics_server(
        config.server.metrics_addr,
        registry,
        shutdown.clone(),
    ));

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    let api_server = ApiServer::new(
        ApiServerConfig::from(&config.server),
        control_plane.clone(),
        metrics,
        shutdown.clone(),
    );
    let result = api_server.run().await;
    shutdown.cancel();

    for (name, handle) in [("Health", health), ("Metrics", metrics_server)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("{} server error: {}", name, e),
            Err(e) => error!("{} server task failed: {}", name, e),
        }
    }

    match Arc::try_unwrap(control_plane) {
        Ok(control_plane) => control_plane.join().await,
        Err(_) => warn!("Control plane still referenced at shutdown"),
    }

    info!("Control plane shutdown complete");
    result
}

// =============================================================================
// Configuration
// =============================================================================

fn load_config(args: &Args) -> Result<ControlPlaneConfig> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            ControlPlaneConfig::from_file(path)?
        }
        None => ControlPlaneConfig::default(),
    };

    if let Some(addr) = args.api_addr {
        config.server.rest_addr = addr;
    }
    if let Some(addr) = args.health_addr {
        config.server.health_addr = addr;
    }
    if let Some(addr) = args.metrics_addr {
        config.server.metrics_addr = addr;
    }
    if let Some(url) = &args.public_base_url {
        config.server.public_base_url = url.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.storage.backend = StorageBackend::File;
        config.storage.data_dir = dir.clone();
    }
    if let Some(count) = args.worker_count {
        config.orchestrator.worker_count = count;
    }

    config.validate()?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower=warn", "tower_http=info", "axum=info"] {
        let directive = directive
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid log directive: {}", e)))?;
        filter = filter.add_directive(directive);
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
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(
    addr: SocketAddr,
    control_plane: Arc<ControlPlane>,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let control_plane = control_plane.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let control_plane = control_plane.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" => {
                            if control_plane.ready().await {
                                text_response(StatusCode::OK, "ok")
                            } else {
                                text_response(StatusCode::SERVICE_UNAVAILABLE, "not ready")
                            }
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind health server: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: SocketAddr,
    registry: Registry,
    shutdown: CancellationToken,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    if req.uri().path() != "/metrics" {
                        return Ok::<_, std::convert::Infallible>(text_response(
                            StatusCode::NOT_FOUND,
                            "not found",
                        ));
                    }

                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
                        error!("Failed to encode metrics: {}", e);
                        return Ok(text_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "metrics unavailable",
                        ));
                    }

                    let mut response = Response::new(Body::from(buffer));
                    if let Ok(value) = encoder.format_type().parse() {
                        response
                            .headers_mut()
                            .insert(hyper::header::CONTENT_TYPE, value);
                    }
                    Ok(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
