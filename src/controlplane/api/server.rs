//! API Server
//!
//! Serves the REST router until shutdown is signalled.

use crate::config::ServerConfig;
use crate::controlplane::metrics::ControlPlaneMetrics;
use crate::controlplane::ControlPlane;
use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::rest::RestRouter;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Seconds clients should wait before polling an accepted operation
    pub retry_after_secs: u64,
    /// Max request body size
    pub max_body_size: usize,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ApiServerConfig {
    fn from(server: &ServerConfig) -> Self {
        Self {
            rest_addr: server.rest_addr,
            retry_after_secs: server.retry_after_secs,
            max_body_size: server.max_body_size,
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

pub struct ApiServer {
    config: ApiServerConfig,
    control_plane: Arc<ControlPlane>,
    metrics: Arc<ControlPlaneMetrics>,
    shutdown: CancellationToken,
}

impl ApiServer {
    pub fn new(
        config: ApiServerConfig,
        control_plane: Arc<ControlPlane>,
        metrics: Arc<ControlPlaneMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            control_plane,
            metrics,
            shutdown,
        }
    }

    /// Run the REST server until the shutdown token is cancelled
    pub async fn run(self) -> Result<()> {
        let app = RestRouter::new(self.control_plane, self.metrics)
            .with_retry_after(self.config.retry_after_secs)
            .with_max_body_size(self.config.max_body_size)
            .build();

        let listener = tokio::net::TcpListener::bind(self.config.rest_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        info!("REST API listening on {}", self.config.rest_addr);

        let shutdown = self.shutdown;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }
}
