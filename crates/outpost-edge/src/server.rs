//! Edge HTTP surface
//!
//! One listener carries three routes: `/health`, the control-channel
//! endpoint at `/connect`, and the catch-all that tunnels everything else.

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::manager::TunnelManager;
use crate::{channel, forward, DEFAULT_EDGE_PORT, DEFAULT_REQUEST_TIMEOUT};

#[derive(Debug, Error)]
pub enum EdgeServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Edge server configuration
#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub bind_addr: SocketAddr,
    /// Absolute deadline applied to every in-flight request
    pub request_timeout: Duration,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_EDGE_PORT)),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Shared state for the axum handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<TunnelManager>,
    pub request_timeout: Duration,
}

/// Build the edge router over the given state
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(outpost_proto::HEALTH_PATH, get(health_handler))
        .route(outpost_proto::CONNECT_PATH, get(channel::connect_handler))
        .fallback(forward::forward_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// `GET /health`
async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let tunnel = state.manager.status().await;
    Json(json!({
        "status": "ok",
        "tunnel": tunnel,
    }))
}

/// Edge server: listener plus the tunnel slot it multiplexes onto
pub struct EdgeServer {
    config: EdgeConfig,
    manager: Arc<TunnelManager>,
}

impl EdgeServer {
    pub fn new(config: EdgeConfig) -> Self {
        Self {
            config,
            manager: Arc::new(TunnelManager::new()),
        }
    }

    pub fn manager(&self) -> Arc<TunnelManager> {
        self.manager.clone()
    }

    /// Bind and serve until the process is signaled.
    ///
    /// Shutdown closes the listener and lets outstanding requests end
    /// naturally within axum's graceful-shutdown window.
    pub async fn start(self) -> Result<(), EdgeServerError> {
        let state = AppState {
            manager: self.manager,
            request_timeout: self.config.request_timeout,
        };
        let router = build_router(state);

        let listener =
            TcpListener::bind(self.config.bind_addr)
                .await
                .map_err(|e| EdgeServerError::Bind {
                    addr: self.config.bind_addr,
                    source: e,
                })?;
        info!("Edge server listening on {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received shutdown signal, closing listener");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EdgeConfig::default();
        assert_eq!(config.bind_addr.port(), DEFAULT_EDGE_PORT);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }
}
