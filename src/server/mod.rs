//! HTTP and WebSocket surface over the control plane.

pub mod api;
pub mod ws;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::orchestrator::ControlPlane;
use api::{AppState, SharedState};

/// Configuration for the HTTP server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub dev_mode: bool,
    /// How long shutdown waits for child processes to exit.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            dev_mode: false,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: SharedState, dev_mode: bool) -> Router {
    let app = api::api_router()
        .route("/ws", get(ws::ws_handler))
        .with_state(state);
    if dev_mode {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Serve on an already bound listener until `shutdown` resolves, then stop
/// every process and flush the project snapshot.
pub async fn serve<F>(
    listener: TcpListener,
    plane: Arc<ControlPlane>,
    config: &ServerConfig,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = Arc::new(AppState {
        plane: Arc::clone(&plane),
    });
    let app = build_router(state, config.dev_mode);

    plane.start_background();
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "devplane listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error");

    plane.shutdown(config.shutdown_grace).await?;
    info!("Server shut down gracefully");
    served
}

/// Bind the configured address and serve until Ctrl+C or SIGTERM.
pub async fn start_server(config: ServerConfig, plane: Arc<ControlPlane>) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    serve(listener, plane, &config, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutting down...");
}
