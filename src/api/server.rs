//! API Server
//!
//! HTTP + WebSocket front end for the arena service.

use super::{
    handlers::AppState,
    middleware::{create_cors_layer, request_id_middleware},
    routes::create_router,
};
use crate::config::ServerConfig;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

pub struct ApiServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(config: ServerConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Serve until Ctrl-C / SIGTERM
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        let app = self.create_app();
        let addr = self.get_socket_addr()?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Arena server listening on http://{}", addr);
        self.log_server_info();

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("Arena server stopped gracefully");
        Ok(())
    }

    /// Router with the middleware stack applied
    pub fn create_app(&self) -> axum::Router {
        create_router(self.state.clone())
            // Request ID middleware (first for tracing)
            .layer(axum::middleware::from_fn(request_id_middleware))
            // CORS layer (before timeout to handle preflight)
            .layer(create_cors_layer(&self.config.allowed_origins))
            .layer(TimeoutLayer::new(Duration::from_secs(self.config.request_timeout_secs)))
            .layer(TraceLayer::new_for_http())
    }

    fn get_socket_addr(&self) -> Result<SocketAddr, Box<dyn std::error::Error>> {
        Ok(SocketAddr::from((
            self.config.host.parse::<std::net::IpAddr>()?,
            self.config.port,
        )))
    }

    fn log_server_info(&self) {
        info!("   CORS: {:?}", self.config.allowed_origins);
        info!("   Request timeout: {}s", self.config.request_timeout_secs);
        info!(
            "   Realtime rate limit: {}/s (burst {})",
            self.config.messages_per_second, self.config.message_burst
        );
        info!("Available endpoints:");
        info!("   GET  /health                 - Health check");
        info!("   GET  /metrics                - Prometheus metrics");
        info!("   GET  /leaderboard/:game_id   - Validated top scores");
        info!("   GET  /sessions/:session_id   - Session audit record");
        info!("   GET  /rooms/:room_id         - Live or archived room");
        info!("   GET  /ws?player_id=...       - Realtime gateway");
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    info!("Starting graceful shutdown...");
}
