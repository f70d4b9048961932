mod receivers;
mod routes;

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{config::Config, metrics::Metrics, Error, Result};

pub use receivers::{AlertManagerAlert, AlertManagerPayload, PayloadError};
pub use routes::{AlertError, ExecutionResponse, MAX_BODY_BYTES, TOKEN_HEADER};

/// Read-only state shared by every request.
pub struct AppState {
    pub config: Config,
    pub metrics: Metrics,
}

pub struct Server {
    state: Arc<AppState>,
}

impl Server {
    pub fn new(config: Config, metrics: Metrics) -> Self {
        Self {
            state: Arc::new(AppState { config, metrics }),
        }
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/healthz", get(routes::health))
            .route("/alert", post(routes::receive_alert))
            .route("/metrics", get(routes::metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the configured address and serve until Ctrl-C or SIGTERM.
    pub async fn start(self) -> Result<()> {
        let addr = self.state.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Server(format!("failed to bind {addr}: {e}")))?;

        info!(addr = %addr, "http server starting");

        axum::serve(
            listener,
            self.build_router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Server(format!("http server error: {e}")))?;

        info!("http server stopped cleanly");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
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

    info!("shutdown signal received");
}
