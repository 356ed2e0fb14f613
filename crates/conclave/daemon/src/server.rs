//! Server setup and lifecycle management

use std::sync::Arc;

use conclave_substrate::{Substrate, SubstrateConfig};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::api::{create_router, AppState};
use crate::error::{DaemonError, DaemonResult};

/// Conclave daemon server
pub struct Server {
    substrate: Arc<Substrate>,
}

impl Server {
    pub async fn new(config: SubstrateConfig) -> DaemonResult<Self> {
        let substrate = Arc::new(Substrate::open(config).await?);
        Ok(Self { substrate })
    }

    pub fn substrate(&self) -> &Arc<Substrate> {
        &self.substrate
    }

    /// Serve until Ctrl+C or SIGTERM, then stop the substrate loops.
    pub async fn run(self) -> DaemonResult<()> {
        let addr = self.substrate.config().server.listen_addr;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let loops = self.substrate.spawn(shutdown_rx);
        let app = create_router(AppState::new(self.substrate.clone()));

        let listener = TcpListener::bind(addr).await?;
        tracing::info!(%addr, "Conclave daemon listening");

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| DaemonError::Server(e.to_string()));

        tracing::info!("Conclave daemon shutting down");
        // Receivers only go away if every loop already ended.
        let _ = shutdown_tx.send(true);
        loops.join().await;

        served
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
