//! HTTP exposition of the metrics registry for the dispatcher loop.

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use super::prometheus::metrics_handler;
use crate::scheduler::shutdown::Shutdown;

/// Serves `GET /metrics` until shutdown.
pub struct MetricsServer {
    listener: TcpListener,
}

impl MetricsServer {
    /// Binds the listener. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves in the background; the task ends once `shutdown` fires.
    pub fn spawn(self, mut shutdown: Shutdown) -> JoinHandle<std::io::Result<()>> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(address = %addr, "Serving metrics");
        }
        tokio::spawn(async move {
            axum::serve(self.listener, router())
                .with_graceful_shutdown(async move { shutdown.requested().await })
                .await
        })
    }
}

fn router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}
