//! HTTP server hosting the gated router.

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{GateError, Result};

/// HTTP server for a gated application router.
pub struct GateServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The application, with the gate already layered on
    router: Router,
}

impl GateServer {
    /// Create a new server.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self { addr, router }
    }

    /// Start the server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending::<()>()).await
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// returns once in-flight requests have completed.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            GateError::Io(e)
        })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Starting HTTP server");

        // Connection info feeds client identification by peer address.
        let service = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, service)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                GateError::Io(e)
            })
    }
}
