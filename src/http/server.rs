//! HTTP server with graceful shutdown.

use std::future::Future;
use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{BulwarkError, Result};

/// A bound HTTP listener waiting to serve a router.
pub struct HttpServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl HttpServer {
    /// Bind to `addr`. Port 0 picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve `router` until `signal` resolves, then drain in-flight requests.
    ///
    /// Peer addresses are exposed to handlers and middleware as
    /// `ConnectInfo<SocketAddr>`.
    pub async fn serve_with_shutdown<F>(self, router: Router, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            BulwarkError::Io(e)
        })?;

        info!(addr = %self.addr, "HTTP server stopped");
        Ok(())
    }
}
