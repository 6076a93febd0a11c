//! HTTP API layer (C11, C12): a thin read API over the canonical tables,
//! the SSE event stream, the call-upload acceptor, and the metrics scrape
//! route, all on one router.

use std::sync::Arc;

use thiserror::Error;

use crate::bootstrap::BootstrappedEngine;

pub mod http;

/// Errors that can occur when starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to a TCP port.
    #[error("failed to bind to port: {0}")]
    Bind(#[from] std::io::Error),
}

/// Shared application state for the API layer. A thin wrapper around the
/// bootstrapped engine; handlers delegate to its components rather than
/// holding any state of their own.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<BootstrappedEngine>,
    pub auth: AuthConfig,
}

/// Interface-only auth/rate-limit seam (§4.11): when disabled, the
/// extractor and limiter are pass-through. No credential store or limiter
/// algorithm is specified; enabling either is a loud, single extension
/// point rather than a full implementation.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub enabled: bool,
    pub token: Option<String>,
}

/// Starts the HTTP server bound to `addr`, draining in-flight connections
/// once `shutdown` resolves before returning.
pub async fn start_server(
    state: ApiState,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("http api listening on {addr}");
    let app = http::create_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
