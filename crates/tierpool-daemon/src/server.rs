//! HTTP server implementation using Axum.

use crate::handler::{handle_health, handle_rpc};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tierpool_core::TierEngine;
use tokio::sync::oneshot;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Admin requests served at once; cycles and reconciles are heavy.
const MAX_CONCURRENT_REQUESTS: usize = 16;

/// Application state shared across handlers.
pub struct AppState {
    pub engine: TierEngine,
}

/// Router with `/health` and `/rpc`.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/rpc", post(handle_rpc))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Handle to a running admin server.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            error!("Admin server task failed: {}", e);
        }
    }
}

/// Start the JSON-RPC HTTP server.
///
/// Returns once the listener is bound; `port` 0 picks a free port.
pub async fn start_server(engine: TierEngine, host: &str, port: u16) -> anyhow::Result<ServerHandle> {
    let app = build_router(Arc::new(AppState { engine }));

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;
    info!("Admin server listening on {}", actual_addr);

    let (tx, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let serve = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = rx.await;
        });
        if let Err(e) = serve.await {
            error!("Admin server error: {}", e);
        }
    });

    Ok(ServerHandle {
        addr: actual_addr,
        shutdown: Some(tx),
        task,
    })
}
