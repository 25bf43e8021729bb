//! Embedded web dashboard.
//!
//! - `GET /` serves the single-page dashboard
//! - `WS /ws` speaks the same JSON-RPC as the TCP server and pushes a
//!   `transfer.progress` notification on connect and on every change

mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, response::Html, routing::get};
use tokio_util::sync::CancellationToken;

use crate::rpc::MethodHandler;

const INDEX_HTML: &str = include_str!("assets/index.html");

#[derive(Clone)]
pub struct WebState {
    pub handler: Arc<MethodHandler>,
}

pub struct WebServer {
    bind_addr: SocketAddr,
    state: WebState,
    shutdown: CancellationToken,
}

impl WebServer {
    pub fn new(handler: Arc<MethodHandler>, bind_addr: SocketAddr, shutdown: CancellationToken) -> Self {
        Self {
            bind_addr,
            state: WebState { handler },
            shutdown,
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(serve_index))
            .route("/ws", get(websocket::ws_handler))
            .with_state(self.state.clone())
    }

    /// Runs until the shutdown token is cancelled.
    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "Web dashboard listening");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn serve_index() -> Html<&'static str> {
    Html(INDEX_HTML)
}
