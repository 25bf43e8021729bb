//! JSON-RPC 2.0 control surface.
//!
//! - `protocol`: request, response and notification types plus error codes
//! - `transport`: TCP listener with newline-delimited JSON framing
//! - `methods`: method dispatcher and handlers
//! - `client`: client used by the CLI subcommands
//!
//! The web dashboard reuses the same dispatcher over WebSocket.

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{
    INTERNAL_ERROR, INVALID_DOMAIN_REQUEST, INVALID_PARAMS, JOB_ACTIVE, NO_ACTIVE_JOB, NOT_CLEARED,
    NOT_FOUND, Notification, Request, Response, RpcError, VOLUME_UNAVAILABLE, VOLUMES_BUSY,
};
pub(crate) use transport::dispatch;

pub struct RpcServer {
    transport: Transport,
    shutdown: CancellationToken,
}

impl RpcServer {
    pub fn new(handler: Arc<MethodHandler>, bind_addr: SocketAddr, shutdown: CancellationToken) -> Self {
        Self {
            transport: Transport::new(bind_addr, handler),
            shutdown,
        }
    }

    /// Runs until the shutdown token is cancelled.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.transport.listen(self.shutdown.clone()).await
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
