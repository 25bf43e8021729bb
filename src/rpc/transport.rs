//! Newline-delimited JSON-RPC over TCP. One task per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::methods::MethodHandler;
use super::protocol::{Request, Response};

pub struct Transport {
    bind_addr: SocketAddr,
    handler: Arc<MethodHandler>,
}

impl Transport {
    pub fn new(bind_addr: SocketAddr, handler: Arc<MethodHandler>) -> Self {
        Self { bind_addr, handler }
    }

    /// Accept connections until `shutdown` fires.
    pub async fn listen(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "RPC server listening");

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Client connected");
                            let handler = self.handler.clone();
                            let shutdown = shutdown.clone();
                            tokio::spawn(async move {
                                tokio::select! {
                                    result = handle_connection(stream, peer_addr, handler) => {
                                        if let Err(e) = result {
                                            debug!(peer = %peer_addr, error = %e, "Connection error");
                                        }
                                    }
                                    _ = shutdown.cancelled() => {}
                                }
                                debug!(peer = %peer_addr, "Client disconnected");
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("RPC server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Parse, validate and dispatch one JSON-RPC message. `None` means the
/// message was a notification and nothing should be sent back.
pub(crate) async fn dispatch(handler: &MethodHandler, text: &str) -> Option<Response> {
    let request = match serde_json::from_str::<Request>(text) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Parse error");
            return Some(Response::parse_error());
        }
    };

    if let Err(msg) = request.validate() {
        warn!(error = msg, "Invalid request");
        let id = request.id.clone().unwrap_or(serde_json::Value::Null);
        return Some(Response::invalid_request(id));
    }

    if request.is_notification() {
        debug!(method = %request.method, "Notification received");
        handler.handle(request).await;
        return None;
    }

    Some(handler.handle(request).await)
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<MethodHandler>,
) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let Some(response) = dispatch(&handler, trimmed).await else {
            continue;
        };
        if let Some(error) = &response.error {
            debug!(peer = %peer_addr, code = error.code, "Request rejected");
        }

        let mut response_json = serde_json::to_string(&response)?;
        response_json.push('\n');
        writer.write_all(response_json.as_bytes()).await?;
    }

    Ok(())
}
