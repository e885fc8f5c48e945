//! WebSocket host for the session relay.
//!
//! The request path names the session (`/13579`); the root path asks for a
//! new one. Every text frame a client sends is relayed to the other members
//! of its session, and relay notifications go back as JSON text frames.

use super::Relay;
use crate::config::RelayConfig;
use crate::error::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

pub struct RelayServer {
    listener: TcpListener,
    relay: Relay,
}

impl RelayServer {
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let relay = Relay::with_directory(config.named_sessions);
        info!(addr = %listener.local_addr()?, "relay listening");
        Ok(Self { listener, relay })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// Accepts connections until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let relay = self.relay.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, relay).await {
                                warn!(%addr, "connection ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("accept failed: {}", e),
                },
            }
        }
        Ok(())
    }
}

/// Session id carried by a request path, if any.
fn requested_session(path: &str) -> Option<String> {
    let raw = path.trim_start_matches('/');
    let raw = raw.strip_prefix("%23").unwrap_or(raw);
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

async fn handle_connection(stream: TcpStream, relay: Relay) -> Result<()> {
    let addr = stream.peer_addr()?;
    let mut path = String::new();
    let ws = accept_hdr_async(
        stream,
        |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
            path = req.uri().path().to_string();
            Ok(resp)
        },
    )
    .await?;

    let mut handle = relay.connect(requested_session(&path).as_deref());
    info!(%addr, session = %handle.session_id(), "websocket participant connected");

    let (mut sink, mut source) = ws.split();
    loop {
        tokio::select! {
            event = handle.recv() => match event {
                Some(event) => {
                    let text = serde_json::to_string(&event)?;
                    sink.send(Message::Text(text)).await?;
                }
                None => break,
            },
            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let payload = serde_json::from_str::<Value>(&text)
                        .unwrap_or_else(|_| Value::String(text));
                    handle.relay(payload)?;
                }
                Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => {
                    debug!(%addr, "websocket closed by client");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(%addr, "websocket error: {}", e);
                    break;
                }
            },
        }
    }

    handle.leave();
    let _ = sink.close().await;
    Ok(())
}
