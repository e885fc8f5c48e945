//! WebSocket connection from a participant to a remote relay host.

use crate::error::{Error, Result};
use crate::session::SessionId;
use crate::signaling::{RelayEvent, SignalingChannel};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub struct WsSignaling {
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    incoming: mpsc::UnboundedReceiver<RelayEvent>,
    reader: JoinHandle<()>,
}

/// `<relay_url>/<id>`, or the root path when no id is known yet.
pub fn session_url(relay_url: &str, session: Option<&SessionId>) -> String {
    let base = relay_url.trim_end_matches('/');
    match session {
        Some(id) => format!("{base}/{id}"),
        None => format!("{base}/"),
    }
}

impl WsSignaling {
    pub async fn connect(relay_url: &str, session: Option<&SessionId>) -> Result<Self> {
        let url = session_url(relay_url, session);
        let (ws, _) = connect_async(url.as_str()).await?;
        info!(%url, "connected to relay");

        let (mut sink, mut source) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    warn!("relay write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<RelayEvent>(&text) {
                        Ok(event) => {
                            if in_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("unreadable relay frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("relay read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("relay reader finished");
        });

        Ok(Self {
            outgoing: Some(out_tx),
            incoming: in_rx,
            reader,
        })
    }
}

#[async_trait]
impl SignalingChannel for WsSignaling {
    async fn send(&self, payload: Value) -> Result<()> {
        let text = serde_json::to_string(&payload)?;
        self.outgoing
            .as_ref()
            .ok_or(Error::ChannelClosed)?
            .send(Message::Text(text))?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<RelayEvent> {
        self.incoming.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(tx) = self.outgoing.take() {
            let _ = tx.send(Message::Close(None));
        }
        self.incoming.close();
        Ok(())
    }
}

impl Drop for WsSignaling {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_session_urls() {
        let id = SessionId::parse("04211").unwrap();
        assert_eq!(session_url("ws://host:3000", Some(&id)), "ws://host:3000/04211");
        assert_eq!(session_url("ws://host:3000/", None), "ws://host:3000/");
    }
}
