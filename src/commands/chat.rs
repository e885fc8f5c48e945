//! Text chat over the data channel, one line of stdin per message.

use crate::config::PeerConfig;
use crate::error::Result;
use crate::peer::{Negotiator, PeerEvent, PeerEvents, PeerHandle, WebRtcFactory};
use crate::relay::client::WsSignaling;
use crate::session::SessionId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

pub async fn chat(relay_url: &str, session: Option<SessionId>, config: PeerConfig) -> Result<()> {
    let factory = WebRtcFactory::new(&config)?;
    let signaling = WsSignaling::connect(relay_url, session.as_ref()).await?;
    let (mut negotiator, handle, events) = Negotiator::new(factory, signaling, config).await?;
    if let Some(id) = &session {
        info!(session = %id, "joining session");
    }

    let engine = tokio::spawn(async move { negotiator.run().await });
    let printer = tokio::spawn(print_events(events));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.is_empty() {
            continue;
        }
        if let Err(err) = send_line(&handle, line) {
            warn!("message not sent: {}", err);
            if handle.is_closed() {
                break;
            }
        }
    }

    let _ = handle.leave();
    let _ = engine.await;
    let _ = printer.await;
    Ok(())
}

fn send_line(handle: &PeerHandle, line: String) -> Result<()> {
    match line.as_str() {
        "/leave" => handle.leave(),
        _ => handle.send_text(line),
    }
}

async fn print_events(mut events: PeerEvents) {
    let mut stdout = tokio::io::stdout();
    while let Some(event) = events.recv().await {
        let line = match event {
            PeerEvent::SessionAssigned(id) => format!("* session #{id}"),
            PeerEvent::Directory(sessions) => {
                let names: Vec<String> = sessions
                    .iter()
                    .map(|(name, id)| format!("{name}=#{id}"))
                    .collect();
                format!("* rooms: {}", names.join(", "))
            }
            PeerEvent::PeerJoined => "* peer joined".to_string(),
            PeerEvent::PeerLeft => "* peer left".to_string(),
            PeerEvent::Track(track) => format!("* receiving {:?} track {}", track.kind, track.id),
            PeerEvent::Message(text) => format!("> {text}"),
            PeerEvent::Queued(pending) => format!("* {pending} waiting for the peer's data channel"),
            PeerEvent::ConnectionState(state) => format!("* connection {state:?}"),
            PeerEvent::Error(err) => format!("! {err}"),
            PeerEvent::Closed => {
                let _ = stdout.write_all(b"* closed\n").await;
                break;
            }
        };
        if stdout.write_all(format!("{line}\n").as_bytes()).await.is_err() {
            break;
        }
    }
}
