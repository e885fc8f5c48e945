use thiserror::Error;

/// Errors raised by the relay and the negotiation engine.
///
/// None of these are fatal to the hosting process; the worst outcome is a
/// failed or degraded peer session.
#[derive(Debug, Error)]
pub enum Error {
    /// The supplied string is not a 5-digit session code
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    /// The underlying transport rejected an operation
    #[error("transport error: {0}")]
    Transport(String),

    /// Error surfaced by the `webrtc` crate
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    /// Signaling channel failure (relay unreachable, bad frame, ...)
    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A queue between two tasks was dropped on the other end
    #[error("channel closed")]
    ChannelClosed,

    /// The peer handle was closed by `leave` or permanent failure
    #[error("peer is closed")]
    PeerClosed,

    /// Application text collided with the data-channel handshake sentinel
    #[error("payload is reserved for the data-channel handshake")]
    ReservedPayload,

    /// A remote candidate could not be applied
    #[error("failed to apply remote candidate: {0}")]
    Candidate(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::ChannelClosed
    }
}
