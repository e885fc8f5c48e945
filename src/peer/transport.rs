//! Subscription/dispatch interface to the underlying peer transport.
//!
//! A transport never calls back into the engine. Every notification it
//! produces is pushed into the `events` queue handed out by its factory, and
//! the engine is the single consumer of that queue.

use crate::error::Result;
use crate::media::{LocalTrack, RemoteTrack};
use crate::peer::types::{ConnectionState, IceCandidate, SessionDescription, SignalingState};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Notifications emitted by a transport.
#[derive(Debug)]
pub enum TransportEvent<C> {
    /// Local media or channel state changed and must be advertised
    NegotiationNeeded,
    /// A local candidate was discovered; `None` marks the end of gathering
    IceCandidate(Option<IceCandidate>),
    Track(RemoteTrack),
    /// The remote side opened a data channel; it may not be open yet
    DataChannel(Arc<C>),
    ChannelOpen { label: String },
    ChannelMessage { label: String, text: String },
    ChannelClose { label: String },
    ConnectionState(ConnectionState),
}

/// Auxiliary message channel carried by the peer connection.
#[async_trait]
pub trait DataChannel: Send + Sync + 'static {
    fn label(&self) -> &str;

    /// True once the channel can carry text. A channel announced by the
    /// remote side may still be connecting.
    fn is_open(&self) -> bool;

    async fn send_text(&self, text: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// One underlying peer connection.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    type Channel: DataChannel;

    /// Creates and applies the description the current signaling state calls
    /// for (offer when stable, answer when a remote offer is pending).
    async fn set_local_description(&self) -> Result<SessionDescription>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn apply_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Applies a remote description. An incoming offer while a local offer is
    /// pending rolls the local offer back first.
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<Self::Channel>>;

    fn signaling_state(&self) -> SignalingState;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    async fn close(&self) -> Result<()>;
}

pub type TransportEvents<C> = mpsc::UnboundedReceiver<TransportEvent<C>>;

/// A fresh transport together with its event subscription.
pub struct TransportLink<T: PeerTransport> {
    pub transport: Arc<T>,
    pub events: TransportEvents<T::Channel>,
}

/// Builds fresh transports; used on start-up and whenever the peer is reset.
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: PeerTransport;

    async fn create(&self) -> Result<TransportLink<Self::Transport>>;
}
