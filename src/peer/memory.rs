//! In-process transport.
//!
//! `MemoryTransport` models the signaling state machine of a browser peer
//! connection (offer/answer, implicit rollback, negotiation-needed after local
//! changes, trickled candidates) without any network. Transports created from
//! the same `MemoryNetwork` reach each other: data channels negotiated by one
//! side appear on the other, and tracks listed in a remote description are
//! announced as received tracks. Used by the test-suite and for simulations.

use crate::error::{Error, Result};
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::transport::{
    DataChannel, PeerTransport, TransportEvent, TransportFactory, TransportLink,
};
use crate::peer::types::{
    ConnectionState, IceCandidate, SdpType, SessionDescription, SignalingState,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::trace;

type EventTx = mpsc::UnboundedSender<TransportEvent<MemoryChannel>>;

/// Shared medium linking the transports created from it.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

#[derive(Default)]
struct NetworkInner {
    next_id: u64,
    endpoints: Vec<(u64, EventTx)>,
    delay_channel_open: bool,
    held_channels: Vec<(EventTx, Weak<MemoryChannel>)>,
    refuse_transports: bool,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> MemoryFactory {
        MemoryFactory {
            network: self.clone(),
        }
    }

    /// Number of transports currently attached (not yet closed).
    pub fn live_endpoints(&self) -> usize {
        self.inner.lock().endpoints.len()
    }

    /// Announces remote data channels while they are still connecting. They
    /// open on [`Self::open_held_channels`].
    pub fn delay_channel_open(&self, delay: bool) {
        self.inner.lock().delay_channel_open = delay;
    }

    /// Opens every channel held back by [`Self::delay_channel_open`] and
    /// notifies its owner. Returns how many were opened.
    pub fn open_held_channels(&self) -> usize {
        let held = std::mem::take(&mut self.inner.lock().held_channels);
        let mut opened = 0;
        for (events, channel) in held {
            let Some(channel) = channel.upgrade() else {
                continue;
            };
            if !channel.open.swap(true, Ordering::Relaxed) {
                opened += 1;
                let _ = events.send(TransportEvent::ChannelOpen {
                    label: channel.label.clone(),
                });
            }
        }
        opened
    }

    /// Makes the factory fail to build new transports.
    pub fn refuse_transports(&self, refuse: bool) {
        self.inner.lock().refuse_transports = refuse;
    }

    fn register(&self, events: EventTx) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.endpoints.push((id, events));
        id
    }

    fn deregister(&self, id: u64) {
        self.inner.lock().endpoints.retain(|(eid, _)| *eid != id);
    }

    /// Hands every other endpoint its end of a channel just negotiated by `from`.
    fn announce_channel(&self, from: u64, label: &str) {
        let mut inner = self.inner.lock();
        let open = !inner.delay_channel_open;
        let mut held = Vec::new();
        for (id, tx) in inner.endpoints.iter().filter(|(id, _)| *id != from) {
            let channel = Arc::new(MemoryChannel::new(label, *id, self.clone(), open));
            if !open {
                held.push((tx.clone(), Arc::downgrade(&channel)));
            }
            let _ = tx.send(TransportEvent::DataChannel(channel));
        }
        inner.held_channels.extend(held);
    }

    /// Delivers an event to every live endpoint other than `from`.
    fn deliver_from(&self, from: u64, make: impl Fn(u64) -> TransportEvent<MemoryChannel>) {
        let inner = self.inner.lock();
        for (id, tx) in inner.endpoints.iter().filter(|(id, _)| *id != from) {
            let _ = tx.send(make(*id));
        }
    }
}

#[derive(Clone)]
pub struct MemoryFactory {
    network: MemoryNetwork,
}

#[async_trait]
impl TransportFactory for MemoryFactory {
    type Transport = MemoryTransport;

    async fn create(&self) -> Result<TransportLink<MemoryTransport>> {
        if self.network.inner.lock().refuse_transports {
            return Err(Error::Transport("transport construction refused".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.network.register(tx.clone());
        let transport = MemoryTransport {
            id,
            network: self.network.clone(),
            events: tx,
            inner: Mutex::new(Inner::default()),
            fail_implicit: AtomicBool::new(false),
            fail_explicit: AtomicBool::new(false),
        };
        Ok(TransportLink {
            transport: Arc::new(transport),
            events: rx,
        })
    }
}

/// Data channel of a `MemoryTransport`.
#[derive(Debug)]
pub struct MemoryChannel {
    label: String,
    owner: u64,
    open: AtomicBool,
    network: MemoryNetwork,
    sent: Mutex<Vec<String>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("live_endpoints", &self.live_endpoints())
            .finish()
    }
}

impl MemoryChannel {
    fn new(label: &str, owner: u64, network: MemoryNetwork, open: bool) -> Self {
        Self {
            label: label.to_string(),
            owner,
            open: AtomicBool::new(open),
            network,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Every payload this end put on the wire, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    async fn send_text(&self, text: &str) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Transport(format!(
                "data channel {:?} is not open",
                self.label
            )));
        }
        self.sent.lock().push(text.to_string());
        let label = self.label.clone();
        let text = text.to_string();
        self.network
            .deliver_from(self.owner, |_| TransportEvent::ChannelMessage {
                label: label.clone(),
                text: text.clone(),
            });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::Relaxed) {
            let label = self.label.clone();
            self.network
                .deliver_from(self.owner, |_| TransportEvent::ChannelClose {
                    label: label.clone(),
                });
        }
        Ok(())
    }
}

/// Snapshot of local media carried by an offer.
#[derive(Debug, Clone, Copy)]
struct OfferContent {
    media_version: u64,
    channels: usize,
}

#[derive(Debug)]
struct Inner {
    signaling: SignalingState,
    connection: ConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    stable_local: Option<SessionDescription>,
    sdp_version: u64,
    media_version: u64,
    negotiated_version: u64,
    prepared: Option<OfferContent>,
    offered: Option<OfferContent>,
    negotiation_pending: bool,
    tracks: Vec<LocalTrack>,
    channels: Vec<Arc<MemoryChannel>>,
    seen_remote_tracks: HashSet<String>,
    remote_candidates: Vec<IceCandidate>,
    gathered: bool,
    closed: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            local: None,
            remote: None,
            stable_local: None,
            sdp_version: 0,
            media_version: 0,
            negotiated_version: 0,
            prepared: None,
            offered: None,
            negotiation_pending: false,
            tracks: Vec::new(),
            channels: Vec::new(),
            seen_remote_tracks: HashSet::new(),
            remote_candidates: Vec::new(),
            gathered: false,
            closed: false,
        }
    }
}

pub struct MemoryTransport {
    id: u64,
    network: MemoryNetwork,
    events: EventTx,
    inner: Mutex<Inner>,
    fail_implicit: AtomicBool,
    fail_explicit: AtomicBool,
}

impl MemoryTransport {
    /// Makes the implicit `set_local_description` fail, forcing the explicit
    /// construction path.
    pub fn fail_implicit_descriptions(&self, fail: bool) {
        self.fail_implicit.store(fail, Ordering::Relaxed);
    }

    /// Makes explicit offer/answer construction fail as well.
    pub fn fail_explicit_descriptions(&self, fail: bool) {
        self.fail_explicit.store(fail, Ordering::Relaxed);
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().remote_candidates.clone()
    }

    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        self.inner.lock().tracks.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().connection
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn emit(&self, event: TransportEvent<MemoryChannel>) {
        let _ = self.events.send(event);
    }

    fn ensure_open(inner: &Inner) -> Result<()> {
        if inner.closed {
            Err(Error::Transport("peer connection is closed".into()))
        } else {
            Ok(())
        }
    }

    fn render_sdp(&self, inner: &mut Inner, kind: SdpType) -> String {
        inner.sdp_version += 1;
        let mut sdp = format!(
            "v=0\r\no=memory-{} {} IN IP4 127.0.0.1\r\ns={}\r\n",
            self.id, inner.sdp_version, kind
        );
        for track in &inner.tracks {
            let kind = match track.kind {
                TrackKind::Audio => "audio",
                TrackKind::Video => "video",
            };
            sdp.push_str(&format!("a=track:{} {} {}\r\n", track.id, kind, track.stream_id));
        }
        for channel in &inner.channels {
            sdp.push_str(&format!("a=channel:{}\r\n", channel.label));
        }
        sdp
    }

    fn mark_dirty(&self, inner: &mut Inner) {
        inner.media_version += 1;
        if inner.signaling == SignalingState::Stable && !inner.negotiation_pending {
            inner.negotiation_pending = true;
            self.emit(TransportEvent::NegotiationNeeded);
        }
    }

    fn gather(&self, inner: &mut Inner) {
        if inner.gathered {
            return;
        }
        inner.gathered = true;
        self.emit(TransportEvent::IceCandidate(Some(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.id,
                40000 + self.id
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        })));
        self.emit(TransportEvent::IceCandidate(None));
    }

    fn announce_remote_tracks(&self, inner: &mut Inner, sdp: &str) {
        for line in sdp.lines() {
            let Some(rest) = line.strip_prefix("a=track:") else {
                continue;
            };
            let mut parts = rest.split_whitespace();
            let (Some(id), Some(kind), Some(stream_id)) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            if !inner.seen_remote_tracks.insert(id.to_string()) {
                continue;
            }
            let kind = if kind == "audio" { TrackKind::Audio } else { TrackKind::Video };
            self.emit(TransportEvent::Track(RemoteTrack {
                id: id.to_string(),
                stream_id: stream_id.to_string(),
                kind,
            }));
        }
    }

    fn rollback(inner: &mut Inner) {
        inner.signaling = SignalingState::Stable;
        inner.local = inner.stable_local.clone();
        inner.offered = None;
    }

    fn settle(&self, inner: &mut Inner) {
        inner.stable_local = inner.local.clone();
        if inner.connection != ConnectionState::Connected
            && inner.local.is_some()
            && inner.remote.is_some()
        {
            inner.connection = ConnectionState::Connected;
            self.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
        }
        if inner.media_version > inner.negotiated_version && !inner.negotiation_pending {
            inner.negotiation_pending = true;
            self.emit(TransportEvent::NegotiationNeeded);
        }
    }

    fn open_offered_channels(&self, inner: &mut Inner, offered: OfferContent) {
        for channel in inner.channels.iter().take(offered.channels) {
            if channel.open.swap(true, Ordering::Relaxed) {
                continue;
            }
            self.emit(TransportEvent::ChannelOpen {
                label: channel.label.clone(),
            });
            self.network.announce_channel(self.id, &channel.label);
        }
    }

    fn build_offer(&self) -> Result<SessionDescription> {
        if self.fail_explicit.load(Ordering::Relaxed) {
            return Err(Error::Transport("offer construction failed".into()));
        }
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        let sdp = self.render_sdp(&mut inner, SdpType::Offer);
        inner.prepared = Some(OfferContent {
            media_version: inner.media_version,
            channels: inner.channels.len(),
        });
        inner.negotiation_pending = false;
        Ok(SessionDescription::offer(sdp))
    }

    fn build_answer(&self) -> Result<SessionDescription> {
        if self.fail_explicit.load(Ordering::Relaxed) {
            return Err(Error::Transport("answer construction failed".into()));
        }
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        if inner.signaling != SignalingState::HaveRemoteOffer {
            return Err(Error::Transport(format!(
                "cannot answer in state {:?}",
                inner.signaling
            )));
        }
        let sdp = self.render_sdp(&mut inner, SdpType::Answer);
        Ok(SessionDescription::answer(sdp))
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    type Channel = MemoryChannel;

    async fn set_local_description(&self) -> Result<SessionDescription> {
        if self.fail_implicit.load(Ordering::Relaxed) {
            return Err(Error::Transport(
                "implicit local description is not supported".into(),
            ));
        }
        let signaling = self.signaling_state();
        let description = match signaling {
            SignalingState::HaveRemoteOffer => self.build_answer()?,
            _ => self.build_offer()?,
        };
        self.apply_local_description(description.clone()).await?;
        Ok(description)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.build_offer()
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.build_answer()
    }

    async fn apply_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        match description.kind {
            SdpType::Offer => {
                if !matches!(
                    inner.signaling,
                    SignalingState::Stable | SignalingState::HaveLocalOffer
                ) {
                    return Err(Error::Transport(format!(
                        "cannot apply local offer in state {:?}",
                        inner.signaling
                    )));
                }
                inner.signaling = SignalingState::HaveLocalOffer;
                inner.offered = inner.prepared.take().or(Some(OfferContent {
                    media_version: inner.media_version,
                    channels: inner.channels.len(),
                }));
                inner.local = Some(description);
                self.gather(&mut inner);
            }
            SdpType::Answer | SdpType::Pranswer => {
                if inner.signaling != SignalingState::HaveRemoteOffer {
                    return Err(Error::Transport(format!(
                        "cannot apply local answer in state {:?}",
                        inner.signaling
                    )));
                }
                inner.signaling = SignalingState::Stable;
                inner.local = Some(description);
                self.gather(&mut inner);
                self.settle(&mut inner);
            }
            SdpType::Rollback => {
                if inner.signaling == SignalingState::HaveLocalOffer {
                    Self::rollback(&mut inner);
                }
            }
        }
        trace!(endpoint = self.id, state = ?inner.signaling, "local description applied");
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        match description.kind {
            SdpType::Offer => {
                if inner.signaling == SignalingState::HaveLocalOffer {
                    Self::rollback(&mut inner);
                }
                if inner.signaling != SignalingState::Stable {
                    return Err(Error::Transport(format!(
                        "cannot apply remote offer in state {:?}",
                        inner.signaling
                    )));
                }
                inner.signaling = SignalingState::HaveRemoteOffer;
                self.announce_remote_tracks(&mut inner, &description.sdp);
                inner.remote = Some(description);
            }
            SdpType::Answer | SdpType::Pranswer => {
                if inner.signaling != SignalingState::HaveLocalOffer {
                    return Err(Error::Transport(format!(
                        "cannot apply remote answer in state {:?}",
                        inner.signaling
                    )));
                }
                inner.signaling = SignalingState::Stable;
                self.announce_remote_tracks(&mut inner, &description.sdp);
                inner.remote = Some(description);
                if let Some(offered) = inner.offered.take() {
                    inner.negotiated_version = inner.negotiated_version.max(offered.media_version);
                    self.open_offered_channels(&mut inner, offered);
                }
                self.settle(&mut inner);
            }
            SdpType::Rollback => {
                return Err(Error::Transport("remote rollback is not supported".into()));
            }
        }
        trace!(endpoint = self.id, state = ?inner.signaling, "remote description applied");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        if inner.remote.is_none() {
            return Err(Error::Transport(
                "remote description is not set".into(),
            ));
        }
        inner.remote_candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        inner.tracks.push(track.clone());
        self.mark_dirty(&mut inner);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<MemoryChannel>> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        let channel = Arc::new(MemoryChannel::new(label, self.id, self.network.clone(), false));
        inner.channels.push(Arc::clone(&channel));
        self.mark_dirty(&mut inner);
        Ok(channel)
    }

    fn signaling_state(&self) -> SignalingState {
        self.inner.lock().signaling
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().local.clone()
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().remote.clone()
    }

    async fn close(&self) -> Result<()> {
        let channels = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            inner.signaling = SignalingState::Closed;
            inner.connection = ConnectionState::Closed;
            std::mem::take(&mut inner.channels)
        };
        for channel in channels {
            channel.close().await?;
        }
        self.network.deregister(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair() -> (TransportLink<MemoryTransport>, TransportLink<MemoryTransport>) {
        let network = MemoryNetwork::new();
        let factory = network.factory();
        (factory.create().await.unwrap(), factory.create().await.unwrap())
    }

    #[tokio::test]
    async fn offer_answer_reaches_stable() {
        let (a, b) = pair().await;
        let offer = a.transport.set_local_description().await.unwrap();
        assert_eq!(a.transport.signaling_state(), SignalingState::HaveLocalOffer);

        b.transport.set_remote_description(offer.clone()).await.unwrap();
        assert_eq!(b.transport.signaling_state(), SignalingState::HaveRemoteOffer);
        let answer = b.transport.set_local_description().await.unwrap();
        assert_eq!(answer.kind, SdpType::Answer);

        a.transport.set_remote_description(answer.clone()).await.unwrap();
        assert_eq!(a.transport.signaling_state(), SignalingState::Stable);
        assert_eq!(b.transport.signaling_state(), SignalingState::Stable);
        assert_eq!(a.transport.local_description().await, Some(offer.clone()));
        assert_eq!(b.transport.remote_description().await, Some(offer));
        assert_eq!(a.transport.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn remote_offer_rolls_back_local_offer() {
        let (a, b) = pair().await;
        a.transport.set_local_description().await.unwrap();
        let offer = b.transport.set_local_description().await.unwrap();
        a.transport.set_remote_description(offer).await.unwrap();
        assert_eq!(a.transport.signaling_state(), SignalingState::HaveRemoteOffer);
    }

    #[tokio::test]
    async fn adding_a_track_requests_negotiation() {
        let (mut a, _b) = pair().await;
        a.transport
            .add_track(&LocalTrack::new(TrackKind::Video, "s"))
            .await
            .unwrap();
        assert!(matches!(
            a.events.recv().await,
            Some(TransportEvent::NegotiationNeeded)
        ));
    }

    #[tokio::test]
    async fn candidates_need_a_remote_description() {
        let (a, _b) = pair().await;
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 9 typ host".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        assert!(a.transport.add_ice_candidate(candidate).await.is_err());
    }

    #[tokio::test]
    async fn channel_refuses_sends_before_open() {
        let (a, _b) = pair().await;
        let channel = a.transport.create_data_channel("chat").await.unwrap();
        assert!(channel.send_text("early").await.is_err());
        assert!(channel.sent().is_empty());
    }

    #[tokio::test]
    async fn close_detaches_from_network() {
        let network = MemoryNetwork::new();
        let link = network.factory().create().await.unwrap();
        assert_eq!(network.live_endpoints(), 1);
        link.transport.close().await.unwrap();
        assert_eq!(network.live_endpoints(), 0);
        assert!(link.transport.is_closed());
    }

    #[tokio::test]
    async fn refused_factory_builds_nothing() {
        let network = MemoryNetwork::new();
        network.refuse_transports(true);
        assert!(network.factory().create().await.is_err());
        assert_eq!(network.live_endpoints(), 0);
    }
}
