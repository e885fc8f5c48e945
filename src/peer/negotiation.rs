//! The negotiation engine: drives one peer transport through description and
//! candidate exchange, resolving offer collisions with the polite/impolite
//! roles handed out by the relay.
//!
//! Every input (transport notification, relay event, local command) is taken
//! from a single queue and handled to completion before the next one, so the
//! role flags in [`NegotiationState`] never see concurrent writers.

use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::logger::dump_candidate;
use crate::media::{LocalTrack, RemoteTrack};
use crate::peer::data_channel::MessageChannel;
use crate::peer::ice::analyze_candidates;
use crate::peer::state::{DescriptionVerdict, NegotiationState, HANDSHAKE_SENTINEL};
use crate::peer::transport::{
    PeerTransport, TransportEvent, TransportEvents, TransportFactory, TransportLink,
};
use crate::peer::types::{
    ConnectionState, IceCandidate, PeerLifecycle, SdpType, SessionDescription, SignalingState,
};
use crate::session::SessionId;
use crate::signaling::{RelayEvent, SignalPayload, SignalingChannel};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

type TransportOf<F> = <F as TransportFactory>::Transport;
type ChannelOf<F> = <TransportOf<F> as PeerTransport>::Channel;

/// Local requests accepted through a [`PeerHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    Send(String),
    AddTrack(LocalTrack),
    Leave,
}

/// Notifications pushed to the host (the renderer side).
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// The relay allocated this id; the host should keep it for rejoining
    SessionAssigned(SessionId),
    Directory(BTreeMap<String, SessionId>),
    PeerJoined,
    /// The remote participant left and the transport was rebuilt
    PeerLeft,
    Track(RemoteTrack),
    Message(String),
    /// Sent text is waiting for the data-channel handshake; carries the
    /// queue length
    Queued(usize),
    ConnectionState(ConnectionState),
    /// A transition failed; the engine keeps running
    Error(String),
    Closed,
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

/// One unit of work for the engine.
#[derive(Debug)]
pub enum Input<C> {
    Transport(TransportEvent<C>),
    /// `None` once the signaling channel is gone
    Relay(Option<RelayEvent>),
    /// `None` once every [`PeerHandle`] was dropped
    Command(Option<PeerCommand>),
}

/// Cloneable command side of a running engine.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    commands: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        if text == HANDSHAKE_SENTINEL {
            return Err(Error::ReservedPayload);
        }
        self.command(PeerCommand::Send(text))
    }

    pub fn add_track(&self, track: LocalTrack) -> Result<()> {
        self.command(PeerCommand::AddTrack(track))
    }

    pub fn leave(&self) -> Result<()> {
        self.command(PeerCommand::Leave)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn command(&self, command: PeerCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::PeerClosed)
    }
}

pub struct Negotiator<F: TransportFactory, S: SignalingChannel> {
    factory: F,
    signaling: S,
    config: PeerConfig,
    transport: Arc<TransportOf<F>>,
    transport_events: TransportEvents<ChannelOf<F>>,
    state: NegotiationState,
    channel: MessageChannel<ChannelOf<F>>,
    tracks: Vec<LocalTrack>,
    local_candidates: Vec<IceCandidate>,
    lifecycle: PeerLifecycle,
    commands: mpsc::UnboundedReceiver<PeerCommand>,
    commands_open: bool,
    signaling_open: bool,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl<F, S> Negotiator<F, S>
where
    F: TransportFactory,
    S: SignalingChannel,
{
    /// Builds the engine around a fresh transport and attaches one local
    /// track per kind requested in `config.media`.
    pub async fn new(factory: F, signaling: S, config: PeerConfig) -> Result<(Self, PeerHandle, PeerEvents)> {
        config.validate()?;
        let TransportLink { transport, events } = factory.create().await?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut negotiator = Self {
            factory,
            signaling,
            transport,
            transport_events: events,
            state: NegotiationState::new(),
            channel: MessageChannel::new(),
            tracks: Vec::new(),
            local_candidates: Vec::new(),
            lifecycle: PeerLifecycle::New,
            commands: command_rx,
            commands_open: true,
            signaling_open: true,
            events: event_tx,
            config,
        };
        for track in LocalTrack::from_constraints(&negotiator.config.media) {
            negotiator.add_track(track).await?;
        }

        Ok((negotiator, PeerHandle { commands: command_tx }, event_rx))
    }

    pub fn transport(&self) -> &Arc<TransportOf<F>> {
        &self.transport
    }

    pub fn state(&self) -> &NegotiationState {
        &self.state
    }

    pub fn lifecycle(&self) -> PeerLifecycle {
        self.lifecycle
    }

    pub fn signaling(&self) -> &S {
        &self.signaling
    }

    /// Handles inputs until the peer is closed.
    pub async fn run(&mut self) {
        while let Some(input) = self.next_input().await {
            if !self.handle(input).await {
                break;
            }
        }
        debug!("negotiation loop finished");
    }

    /// Waits for the next input. Cancel-safe. Returns `None` when no input
    /// can arrive anymore.
    pub async fn next_input(&mut self) -> Option<Input<ChannelOf<F>>> {
        tokio::select! {
            biased;
            command = self.commands.recv(), if self.commands_open => Some(Input::Command(command)),
            event = self.signaling.recv(), if self.signaling_open => Some(Input::Relay(event)),
            Some(event) = self.transport_events.recv() => Some(Input::Transport(event)),
            else => None,
        }
    }

    /// Runs one input to completion. Failures are logged and reported as
    /// [`PeerEvent::Error`]. Returns false once the peer is closed.
    pub async fn handle(&mut self, input: Input<ChannelOf<F>>) -> bool {
        let result = match input {
            Input::Transport(event) => self.on_transport_event(event).await,
            Input::Relay(Some(event)) => self.on_relay_event(event).await,
            Input::Relay(None) => {
                info!("signaling channel closed");
                self.signaling_open = false;
                self.shutdown().await
            }
            Input::Command(Some(command)) => self.on_command(command).await,
            Input::Command(None) => {
                self.commands_open = false;
                Ok(())
            }
        };
        if let Err(err) = result {
            error!(polite = self.state.is_polite(), "negotiation step failed: {}", err);
            self.emit(PeerEvent::Error(err.to_string()));
        }
        self.lifecycle != PeerLifecycle::Closed
    }

    async fn on_command(&mut self, command: PeerCommand) -> Result<()> {
        match command {
            PeerCommand::Send(text) => self.send_text(text).await,
            PeerCommand::AddTrack(track) => self.add_track(track).await,
            PeerCommand::Leave => self.leave().await,
        }
    }

    /// Builds and sends an offer. Skipped while another offer is being built
    /// or a description exchange is already in flight. A skipped trigger is
    /// not replayed here: both transports raise negotiation-needed again once
    /// they return to stable with local changes still unadvertised.
    pub async fn on_negotiation_needed(&mut self) -> Result<()> {
        if self.lifecycle == PeerLifecycle::Closed {
            return Err(Error::PeerClosed);
        }
        let signaling = self.transport.signaling_state();
        if signaling != SignalingState::Stable {
            debug!(?signaling, "negotiation deferred until stable");
            return Ok(());
        }
        let Some(_making_offer) = self.state.begin_offer() else {
            debug!("offer already in progress");
            return Ok(());
        };

        let offer = self.local_description().await?;
        self.lifecycle = PeerLifecycle::Negotiating;
        debug!(polite = self.state.is_polite(), kind = %offer.kind, "sending local description");
        self.send_payload(SignalPayload::Description(offer)).await
    }

    /// Handles a relayed `signal` payload.
    pub async fn on_signal(&mut self, data: Value) -> Result<()> {
        let payload = match SignalPayload::from_value(data) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("dropping unrecognised signal: {}", err);
                return Ok(());
            }
        };
        match payload {
            SignalPayload::Description(description) => self.on_remote_description(description).await,
            SignalPayload::Candidate(candidate) => self.on_remote_candidate(candidate).await,
        }
    }

    async fn on_remote_description(&mut self, description: SessionDescription) -> Result<()> {
        let kind = description.kind;
        let polite = self.state.is_polite();
        let verdict = self
            .state
            .evaluate_description(kind, self.transport.signaling_state());
        if verdict == DescriptionVerdict::Ignore {
            debug!(polite, %kind, "ignoring colliding offer");
            return Ok(());
        }

        if kind == SdpType::Answer {
            let _pending = self.state.begin_remote_answer();
            self.transport.set_remote_description(description).await?;
        } else {
            self.transport.set_remote_description(description).await?;
        }

        if kind == SdpType::Offer {
            let answer = self.local_description().await?;
            self.send_payload(SignalPayload::Description(answer)).await?;
        }
        self.refresh_lifecycle();
        debug!(polite, %kind, lifecycle = ?self.lifecycle, "remote description applied");
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        match self.transport.add_ice_candidate(candidate).await {
            Ok(()) => Ok(()),
            Err(err) if self.state.is_ignoring_offer() => {
                debug!("candidate of an ignored offer dropped: {}", err);
                Ok(())
            }
            Err(err @ Error::Candidate(_)) => Err(err),
            Err(err) => Err(Error::Candidate(err.to_string())),
        }
    }

    pub async fn on_relay_event(&mut self, event: RelayEvent) -> Result<()> {
        match event {
            RelayEvent::Session { id } => {
                info!(session = %id, "session allocated by relay");
                self.emit(PeerEvent::SessionAssigned(id));
            }
            RelayEvent::Directory { sessions } => {
                self.emit(PeerEvent::Directory(sessions));
            }
            RelayEvent::ConnectedPeer => {
                self.state.set_polite(true);
                info!(polite = true, "peer joined the session");
                self.emit(PeerEvent::PeerJoined);
                // An offer made while alone reached nobody.
                if self.transport.signaling_state() == SignalingState::HaveLocalOffer {
                    if let Some(offer) = self.transport.local_description().await {
                        self.send_payload(SignalPayload::Description(offer)).await?;
                    }
                }
            }
            RelayEvent::DisconnectedPeer => self.reset_peer().await?,
            RelayEvent::Signal { data } => self.on_signal(data).await?,
        }
        Ok(())
    }

    pub async fn on_transport_event(&mut self, event: TransportEvent<ChannelOf<F>>) -> Result<()> {
        match event {
            TransportEvent::NegotiationNeeded => self.on_negotiation_needed().await?,
            TransportEvent::IceCandidate(Some(candidate)) => {
                dump_candidate("local", &candidate);
                self.local_candidates.push(candidate.clone());
                self.send_payload(SignalPayload::Candidate(candidate)).await?;
            }
            TransportEvent::IceCandidate(None) => {
                analyze_candidates(&self.local_candidates);
            }
            TransportEvent::Track(track) => {
                info!(kind = ?track.kind, id = %track.id, "remote track received");
                self.emit(PeerEvent::Track(track));
            }
            TransportEvent::DataChannel(channel) => self.channel.accept_remote(channel).await?,
            TransportEvent::ChannelOpen { label } => {
                debug!(%label, "data channel open");
                self.channel.opened(&label).await?;
            }
            TransportEvent::ChannelMessage { text, .. } => {
                if let Some(text) = self.channel.receive(text).await? {
                    self.emit(PeerEvent::Message(text));
                }
            }
            TransportEvent::ChannelClose { label } => self.channel.closed(&label),
            TransportEvent::ConnectionState(state) => {
                info!(?state, "connection state changed");
                self.emit(PeerEvent::ConnectionState(state));
                if state == ConnectionState::Failed {
                    warn!("connection failed permanently");
                    self.shutdown().await?;
                }
            }
        }
        Ok(())
    }

    /// Sends `text` over the data channel, opening it first when this side
    /// is the impolite one. Text sent before the handshake completes is
    /// queued.
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        if self.lifecycle == PeerLifecycle::Closed {
            return Err(Error::PeerClosed);
        }
        if !self.channel.has_channel() && !self.state.is_polite() {
            let channel = self
                .transport
                .create_data_channel(&self.config.channel_label)
                .await?;
            self.channel.opened_locally(channel);
        }
        self.channel.send(text).await?;
        let pending = self.channel.pending_len();
        if pending > 0 {
            debug!(pending, polite = self.state.is_polite(), "text queued until the channel handshake");
            self.emit(PeerEvent::Queued(pending));
        }
        Ok(())
    }

    /// Text accepted by [`Self::send_text`] that has not gone out yet.
    pub fn pending_messages(&self) -> usize {
        self.channel.pending_len()
    }

    pub async fn add_track(&mut self, track: LocalTrack) -> Result<()> {
        if self.lifecycle == PeerLifecycle::Closed {
            return Err(Error::PeerClosed);
        }
        self.transport.add_track(&track).await?;
        debug!(kind = ?track.kind, id = %track.id, "local track added");
        self.tracks.push(track);
        Ok(())
    }

    /// Closes the data channel, the transport and the signaling channel.
    pub async fn leave(&mut self) -> Result<()> {
        info!("leaving session");
        self.shutdown().await
    }

    /// Produces and applies the local description the signaling state calls
    /// for, constructing it explicitly when the implicit path fails.
    async fn local_description(&self) -> Result<SessionDescription> {
        match self.transport.set_local_description().await {
            Ok(description) => Ok(description),
            Err(err) => {
                debug!("implicit local description failed, building it explicitly: {}", err);
                let description = match self.transport.signaling_state() {
                    SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer => {
                        self.transport.create_answer().await?
                    }
                    _ => self.transport.create_offer().await?,
                };
                self.transport
                    .apply_local_description(description.clone())
                    .await?;
                Ok(description)
            }
        }
    }

    async fn send_payload(&self, payload: SignalPayload) -> Result<()> {
        self.signaling.send(payload.to_value()?).await
    }

    /// Replaces the transport after the remote participant left. The
    /// signaling channel stays open for the next joiner.
    async fn reset_peer(&mut self) -> Result<()> {
        info!("peer left, rebuilding transport");
        if let Err(err) = self.channel.close().await {
            debug!("closing data channel: {}", err);
        }
        if let Err(err) = self.transport.close().await {
            debug!("closing transport: {}", err);
        }

        self.channel = MessageChannel::new();
        self.local_candidates.clear();
        self.state.reset();
        self.lifecycle = PeerLifecycle::New;

        let TransportLink { transport, events } = match self.factory.create().await {
            Ok(link) => link,
            Err(err) => {
                error!("transport rebuild failed, closing: {}", err);
                self.emit(PeerEvent::PeerLeft);
                if let Err(close_err) = self.shutdown().await {
                    debug!("closing after failed rebuild: {}", close_err);
                }
                return Err(err);
            }
        };
        self.transport = transport;
        self.transport_events = events;

        for track in &self.tracks {
            self.transport.add_track(track).await?;
        }
        self.emit(PeerEvent::PeerLeft);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if self.lifecycle == PeerLifecycle::Closed {
            return Ok(());
        }
        self.lifecycle = PeerLifecycle::Closed;
        self.commands.close();
        let channel = self.channel.close().await;
        let transport = self.transport.close().await;
        let signaling = self.signaling.close().await;
        info!("peer closed");
        self.emit(PeerEvent::Closed);
        channel.and(transport).and(signaling)
    }

    fn refresh_lifecycle(&mut self) {
        if self.lifecycle == PeerLifecycle::Closed {
            return;
        }
        self.lifecycle = match self.transport.signaling_state() {
            SignalingState::Stable => PeerLifecycle::Stable,
            SignalingState::Closed => self.lifecycle,
            _ => PeerLifecycle::Negotiating,
        };
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }
}
