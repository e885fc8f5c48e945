//! `webrtc` backend of the peer transport.

use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::logger::dump_selected_pair;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::data_channel::{attach_dc, RtcChannel};
use crate::peer::transport::{PeerTransport, TransportEvent, TransportFactory, TransportLink};
use crate::peer::types::{
    ConnectionState, IceCandidate, SdpType, ServerConfig, SessionDescription, SignalingState,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

type EventTx = mpsc::UnboundedSender<TransportEvent<RtcChannel>>;

/// Builds `webrtc` peer connections sharing one media engine.
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<ServerConfig>,
}

impl WebRtcFactory {
    pub fn new(config: &PeerConfig) -> Result<Self> {
        config.validate()?;

        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
        })
    }
}

#[async_trait]
impl TransportFactory for WebRtcFactory {
    type Transport = WebRtcTransport;

    async fn create(&self) -> Result<TransportLink<WebRtcTransport>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config(&self.ice_servers))
                .await?,
        );
        let (tx, rx) = mpsc::unbounded_channel();
        wire_handlers(&pc, &tx);
        info!(servers = self.ice_servers.len(), "peer connection created");

        Ok(TransportLink {
            transport: Arc::new(WebRtcTransport {
                pc,
                events: tx,
                local_tracks: Mutex::new(HashMap::new()),
            }),
            events: rx,
        })
    }
}

fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn wire_handlers(pc: &Arc<RTCPeerConnection>, events: &EventTx) {
    pc.on_negotiation_needed(Box::new({
        let events = events.clone();
        move || {
            let _ = events.send(TransportEvent::NegotiationNeeded);
            Box::pin(async {})
        }
    }));

    pc.on_ice_candidate(Box::new({
        let events = events.clone();
        move |cand: Option<RTCIceCandidate>| {
            let candidate = match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => Some(IceCandidate::from(init)),
                    Err(err) => {
                        warn!(%err, "dropping unserializable local candidate");
                        return Box::pin(async {});
                    }
                },
                None => None,
            };
            let _ = events.send(TransportEvent::IceCandidate(candidate));
            Box::pin(async {})
        }
    }));

    pc.on_track(Box::new({
        let events = events.clone();
        move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                _ => TrackKind::Video,
            };
            let _ = events.send(TransportEvent::Track(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
            }));
            Box::pin(async {})
        }
    }));

    pc.on_data_channel(Box::new({
        let events = events.clone();
        move |dc: Arc<RTCDataChannel>| {
            debug!(label = dc.label(), "remote data channel announced");
            attach_dc(&dc, events.clone());
            let _ = events.send(TransportEvent::DataChannel(Arc::new(RtcChannel::new(dc))));
            Box::pin(async {})
        }
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!(?state, "ice gathering state changed");
        Box::pin(async {})
    }));

    let weak = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new({
        let events = events.clone();
        move |st: RTCPeerConnectionState| {
            info!(state = ?st, "peer connection state changed");
            if st == RTCPeerConnectionState::Failed {
                if let Some(pc) = weak.upgrade() {
                    tokio::spawn(async move {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    });
                }
            }
            let _ = events.send(TransportEvent::ConnectionState(connection_state(st)));
            Box::pin(async {})
        }
    }));
}

fn connection_state(st: RTCPeerConnectionState) -> ConnectionState {
    match st {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn signaling_state(st: RTCSignalingState) -> SignalingState {
    match st {
        RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
    }
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(Error::Transport("description has no type".into()));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback.sdp = desc.sdp;
            rollback
        }
    };
    Ok(rtc)
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: EventTx,
    local_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
}

impl WebRtcTransport {
    /// Sample writer of an attached local track, for the capture provider.
    pub fn local_track(&self, id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().get(id).cloned()
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    async fn rollback_local_offer(&self) -> Result<()> {
        let sdp = self
            .pc
            .local_description()
            .await
            .map(|d| d.sdp)
            .unwrap_or_default();
        debug!("rolling back local offer for incoming offer");
        self.pc
            .set_local_description(to_rtc(SessionDescription {
                kind: SdpType::Rollback,
                sdp,
            })?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    type Channel = RtcChannel;

    async fn set_local_description(&self) -> Result<SessionDescription> {
        let description = match self.signaling_state() {
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer => {
                self.create_answer().await?
            }
            _ => self.create_offer().await?,
        };
        self.apply_local_description(description.clone()).await?;
        Ok(description)
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn apply_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if description.kind == SdpType::Offer
            && self.signaling_state() == SignalingState::HaveLocalOffer
        {
            self.rollback_local_offer().await?;
        }
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| Error::Candidate(e.to_string()))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let mime_type = match track.kind {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id.clone(),
            track.stream_id.clone(),
        ));
        self.pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        self.local_tracks.lock().insert(track.id.clone(), local);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<RtcChannel>> {
        let dc = self
            .pc
            .create_data_channel(label, Some(RTCDataChannelInit::default()))
            .await?;
        attach_dc(&dc, self.events.clone());
        Ok(Arc::new(RtcChannel::new(dc)))
    }

    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.and_then(|d| from_rtc(d).ok())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        self.pc.remote_description().await.and_then(|d| from_rtc(d).ok())
    }

    async fn close(&self) -> Result<()> {
        if let Err(err) = self.pc.close().await {
            error!(%err, "failed to close peer connection");
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_servers_carry_credentials() {
        let servers = ice_servers(&[
            ServerConfig::from_url("a", "stun.example.org:19302"),
            ServerConfig::from_url("b", "turn:alice:secret@turn.example.org:3478"),
        ]);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:19302".to_string()]);
        assert_eq!(servers[1].username, "alice");
        assert_eq!(servers[1].credential, "secret");
    }

    #[test]
    fn rtc_config_uses_bundle_and_mux() {
        let config = rtc_config(&[]);
        assert_eq!(config.ice_candidate_pool_size, 10);
        assert_eq!(config.bundle_policy, RTCBundlePolicy::MaxBundle);
        assert_eq!(config.rtcp_mux_policy, RTCRtcpMuxPolicy::Require);
    }

    #[test]
    fn maps_connection_states() {
        assert_eq!(
            connection_state(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert_eq!(
            connection_state(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
    }

    #[tokio::test]
    async fn fresh_connection_is_stable_without_descriptions() {
        let factory = WebRtcFactory::new(&PeerConfig::default()).unwrap();
        let link = factory.create().await.unwrap();
        assert_eq!(link.transport.signaling_state(), SignalingState::Stable);
        assert!(link.transport.local_description().await.is_none());
        link.transport.close().await.unwrap();
    }
}
