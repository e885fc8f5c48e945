pub mod connection;
pub mod data_channel;
pub mod ice;
pub mod memory;
pub mod negotiation;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{WebRtcFactory, WebRtcTransport};
pub use memory::{MemoryChannel, MemoryFactory, MemoryNetwork, MemoryTransport};
pub use negotiation::{Input, Negotiator, PeerCommand, PeerEvent, PeerEvents, PeerHandle};
pub use state::{NegotiationState, HANDSHAKE_SENTINEL};
pub use transport::{DataChannel, PeerTransport, TransportEvent, TransportFactory, TransportLink};
pub use types::{
    ConnectionState, IceCandidate, PeerLifecycle, SdpType, ServerConfig, SessionDescription,
    SignalingState,
};
