//! Signaling wire types and the channel seam between a participant and the
//! session relay.

use crate::error::Result;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::SessionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Notification delivered by the relay to one session member.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RelayEvent {
    /// Id allocated for a participant that connected without one
    Session { id: SessionId },
    /// Relay-created sessions, by name
    Directory { sessions: BTreeMap<String, SessionId> },
    /// Another participant joined; the receiver becomes polite
    ConnectedPeer,
    /// Another participant left
    DisconnectedPeer,
    /// Opaque payload relayed from another member
    Signal { data: Value },
}

/// Negotiation payload carried inside `RelayEvent::Signal`.
///
/// Serialized as `{"description": ...}` or `{"candidate": ...}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SignalPayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalPayload {
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }
}

/// One participant's connection to the session relay.
#[async_trait]
pub trait SignalingChannel: Send + Sync + 'static {
    /// Relays `payload` to the other members of the session.
    async fn send(&self, payload: Value) -> Result<()>;

    /// Next relay notification; `None` once the channel is closed.
    async fn recv(&mut self) -> Option<RelayEvent>;

    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relay_events_are_tagged() {
        assert_eq!(
            serde_json::to_value(RelayEvent::ConnectedPeer).unwrap(),
            json!({"event": "connected-peer"})
        );
        assert_eq!(
            serde_json::to_value(RelayEvent::Signal { data: json!({"x": 1}) }).unwrap(),
            json!({"event": "signal", "data": {"x": 1}})
        );
        let parsed: RelayEvent =
            serde_json::from_value(json!({"event": "session", "id": "04211"})).unwrap();
        assert_eq!(
            parsed,
            RelayEvent::Session {
                id: SessionId::parse("04211").unwrap()
            }
        );
    }

    #[test]
    fn payload_shapes() {
        let desc = SignalPayload::Description(SessionDescription::offer("v=0"));
        assert_eq!(
            desc.to_value().unwrap(),
            json!({"description": {"type": "offer", "sdp": "v=0"}})
        );

        let cand = SignalPayload::from_value(json!({
            "candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 9 typ host", "sdpMid": "0"}
        }))
        .unwrap();
        assert!(matches!(cand, SignalPayload::Candidate(c) if c.sdp_mid.as_deref() == Some("0")));
    }

    #[test]
    fn payload_rejects_unknown_shapes() {
        assert!(SignalPayload::from_value(json!({"hello": "world"})).is_err());
        assert!(SignalPayload::from_value(json!("plain text")).is_err());
    }
}
