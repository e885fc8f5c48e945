use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a session description.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
            SdpType::Pranswer => "pranswer",
            SdpType::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// One side's proposed session parameters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickled ICE candidate, in the browser's JSON shape.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// ICE server entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl ServerConfig {
    /// Parses `stun:host:port` or `turn:user:pass@host:port`.
    pub fn from_url(id: impl Into<String>, raw: &str) -> Self {
        let (scheme, rest) = match raw.split_once(':') {
            Some((scheme, rest)) if matches!(scheme, "stun" | "stuns" | "turn" | "turns") => (scheme, rest),
            _ => ("stun", raw),
        };
        let kind = if scheme.starts_with("turn") { "turn" } else { "stun" };

        let (username, credential, host) = match rest.rsplit_once('@') {
            Some((auth, host)) => {
                let (user, pass) = match auth.split_once(':') {
                    Some((u, p)) => (Some(u.to_string()), Some(p.to_string())),
                    None => (Some(auth.to_string()), None),
                };
                (user, pass, host)
            }
            None => (None, None, rest),
        };

        Self {
            id: id.into(),
            r#type: kind.to_string(),
            url: format!("{scheme}:{host}"),
            username,
            credential,
        }
    }
}

/// Mirror of the transport's signaling state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

/// Mirror of the transport's aggregate connection state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Lifecycle of one peer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerLifecycle {
    New,
    /// A local or remote description is in flight
    Negotiating,
    /// The last description exchange settled
    Stable,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_uses_browser_shape() {
        let json = serde_json::to_value(SessionDescription::offer("v=0")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "offer", "sdp": "v=0"}));
    }

    #[test]
    fn candidate_uses_browser_field_names() {
        let c: IceCandidate = serde_json::from_value(serde_json::json!({
            "candidate": "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }))
        .unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_mline_index, Some(0));
        assert_eq!(c.username_fragment, None);
    }

    #[test]
    fn server_config_from_turn_url_with_credentials() {
        let s = ServerConfig::from_url("t", "turn:alice:secret@turn.example.org:3478");
        assert_eq!(s.r#type, "turn");
        assert_eq!(s.url, "turn:turn.example.org:3478");
        assert_eq!(s.username.as_deref(), Some("alice"));
        assert_eq!(s.credential.as_deref(), Some("secret"));
    }

    #[test]
    fn server_config_from_bare_host() {
        let s = ServerConfig::from_url("s", "stun.example.org:19302");
        assert_eq!(s.r#type, "stun");
        assert_eq!(s.url, "stun:stun.example.org:19302");
        assert!(s.username.is_none());
    }
}
