// Runtime configuration for the relay host and for one participant.
// Logging is on by default in debug builds only; release builds install a
// subscriber only when a level is requested explicitly.

use crate::error::{Error, Result};
use crate::media::MediaConstraints;
use crate::peer::types::ServerConfig;
use once_cell::sync::Lazy;
use std::net::SocketAddr;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

#[cfg(debug_assertions)]
pub mod dev {
    /// Default filter for debug builds
    pub const DEFAULT_LOG_LEVEL: &str = "debug";
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const DEFAULT_LOG_LEVEL: &str = "info";
}

/// Default bind address of the relay host
pub const DEFAULT_BIND: &str = "127.0.0.1:3000";

/// Label of the auxiliary data channel
pub const DEFAULT_CHANNEL_LABEL: &str = "text chat";

/// Public STUN servers used when none are configured
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Settings of the session relay host.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: SocketAddr,
    /// Names of sessions created at start-up and announced to every
    /// participant that connects without a session id
    pub named_sessions: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND.parse().unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 3000))),
            named_sessions: Vec::new(),
        }
    }
}

/// Settings of one participant's negotiation engine.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub channel_label: String,
    pub media: MediaConstraints,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            media: MediaConstraints::default(),
        }
    }
}

impl PeerConfig {
    /// Rejects empty URLs and TURN entries without credentials.
    pub fn validate(&self) -> Result<()> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(Error::Transport(format!(
                    "ICE server {:?} has an empty url",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
                return Err(Error::Transport(format!(
                    "TURN server {:?} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }

    /// Builds ICE server entries from bare URLs such as `stun:host:3478`
    /// or `turn:user:pass@host:3478`.
    pub fn with_ice_urls(mut self, urls: &[String]) -> Self {
        if urls.is_empty() {
            return self;
        }
        self.ice_servers = urls
            .iter()
            .enumerate()
            .map(|(i, url)| ServerConfig::from_url(format!("ice-{i}"), url))
            .collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_peer_config_is_valid() {
        let config = PeerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channel_label, "text chat");
        assert!(config.media.video);
        assert!(!config.media.audio);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let config = PeerConfig::default().with_ice_urls(&["turn:relay.example.org:3478".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn turn_with_credentials_is_accepted() {
        let config =
            PeerConfig::default().with_ice_urls(&["turn:alice:secret@relay.example.org:3478".to_string()]);
        assert!(config.validate().is_ok());
        assert_eq!(config.ice_servers[0].username.as_deref(), Some("alice"));
    }
}
