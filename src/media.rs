//! Track descriptors exchanged between the engine, the capture provider and
//! the renderer. Device access itself lives outside this crate.

use crate::utils::random_id;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Which kinds of local media to request from the capture provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: false,
            video: true,
        }
    }
}

/// Outbound track attached to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: impl Into<String>) -> Self {
        Self {
            id: random_id(),
            stream_id: stream_id.into(),
            kind,
        }
    }

    /// One track per requested kind, all in a single fresh stream.
    pub fn from_constraints(constraints: &MediaConstraints) -> Vec<Self> {
        let stream_id = random_id();
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Self::new(TrackKind::Audio, stream_id.clone()));
        }
        if constraints.video {
            tracks.push(Self::new(TrackKind::Video, stream_id));
        }
        tracks
    }
}

/// Inbound track announced by the transport, pushed to the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}
