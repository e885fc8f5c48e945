//! Session addressing.
//!
//! A session is named by a 5-digit decimal code. The keyspace is small
//! (100 000 values) and generated codes are not checked against live
//! sessions, so two unrelated participants can land in the same group.

use crate::error::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const SESSION_ID_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(String);

impl SessionId {
    /// Samples a fresh 5-digit code (leading zeros allowed).
    pub fn generate() -> Self {
        let n: u32 = rand::rng().random_range(0..100_000);
        Self(format!("{n:05}"))
    }

    /// Accepts `12345` or a location fragment such as `#12345`.
    pub fn parse(raw: &str) -> Option<Self> {
        let code = raw.strip_prefix('#').unwrap_or(raw);
        if code.len() == SESSION_ID_LEN && code.bytes().all(|b| b.is_ascii_digit()) {
            Some(Self(code.to_string()))
        } else {
            None
        }
    }

    /// Reuses a requested code when it is well formed, otherwise allocates a
    /// new one. The flag tells whether the code was freshly allocated and
    /// should be handed back to the participant.
    pub fn resolve(requested: Option<&str>) -> (Self, bool) {
        match requested.and_then(Self::parse) {
            Some(id) => (id, false),
            None => (Self::generate(), true),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| Error::InvalidSessionId(s.to_string()))
    }
}

impl TryFrom<String> for SessionId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SessionId> for String {
    fn from(id: SessionId) -> Self {
        id.0
    }
}
