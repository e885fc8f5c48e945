pub mod commands;
pub mod config;
pub mod error;
pub mod logger;
pub mod media;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod utils;

pub use error::{Error, Result};
pub use relay::{Relay, SessionHandle};
pub use session::SessionId;
pub use signaling::{RelayEvent, SignalPayload, SignalingChannel};
