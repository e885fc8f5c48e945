//! `pairlink` entry point.
//!
//! ```bash
//! # Host the relay, pre-creating two named rooms
//! pairlink relay --bind 0.0.0.0:3000 --room lobby --room games
//!
//! # Join session 13579 and chat over the data channel
//! pairlink chat --relay-url ws://localhost:3000 --session 13579
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use pairlink_lib::commands;
use pairlink_lib::config::{PeerConfig, RelayConfig, DEFAULT_BIND};
use pairlink_lib::logger;
use pairlink_lib::session::SessionId;
use std::net::SocketAddr;
use tracing::info;

/// Two-party session relay and perfect-negotiation peer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log filter (overridden by RUST_LOG)
    #[arg(long, global = true, env = "PAIRLINK_LOG")]
    log: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the session relay
    Relay {
        #[arg(long, default_value = DEFAULT_BIND, env = "PAIRLINK_BIND")]
        bind: SocketAddr,

        /// Named session announced to participants without a session id
        #[arg(long = "room")]
        rooms: Vec<String>,
    },
    /// Join a session and exchange text over the data channel
    Chat {
        #[arg(long, default_value = "ws://127.0.0.1:3000", env = "PAIRLINK_RELAY_URL")]
        relay_url: String,

        /// 5-digit session id, optionally prefixed with '#'
        #[arg(long, env = "PAIRLINK_SESSION")]
        session: Option<String>,

        /// ICE servers (comma-separated), e.g. stun:host:3478,turn:user:pass@host:3478
        #[arg(long, value_delimiter = ',', env = "PAIRLINK_ICE_SERVERS")]
        ice_servers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init(args.log.as_deref());

    match args.command {
        Command::Relay { bind, rooms } => {
            let config = RelayConfig {
                bind_addr: bind,
                named_sessions: rooms,
            };
            commands::relay::serve(config, async {
                let _ = tokio::signal::ctrl_c().await;
                info!("ctrl-c received");
            })
            .await
            .context("relay failed")?;
        }
        Command::Chat {
            relay_url,
            session,
            ice_servers,
        } => {
            let session = match session {
                Some(raw) => Some(
                    SessionId::parse(&raw)
                        .with_context(|| format!("{raw:?} is not a 5-digit session id"))?,
                ),
                None => None,
            };
            let config = PeerConfig::default().with_ice_urls(&ice_servers);
            config.validate().context("invalid ICE server configuration")?;
            commands::chat::chat(&relay_url, session, config)
                .await
                .context("chat failed")?;
        }
    }
    Ok(())
}
