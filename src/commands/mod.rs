//! Bodies of the `pairlink` subcommands.

pub mod chat;
pub mod relay;
