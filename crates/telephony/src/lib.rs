//! Telephony control plane client.
//!
//! The only crate that talks to the TC: a REST request surface
//! ([`AriClient`]) and a durable event WebSocket reader ([`EventReader`])
//! with exponential-backoff reconnect and post-reconnect channel resync.

mod client;
mod reader;
mod wire;

pub use client::{AriClient, AriConfig};
pub use reader::{ConnectionState, EventReader, LiveChannels, ReaderConfig, TcFeed};
pub use wire::parse_event;
