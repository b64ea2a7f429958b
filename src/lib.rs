//! Dedicated multiplayer server for a track-racing simulator: paired TCP/UDP
//! transport, session state machine, lap/race rule enforcement, plugin event bus,
//! and an external lobby HTTP client.

pub mod checksum;
pub mod codec;
pub mod config;
pub mod data;
pub mod dynamic_track;
pub mod handlers;
pub mod http_server;
pub mod lobby;
pub mod plugin;
pub mod protocol;
pub mod results;
pub mod rng;
pub mod server_state;
pub mod session;
pub mod transport;
pub mod weather;
