//! Message handlers (component 4.8): TCP and UDP opcode dispatch tables.

pub mod tcp;
pub mod udp;

use crate::checksum::ChecksumManager;
use crate::config::ServerConfig;
use crate::dynamic_track::DynamicTrack;
use crate::plugin::PluginBus;
use crate::server_state::ServerState;
use crate::session::SessionManager;
use crate::weather::WeatherManager;
use std::sync::Arc;

/// Everything a handler needs to act on a message, bundled so the dispatch tables
/// don't carry a dozen separate Arc clones through every call.
#[derive(Clone)]
pub struct HandlerContext {
    pub state: Arc<ServerState>,
    pub session: Arc<SessionManager>,
    pub dynamic_track: Arc<DynamicTrack>,
    pub weather: Arc<WeatherManager>,
    pub checksums: Arc<ChecksumManager>,
    pub plugins: Arc<PluginBus>,
    pub config: Arc<ServerConfig>,
}
