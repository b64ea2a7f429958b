//! Typed, TOML-backed configuration surface (§6 External Interfaces).
//!
//! Mirrors the original server's INI-based configuration field-for-field, but
//! loaded into a typed Rust tree rather than parsed ad hoc.

use crate::data::SessionKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server: ServerSettings,
    pub race: RaceConfig,
    pub dynamic_track: DynamicTrackConfig,
    pub weather: Vec<WeatherConfig>,
    pub entry_list: Vec<EntrantConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings::default(),
            race: RaceConfig::default(),
            dynamic_track: DynamicTrackConfig::default(),
            weather: Vec::new(),
            entry_list: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub name: String,
    pub password: String,
    pub admin_password: String,
    pub spectator_password: String,
    pub udp_port: u16,
    pub tcp_port: u16,
    pub register_to_lobby: bool,
    pub lobby_url: String,
    pub client_send_interval_hz: u16,
    pub kick_quorum: u8,
    pub voting_quorum: u8,
    pub vote_duration_seconds: u32,
    pub blacklist_mode: bool,
    pub welcome_message: String,
    pub max_clients: u8,
    pub checksum_files: Vec<String>,
    pub http_port: u16,
    pub results_dir: String,
    pub blocklist_file: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            name: "Unnamed server".into(),
            password: String::new(),
            admin_password: String::new(),
            spectator_password: String::new(),
            udp_port: 9600,
            tcp_port: 9600,
            register_to_lobby: true,
            lobby_url: "https://lobby.example.invalid/register".into(),
            client_send_interval_hz: 10,
            kick_quorum: 85,
            voting_quorum: 80,
            vote_duration_seconds: 20,
            blacklist_mode: false,
            welcome_message: String::new(),
            max_clients: 24,
            checksum_files: Vec::new(),
            http_port: 8081,
            results_dir: "results".into(),
            blocklist_file: "blocklist.txt".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    pub track: String,
    pub track_layout: String,
    pub sun_angle: f32,
    pub legal_tyres: Vec<String>,
    pub fuel_rate: f32,
    pub damage_multiplier: f32,
    pub tyre_wear_rate: f32,
    pub allowed_tyres_out: i32,
    pub abs_allowed: u8,
    pub traction_control_allowed: u8,
    pub stability_control_allowed: bool,
    pub auto_clutch_allowed: bool,
    pub tyre_blankets_allowed: bool,
    pub force_virtual_mirror: bool,
    pub race_pit_window_start: i32,
    pub race_pit_window_end: i32,
    pub reversed_grid_race_positions: i32,
    pub time_of_day_multiplier: f32,
    pub qualify_max_wait_percentage: u32,
    pub race_gas_penalty_disabled: bool,
    pub max_ballast_kg: f32,
    pub race_extra_lap: bool,
    pub race_over_time: u32,
    pub max_contacts_per_km: i32,
    pub result_screen_time: u32,
    pub pickup_mode_enabled: bool,
    pub locked_entry_list: bool,
    pub loop_mode: bool,
    pub max_clients: u8,
    pub sessions: Vec<SessionConfigEntry>,
    pub drs_zones_enabled: bool,
    pub drs_zones: Vec<DrsZone>,
    pub push_to_pass_enabled: bool,
    pub mandatory_pit_stops: u8,
    pub cuts_penalty: PenaltyConfig,
    pub collision_penalty: PenaltyConfig,
}

/// One DRS activation zone, as a normalised spline-position range `[start, end)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DrsZone {
    pub start: f32,
    pub end: f32,
}

/// One penalty policy, reused for the cuts/collision rule sets (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PenaltyConfig {
    pub enabled: bool,
    pub warnings_before_penalty: Option<u32>,
    pub penalty_type: PenaltyType,
    pub bop_amount_kg: f32,
    pub bop_duration_laps: u32,
    pub drive_through_duration_seconds: u32,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            warnings_before_penalty: None,
            penalty_type: PenaltyType::None,
            bop_amount_kg: 0.0,
            bop_duration_laps: 0,
            drive_through_duration_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PenaltyType {
    #[default]
    None,
    Kick,
    DriveThrough,
    BoPIncrease,
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            track: String::new(),
            track_layout: String::new(),
            sun_angle: 16.0,
            legal_tyres: Vec::new(),
            fuel_rate: 100.0,
            damage_multiplier: 100.0,
            tyre_wear_rate: 100.0,
            allowed_tyres_out: 2,
            abs_allowed: 1,
            traction_control_allowed: 1,
            stability_control_allowed: false,
            auto_clutch_allowed: true,
            tyre_blankets_allowed: true,
            force_virtual_mirror: true,
            race_pit_window_start: -1,
            race_pit_window_end: -1,
            reversed_grid_race_positions: 0,
            time_of_day_multiplier: 1.0,
            qualify_max_wait_percentage: 120,
            race_gas_penalty_disabled: false,
            max_ballast_kg: 100.0,
            race_extra_lap: true,
            race_over_time: 120,
            max_contacts_per_km: -1,
            result_screen_time: 60,
            pickup_mode_enabled: true,
            locked_entry_list: false,
            loop_mode: true,
            max_clients: 24,
            sessions: Vec::new(),
            drs_zones_enabled: false,
            drs_zones: Vec::new(),
            push_to_pass_enabled: false,
            mandatory_pit_stops: 0,
            cuts_penalty: PenaltyConfig::default(),
            collision_penalty: PenaltyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfigEntry {
    pub kind: SessionKind,
    pub name: String,
    #[serde(default)]
    pub time_seconds: u32,
    #[serde(default)]
    pub laps: u32,
    #[serde(default = "default_true")]
    pub is_open: bool,
    #[serde(default)]
    pub wait_time_seconds: u32,
    #[serde(default)]
    pub is_solo: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicTrackConfig {
    pub session_start_percent: u32,
    pub randomness_percent: u32,
    pub session_transfer_percent: u32,
    pub lap_gain_percent: u32,
}

impl Default for DynamicTrackConfig {
    fn default() -> Self {
        Self {
            session_start_percent: 100,
            randomness_percent: 0,
            session_transfer_percent: 80,
            lap_gain_percent: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WeatherConfig {
    pub graphics: String,
    /// Seconds this config stays active before the schedule blends into the next
    /// entry; 0 means it never expires on its own.
    pub duration_seconds: f32,
    pub base_temperature_ambient: f32,
    pub base_temperature_road: f32,
    pub variation_ambient: f32,
    pub variation_road: f32,
    pub wind_base_speed_min: f32,
    pub wind_base_speed_max: f32,
    pub wind_base_direction: f32,
    pub wind_variation_direction: f32,
    #[serde(default)]
    pub sessions: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EntrantConfig {
    pub car_id: u8,
    pub model: String,
    pub skin: String,
    #[serde(default)]
    pub allowed_tyres: Vec<String>,
    #[serde(default)]
    pub spectator: bool,
    #[serde(default)]
    pub fixed_setup: Option<String>,
    #[serde(default)]
    pub ballast_kg: f32,
    #[serde(default)]
    pub restrictor: f32,
    #[serde(default)]
    pub guid: Option<String>,
}

/// Server-block config, reserved for plugin bus tuning. Not yet part of the
/// INI-mirroring surface above; kept distinct so new ambient settings don't
/// collide with the original field names.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PluginConfig {
    pub udp_plugin_address: Option<String>,
    pub udp_plugin_local_port: Option<u16>,
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().display().to_string();
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path_str.clone(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path_str,
            source,
        })
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                tracing::warn!(error = %err, "failed to load config, using defaults");
                Self::default()
            }
        }
    }
}

pub type WeatherSchedule = HashMap<u32, Vec<WeatherConfig>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_ports() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.server.tcp_port, 9600);
        assert_eq!(cfg.server.udp_port, 9600);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let cfg = ServerConfig::default();
        let text = toml::to_string(&cfg).unwrap();
        let parsed: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.name, cfg.server.name);
        assert_eq!(parsed.race.max_clients, cfg.race.max_clients);
    }

    #[test]
    fn missing_file_load_or_default_falls_back() {
        let cfg = ServerConfig::load_or_default("/nonexistent/path/server.toml");
        assert_eq!(cfg.server.tcp_port, 9600);
    }

    #[test]
    fn session_entries_deserialize_from_toml() {
        let text = r#"
            [server]
            name = "Test"

            [[race.sessions]]
            kind = "Practice"
            time_seconds = 900
        "#;
        let cfg: ServerConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.race.sessions.len(), 1);
        assert_eq!(cfg.race.sessions[0].kind, SessionKind::Practice);
        assert!(cfg.race.sessions[0].is_open);
    }
}
