use ac_server::checksum::ChecksumManager;
use ac_server::config::ServerConfig;
use ac_server::data::{Car, EntryList, SessionConfig};
use ac_server::dynamic_track::DynamicTrack;
use ac_server::handlers::HandlerContext;
use ac_server::http_server::{self, HttpServerState};
use ac_server::lobby::{LobbyClient, LobbyRegistration};
use ac_server::plugin::PluginBus;
use ac_server::server_state::{load_blocklist, ServerState};
use ac_server::session::{SessionManager, SessionRaceRules};
use ac_server::transport::Transport;
use ac_server::weather::WeatherManager;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to server.toml configuration file
    #[arg(short, long, default_value = "./server.toml")]
    config: String,

    /// Override log level (trace|debug|info|warn|error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = args.log_level.as_deref().unwrap_or("info");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    info!("starting dedicated multiplayer race server");

    let config = Arc::new(ServerConfig::load_or_default(&args.config));
    info!(config_path = %args.config, track = %config.race.track, "configuration loaded");

    let block_list = load_blocklist(&config.server.blocklist_file);
    let entry_list = build_entry_list(&config);
    let state = Arc::new(ServerState::new(entry_list, block_list));

    let checksums = Arc::new(ChecksumManager::scan(&config.server.checksum_files, "."));
    let dynamic_track = Arc::new(DynamicTrack::new(config.dynamic_track.clone()));
    let weather = Arc::new(WeatherManager::new(config.weather.clone()));
    let plugins = Arc::new(PluginBus::null());

    let sessions: Vec<SessionConfig> = config
        .race
        .sessions
        .iter()
        .map(|s| SessionConfig {
            kind: s.kind,
            name: s.name.clone(),
            time_seconds: s.time_seconds,
            laps: s.laps,
            is_open: s.is_open,
            wait_time_seconds: s.wait_time_seconds,
            is_solo: s.is_solo,
        })
        .collect();

    let rules = SessionRaceRules {
        result_screen_time: Duration::from_secs(config.race.result_screen_time as u64),
        race_over_time: Duration::from_secs(config.race.race_over_time as u64),
        race_extra_lap: config.race.race_extra_lap,
        qualify_max_wait_percentage: config.race.qualify_max_wait_percentage,
        reversed_grid_race_positions: config.race.reversed_grid_race_positions,
        loop_mode: config.race.loop_mode,
    };
    let session = Arc::new(SessionManager::new(state.clone(), dynamic_track.clone(), sessions, rules));

    dynamic_track.on_session_start(ac_server::rng::unit()).await;
    weather.on_session_start(0, ac_server::rng::unit()).await;

    let ctx = HandlerContext {
        state: state.clone(),
        session: session.clone(),
        dynamic_track: dynamic_track.clone(),
        weather: weather.clone(),
        checksums,
        plugins,
        config: config.clone(),
    };

    let tcp_addr: SocketAddr = format!("0.0.0.0:{}", config.server.tcp_port).parse()?;
    let udp_addr: SocketAddr = format!("0.0.0.0:{}", config.server.udp_port).parse()?;
    let mut transport = Transport::bind(ctx, tcp_addr, udp_addr).await?;
    transport.start();
    info!(%tcp_addr, %udp_addr, "transport listening");

    let http_bind = format!("0.0.0.0:{}", config.server.http_port);
    let http_state = HttpServerState {
        state: state.clone(),
        session: session.clone(),
        server_name: config.server.name.clone(),
        track: config.race.track.clone(),
    };
    tokio::spawn(async move {
        if let Err(err) = http_server::run(http_bind, http_state).await {
            error!(error = %err, "lobby-wrapper http server failed");
        }
    });

    let lobby = if config.server.register_to_lobby {
        match LobbyClient::new(&config.server.lobby_url) {
            Ok(client) => {
                let client = Arc::new(client);
                spawn_lobby_loop(client.clone(), config.clone(), state.clone());
                Some(client)
            }
            Err(err) => {
                warn!(error = %err, "invalid lobby url, lobby registration disabled");
                None
            }
        }
    } else {
        None
    };

    info!("server is running, press ctrl+c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    transport.shutdown().await;
    if let Some(lobby) = lobby {
        lobby.unregister().await;
    }

    info!("server stopped");
    Ok(())
}

fn build_entry_list(config: &ServerConfig) -> EntryList {
    let cars = config
        .entry_list
        .iter()
        .map(|entry| {
            let mut car = Car::new_slot(entry.car_id, entry.model.clone(), entry.skin.clone(), entry.allowed_tyres.clone());
            car.ballast_kg = entry.ballast_kg;
            car.restrictor = entry.restrictor;
            car.guid = entry.guid.clone();
            Arc::new(car)
        })
        .collect();
    EntryList::new(cars)
}

fn spawn_lobby_loop(client: Arc<LobbyClient>, config: Arc<ServerConfig>, state: Arc<ServerState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            let registration = LobbyRegistration {
                name: config.server.name.clone(),
                track: config.race.track.clone(),
                car_models: config.entry_list.iter().map(|e| e.model.clone()).collect(),
                tcp_port: config.server.tcp_port,
                udp_port: config.server.udp_port,
                max_clients: config.race.max_clients,
                connected_clients: state.connected_count() as u8,
                password_protected: !config.server.password.is_empty(),
            };
            client.update(&registration).await;
        }
    });
}
