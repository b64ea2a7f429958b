//! End-to-end tests against the real transport stack: binds actual TCP/UDP
//! sockets, drives the wire protocol from a plain test client, and asserts on
//! server-side state rather than on packet bytes alone.

use ac_server::checksum::ChecksumManager;
use ac_server::codec::{try_read_tcp_frame, PacketReader, PacketWriter};
use ac_server::config::ServerConfig;
use ac_server::data::{Car, EntryList, SessionConfig};
use ac_server::dynamic_track::DynamicTrack;
use ac_server::handlers::HandlerContext;
use ac_server::plugin::PluginBus;
use ac_server::protocol;
use ac_server::server_state::ServerState;
use ac_server::session::{SessionManager, SessionRaceRules};
use ac_server::transport::Transport;
use ac_server::weather::WeatherManager;
use bytes::BytesMut;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

struct RunningServer {
    transport: Transport,
    state: Arc<ServerState>,
    session: Arc<SessionManager>,
}

async fn start_server(tcp_port: u16, udp_port: u16, password: &str) -> RunningServer {
    let mut config = ServerConfig::default();
    config.race.track = "test_track".into();
    config.server.name = "test server".into();
    config.server.password = password.into();
    config.entry_list.push(ac_server::config::EntrantConfig {
        car_id: 0,
        model: "test_car".into(),
        skin: "default".into(),
        allowed_tyres: vec!["slick".into()],
        ..Default::default()
    });

    let entry_list = EntryList::new(vec![Arc::new(Car::new_slot(0, "test_car".into(), "default".into(), vec!["slick".into()]))]);
    let state = Arc::new(ServerState::new(entry_list, HashSet::new()));
    let checksums = Arc::new(ChecksumManager::scan(&Vec::<String>::new(), "."));
    let dynamic_track = Arc::new(DynamicTrack::new(config.dynamic_track.clone()));
    let weather = Arc::new(WeatherManager::new(config.weather.clone()));
    let plugins = Arc::new(PluginBus::null());

    let sessions: Vec<SessionConfig> = vec![SessionConfig {
        kind: ac_server::data::SessionKind::Practice,
        name: "Practice".into(),
        time_seconds: 600,
        laps: 0,
        is_open: true,
        wait_time_seconds: 0,
        is_solo: false,
    }];
    let rules = SessionRaceRules {
        result_screen_time: Duration::from_secs(5),
        race_over_time: Duration::from_secs(120),
        race_extra_lap: false,
        qualify_max_wait_percentage: 100,
        reversed_grid_race_positions: 0,
        loop_mode: true,
    };
    let session = Arc::new(SessionManager::new(state.clone(), dynamic_track.clone(), sessions, rules));

    let ctx = HandlerContext {
        state: state.clone(),
        session: session.clone(),
        dynamic_track,
        weather,
        checksums,
        plugins,
        config: Arc::new(config),
    };

    let tcp_addr: SocketAddr = format!("127.0.0.1:{tcp_port}").parse().unwrap();
    let udp_addr: SocketAddr = format!("127.0.0.1:{udp_port}").parse().unwrap();
    let mut transport = Transport::bind(ctx, tcp_addr, udp_addr).await.expect("bind transport");
    transport.start();
    RunningServer { transport, state, session }
}

fn handshake_frame(guid: &str, name: &str, password: &str) -> bytes::Bytes {
    let mut w = PacketWriter::new();
    w.write_u8(protocol::TCP_HANDSHAKE_BEGIN)
        .write_u16(protocol::PROTOCOL_VERSION)
        .write_ascii_string(guid)
        .write_utf32_string(name)
        .write_utf32_string("team")
        .write_ascii_string("US")
        .write_ascii_string("test_car")
        .write_ascii_string(password);
    w.into_tcp_frame()
}

async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> bytes::Bytes {
    loop {
        if let Some(body) = try_read_tcp_frame(buf).expect("valid frame") {
            return body;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.expect("read");
        assert!(n > 0, "connection closed before a full frame arrived");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn handshake_succeeds_and_assigns_car_zero() {
    let server = start_server(19510, 19511, "").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = TcpStream::connect("127.0.0.1:19510").await.expect("connect");
    stream.write_all(&handshake_frame("guid-1", "Driver One", "")).await.unwrap();

    let mut buf = BytesMut::new();
    let body = read_frame(&mut stream, &mut buf).await;
    let mut r = PacketReader::new(body);
    assert_eq!(r.read_u8().unwrap(), protocol::TCP_HANDSHAKE_SUCCESS);
    assert_eq!(server.state.connected_count(), 1);
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let server = start_server(19520, 19521, "secret").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = TcpStream::connect("127.0.0.1:19520").await.expect("connect");
    stream.write_all(&handshake_frame("guid-2", "Driver Two", "not-the-password")).await.unwrap();

    let mut buf = BytesMut::new();
    let body = read_frame(&mut stream, &mut buf).await;
    let mut r = PacketReader::new(body);
    let opcode = r.read_u8().unwrap();
    assert_eq!(opcode, protocol::handshake_failed::WRONG_PASSWORD);
    assert_eq!(server.state.connected_count(), 0);
}

#[tokio::test]
async fn udp_handshake_associate_then_server_ping_loop_sends_pong() {
    let _server = start_server(19530, 19531, "").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = TcpStream::connect("127.0.0.1:19530").await.expect("connect");
    stream.write_all(&handshake_frame("guid-3", "Driver Three", "")).await.unwrap();
    let mut buf = BytesMut::new();
    read_frame(&mut stream, &mut buf).await;

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    udp.connect("127.0.0.1:19531").await.unwrap();

    let mut w = PacketWriter::new();
    w.write_u8(protocol::UDP_HANDSHAKE_ASSOCIATE).write_u8(0);
    udp.send(&w.into_bytes()).await.unwrap();

    // The transport's ping loop pushes a pong to every associated car once a second.
    let mut recv_buf = [0u8; 1500];
    let n = tokio::time::timeout(Duration::from_secs(2), udp.recv(&mut recv_buf))
        .await
        .expect("pong within timeout")
        .expect("recv ok");
    assert!(n >= 1);
    assert_eq!(recv_buf[0], protocol::UDP_MESSAGE_PONG);
}

#[tokio::test]
async fn lap_completion_is_reflected_on_the_leaderboard() {
    let server = start_server(19540, 19541, "").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = TcpStream::connect("127.0.0.1:19540").await.expect("connect");
    stream.write_all(&handshake_frame("guid-4", "Driver Four", "")).await.unwrap();
    let mut buf = BytesMut::new();
    read_frame(&mut stream, &mut buf).await;

    let mut w = PacketWriter::new();
    w.write_u8(protocol::TCP_MESSAGE_LAP_COMPLETED).write_u32(95_123).write_u32(0);
    stream.write_all(&w.into_tcp_frame()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let leaderboard = server.session.leaderboard_snapshot().await;
    let entry = leaderboard.iter().find(|e| e.car_id == 0).expect("car 0 on leaderboard");
    assert_eq!(entry.best_lap_ms, 95_123);
}
