//! Connection acceptors & periodic loops (component 4.9): the TCP accept loop,
//! the UDP receiver, and the broadcast/ping/session-tick loops that drive the
//! live server once handshakes are in.

use crate::codec::{try_read_tcp_frame, CodecError, CodecResult, PacketReader, PacketWriter};
use crate::data::TcpHandle;
use crate::handlers::{tcp as tcp_handlers, udp as udp_handlers, HandlerContext};
use crate::protocol;
use crate::server_state::ConnIdGenerator;
use crate::session::{AdvanceOutcome, TickOutcome};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(10);
const UDP_DATAGRAM_BUFFER: usize = 1500;
const TCP_READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind tcp listener on {0}: {1}")]
    TcpBind(SocketAddr, #[source] std::io::Error),
    #[error("failed to bind udp socket on {0}: {1}")]
    UdpBind(SocketAddr, #[source] std::io::Error),
}

/// Owns the server's two sockets and drives every long-running loop atop them.
pub struct Transport {
    ctx: HandlerContext,
    tcp_listener: Option<TcpListener>,
    udp_socket: Arc<UdpSocket>,
    conn_ids: Arc<ConnIdGenerator>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Transport {
    pub async fn bind(ctx: HandlerContext, tcp_addr: SocketAddr, udp_addr: SocketAddr) -> Result<Self, TransportError> {
        let tcp_listener = TcpListener::bind(tcp_addr).await.map_err(|e| TransportError::TcpBind(tcp_addr, e))?;
        let udp_socket = UdpSocket::bind(udp_addr).await.map_err(|e| TransportError::UdpBind(udp_addr, e))?;
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            ctx,
            tcp_listener: Some(tcp_listener),
            udp_socket: Arc::new(udp_socket),
            conn_ids: Arc::new(ConnIdGenerator::default()),
            shutdown_tx,
        })
    }

    /// Spawns every long-running loop and returns immediately. Loops run until
    /// `shutdown` is called.
    pub fn start(&mut self) {
        if let Some(listener) = self.tcp_listener.take() {
            tokio::spawn(tcp_acceptor(listener, self.ctx.clone(), self.conn_ids.clone(), self.shutdown_tx.subscribe()));
        }
        tokio::spawn(udp_receiver(self.udp_socket.clone(), self.ctx.clone(), self.shutdown_tx.subscribe()));
        tokio::spawn(position_broadcast_loop(self.udp_socket.clone(), self.ctx.clone(), self.shutdown_tx.subscribe()));
        tokio::spawn(ping_loop(self.udp_socket.clone(), self.ctx.clone(), self.shutdown_tx.subscribe()));
        tokio::spawn(session_tick_loop(self.ctx.clone(), self.shutdown_tx.subscribe()));
    }

    /// Broadcasts a goodbye disconnect frame to every connected car, signals every
    /// loop to stop, and gives connections a short grace period to flush it before
    /// the caller tears down the process.
    pub async fn shutdown(&self) {
        info!("initiating transport shutdown");
        let mut goodbye = PacketWriter::new();
        goodbye.write_u8(protocol::TCP_MESSAGE_DISCONNECT);
        self.ctx.state.broadcast_all_tcp(goodbye).await;

        let _ = self.shutdown_tx.send(());
        tokio::time::sleep(Duration::from_millis(500)).await;
        info!("transport shutdown complete");
    }
}

async fn tcp_acceptor(listener: TcpListener, ctx: HandlerContext, conn_ids: Arc<ConnIdGenerator>, mut shutdown_rx: broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let conn_id = conn_ids.next();
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_tcp_connection(stream, addr, conn_id, &ctx).await {
                                warn!(conn_id, %addr, error = %err, "tcp connection closed with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "failed to accept tcp connection"),
                }
            }
            _ = shutdown_rx.recv() => {
                info!("tcp acceptor stopping");
                return;
            }
        }
    }
}

async fn handle_tcp_connection(mut stream: TcpStream, addr: SocketAddr, conn_id: u64, ctx: &HandlerContext) -> CodecResult<()> {
    let mut buf = BytesMut::with_capacity(TCP_READ_CHUNK);

    let handshake_body = match tokio::time::timeout(HANDSHAKE_READ_TIMEOUT, read_one_frame(&mut stream, &mut buf)).await {
        Ok(Ok(Some(body))) => body,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(err)) => return Err(err),
        Err(_) => {
            warn!(conn_id, %addr, "handshake read timed out");
            return Ok(());
        }
    };

    if handshake_body.is_empty() || handshake_body[0] != protocol::TCP_HANDSHAKE_BEGIN {
        warn!(conn_id, %addr, "first tcp message was not a handshake");
        return Ok(());
    }

    let car_id = match tcp_handlers::handle_handshake(ctx, conn_id, &handshake_body[1..]).await? {
        Ok(car_id) => car_id,
        Err(err) => {
            let mut w = PacketWriter::new();
            w.write_u8(tcp_handlers::failure_opcode(&err));
            let frame = w.into_tcp_frame();
            let _ = stream.write_all(&frame).await;
            info!(conn_id, %addr, error = %err, "handshake rejected");
            return Ok(());
        }
    };

    let (mut read_half, write_half) = stream.into_split();
    let tcp_handle = Arc::new(TcpHandle { writer: Mutex::new(write_half), peer_addr: addr });

    let car = ctx.state.by_id(car_id).expect("just-connected car exists");
    car.inner.write().await.connection.tcp = Some(tcp_handle);

    let leaderboard = ctx.session.leaderboard_snapshot().await;
    let leaderboard_position = leaderboard.iter().position(|e| e.car_id == car_id).map(|p| p as u8 + 1).unwrap_or(0);
    let success = tcp_handlers::build_handshake_success(ctx, car, leaderboard_position, 0, crate::rng::unit().to_bits(), now_millis()).await;
    ctx.state.write_packet(car, success).await;

    loop {
        match try_read_tcp_frame(&mut buf)? {
            Some(body) => {
                if let Err(err) = dispatch_tcp_message(ctx, conn_id, &body).await {
                    warn!(conn_id, %addr, error = %err, "error dispatching tcp message");
                }
            }
            None => {
                let mut chunk = [0u8; TCP_READ_CHUNK];
                let n = read_half.read(&mut chunk).await.map_err(|_| CodecError::UnexpectedEof)?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }

    tcp_handlers::handle_disconnect(ctx, conn_id).await;
    Ok(())
}

async fn read_one_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> CodecResult<Option<bytes::Bytes>> {
    loop {
        if let Some(body) = try_read_tcp_frame(buf)? {
            return Ok(Some(body));
        }
        let mut chunk = [0u8; TCP_READ_CHUNK];
        let n = stream.read(&mut chunk).await.map_err(|_| CodecError::UnexpectedEof)?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

async fn dispatch_tcp_message(ctx: &HandlerContext, conn_id: u64, body: &[u8]) -> CodecResult<()> {
    if body.is_empty() {
        return Ok(());
    }
    let opcode = body[0];
    let rest = &body[1..];
    match opcode {
        protocol::TCP_MESSAGE_CHECKSUM => tcp_handlers::handle_checksum(ctx, conn_id, rest).await,
        protocol::TCP_MESSAGE_DISCONNECT => {
            tcp_handlers::handle_disconnect(ctx, conn_id).await;
            Ok(())
        }
        protocol::TCP_MESSAGE_TYRE_CHANGE => tcp_handlers::handle_tyre_change(ctx, conn_id, rest).await,
        protocol::TCP_MANDATORY_PIT_COMPLETED => {
            tcp_handlers::handle_mandatory_pit_completed(ctx, conn_id).await;
            Ok(())
        }
        protocol::TCP_MESSAGE_PUSH_TO_PASS => {
            tcp_handlers::handle_push_to_pass(ctx, conn_id).await;
            Ok(())
        }
        protocol::TCP_MESSAGE_CHAT => tcp_handlers::handle_chat(ctx, conn_id, rest).await,
        protocol::TCP_MESSAGE_ADMIN_COMMAND => tcp_handlers::handle_admin_command(ctx, conn_id, rest).await,
        protocol::TCP_MESSAGE_LAP_COMPLETED => tcp_handlers::handle_lap_completed(ctx, conn_id, rest).await,
        other => {
            warn!(conn_id, opcode = other, "unknown tcp opcode");
            Ok(())
        }
    }
}

async fn udp_receiver(socket: Arc<UdpSocket>, ctx: HandlerContext, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut buf = vec![0u8; UDP_DATAGRAM_BUFFER];
    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => {
                let Ok((n, addr)) = received else { continue };
                if n == 0 {
                    continue;
                }
                let opcode = buf[0];
                let body = buf[1..n].to_vec();

                // The handshake-associate datagram is the one exception to "drop
                // unknown addresses silently" — it's how an address first gets
                // registered at all.
                if opcode == protocol::UDP_HANDSHAKE_ASSOCIATE {
                    if let Err(err) = udp_handlers::handle_udp_handshake(&ctx, addr, &body).await {
                        warn!(%addr, error = %err, "malformed udp handshake-associate datagram");
                    }
                    continue;
                }

                if ctx.state.car_by_udp(addr).await.is_none() {
                    continue;
                }

                let result = match opcode {
                    protocol::UDP_MESSAGE_CAR_UPDATE => udp_handlers::handle_car_update(&ctx, addr, &body).await,
                    protocol::UDP_MESSAGE_SESSION_INFO => udp_handlers::handle_session_info(&ctx, addr, &body).await,
                    protocol::UDP_MESSAGE_PING => udp_handlers::handle_ping(&ctx, addr, &body).await,
                    _ => Ok(()),
                };
                if let Err(err) = result {
                    warn!(%addr, opcode, error = %err, "malformed udp datagram");
                }
            }
            _ = shutdown_rx.recv() => {
                info!("udp receiver stopping");
                return;
            }
        }
    }
}

/// Position broadcast (§4.9): at `ClientSendIntervalInHertz`, every car with an
/// update pending since the last tick gets its status sent to every other
/// connected, loaded car. Solo qualifying suppresses all cross-car sends.
async fn position_broadcast_loop(socket: Arc<UdpSocket>, ctx: HandlerContext, mut shutdown_rx: broadcast::Receiver<()>) {
    let hz = ctx.config.server.client_send_interval_hz.max(1);
    let mut interval = tokio::time::interval(Duration::from_millis(1000 / hz as u64));
    loop {
        tokio::select! {
            _ = interval.tick() => broadcast_positions(&socket, &ctx).await,
            _ = shutdown_rx.recv() => {
                info!("position broadcast loop stopping");
                return;
            }
        }
    }
}

async fn broadcast_positions(socket: &UdpSocket, ctx: &HandlerContext) {
    if ctx.session.current_solo_qualifying_pinned().await {
        return;
    }

    let loaded: Vec<_> = ctx.state.entry_list.iter().filter(|c| c.is_connected()).collect();

    for car in &loaded {
        let outgoing = {
            let mut inner = car.inner.write().await;
            if !inner.connection.has_update_to_broadcast || !inner.connection.has_sent_first_update {
                None
            } else {
                inner.connection.has_update_to_broadcast = false;
                Some(inner.broadcast_status)
            }
        };
        let Some(status) = outgoing else { continue };

        let mut w = PacketWriter::new();
        w.write_u8(protocol::UDP_MESSAGE_CAR_UPDATE)
            .write_u8(car.car_id)
            .write_u32(status.timestamp)
            .write_u8(status.sequence)
            .write_vector3f(status.position)
            .write_vector3f(status.rotation)
            .write_vector3f(status.velocity)
            .write_bytes(&status.tyre_angular_speed)
            .write_u8(status.steer_angle)
            .write_u8(status.wheel_angle)
            .write_u16(status.engine_rpm)
            .write_u8(status.gear_index)
            .write_u32(status.status_bytes)
            .write_i16(status.performance_delta)
            .write_u8(status.gas)
            .write_f32(status.normalised_spline_pos);
        let datagram = w.into_bytes();

        for other in &loaded {
            if Arc::ptr_eq(other, car) {
                continue;
            }
            let dest = {
                let inner = other.inner.read().await;
                if !inner.connection.has_sent_first_update {
                    None
                } else {
                    inner.connection.udp_addr
                }
            };
            let Some(dest) = dest else { continue };
            if let Err(err) = socket.send_to(&datagram, dest).await {
                warn!(car_id = other.car_id, error = %err, "position broadcast send failed");
            }
        }
    }
}

/// Ping loop (§4.9): 1 Hz, sends the current server time to every car with a
/// known UDP address; the matching `Ping` reply's offset is applied in
/// `handle_ping`.
async fn ping_loop(socket: Arc<UdpSocket>, ctx: HandlerContext, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = interval.tick() => send_pings(&socket, &ctx).await,
            _ = shutdown_rx.recv() => {
                info!("ping loop stopping");
                return;
            }
        }
    }
}

async fn send_pings(socket: &UdpSocket, ctx: &HandlerContext) {
    let now = now_millis();
    for car in ctx.state.entry_list.iter() {
        if !car.is_connected() {
            continue;
        }
        let addr = car.inner.read().await.connection.udp_addr;
        let Some(addr) = addr else { continue };

        let mut w = PacketWriter::new();
        w.write_u8(protocol::UDP_MESSAGE_PONG).write_u32(now);
        if let Err(err) = socket.send_to(&w.into_bytes(), addr).await {
            warn!(car_id = car.car_id, error = %err, "ping send failed");
        }
    }
}

/// Session tick loop (§4.7/4.9): 1 Hz, drives `SessionManager::tick`/`advance`,
/// advances the weather schedule, and persists results on every completed,
/// non-empty session.
async fn session_tick_loop(ctx: HandlerContext, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = Instant::now();
                match ctx.session.tick(now).await {
                    TickOutcome::SessionCompleted => broadcast_session_completed(&ctx).await,
                    TickOutcome::ReadyToAdvance => advance_session(&ctx).await,
                    TickOutcome::Running | TickOutcome::Stalled => {}
                }
                tick_weather(&ctx, now).await;
            }
            _ = shutdown_rx.recv() => {
                info!("session tick loop stopping");
                return;
            }
        }
    }
}

/// `BroadcastSessionCompleted`: opcode, one `{carId, time_ms, num_laps}` triple
/// per leaderboard line, then a trailing byte the client ignores today (the
/// original server used it to signal a post-session kick).
async fn broadcast_session_completed(ctx: &HandlerContext) {
    let leaderboard = ctx.session.leaderboard_snapshot().await;
    info!(entries = leaderboard.len(), "broadcasting session completed");
    let mut w = PacketWriter::new();
    w.write_u8(protocol::TCP_SESSION_COMPLETED);
    for entry in &leaderboard {
        w.write_u8(entry.car_id).write_u32(entry.total_time_ms as u32).write_u16(entry.num_laps as u16);
    }
    w.write_u8(1);
    ctx.state.broadcast_all_tcp(w).await;
}

/// `BroadcastSessionStart`: one packet per already-loaded entrant, with the
/// session start and broadcast-time fields clock-corrected by that entrant's
/// measured ping offset.
async fn broadcast_session_start(ctx: &HandlerContext) {
    if ctx.state.connected_count() == 0 {
        return;
    }
    let now = now_millis();
    for car in ctx.state.entry_list.iter() {
        if !car.is_connected() {
            continue;
        }
        let (offset_ms, ping_ms, loaded) = {
            let inner = car.inner.read().await;
            (inner.connection.time_offset_ms, inner.connection.ping_ms, inner.connection.has_sent_first_update)
        };
        if !loaded {
            continue;
        }
        let mut w = PacketWriter::new();
        w.write_u8(protocol::TCP_SESSION_START)
            .write_i32(now as i64 as i32 - offset_ms as i32)
            .write_u32((now as i64 - offset_ms) as u32)
            .write_u16(ping_ms as u16);
        ctx.state.write_packet(car, w).await;
    }
}

/// Advances the weather schedule by one tick and broadcasts the new sample to
/// every connected car on blend completion, firing `OnWeatherChange`.
async fn tick_weather(ctx: &HandlerContext, now: Instant) {
    let elapsed = ctx.session.elapsed_seconds(now).await;
    let changed = ctx.weather.tick(elapsed, crate::rng::unit()).await;
    if !changed {
        return;
    }
    broadcast_weather(ctx).await;

    let graphics = ctx.weather.current_graphics().await.unwrap_or_default();
    ctx.plugins.fire("on_weather_change", move |plugin| async move {
        plugin.on_weather_change(&graphics).await;
    });
}

pub(crate) async fn advance_session(ctx: &HandlerContext) {
    let leaderboard = ctx.session.leaderboard_snapshot().await;
    let index = ctx.session.current_index().await;
    let name = ctx.session.current_name().await;
    let kind = ctx.session.current_kind().await;

    match crate::results::write_session_result(&ctx.config.server.results_dir, index, &name, kind, &leaderboard).await {
        Ok(Some(filename)) => {
            ctx.plugins.fire("on_end_session", move |plugin| async move {
                plugin.on_end_session(&filename).await;
            });
        }
        Ok(None) => {}
        Err(err) => warn!(error = %err, "failed to persist session results"),
    }

    match ctx.session.advance().await {
        AdvanceOutcome::Advanced(idx) | AdvanceOutcome::Replayed(idx) => {
            ctx.dynamic_track.on_session_start(crate::rng::unit()).await;
            ctx.weather.on_session_start(idx as u32, crate::rng::unit()).await;
            broadcast_session_start(&ctx).await;
            broadcast_weather(&ctx).await;
            ctx.plugins.fire("on_new_session", move |plugin| async move {
                plugin.on_new_session(idx).await;
            });
        }
        AdvanceOutcome::Looped => {
            ctx.dynamic_track.on_session_start(crate::rng::unit()).await;
            ctx.weather.on_session_start(0, crate::rng::unit()).await;
            broadcast_session_start(&ctx).await;
            broadcast_weather(&ctx).await;
            ctx.plugins.fire("on_new_session", |plugin| async move {
                plugin.on_new_session(0).await;
            });
        }
        AdvanceOutcome::ServerShouldStop => {
            info!("loop mode disabled and session list exhausted, server will stop");
        }
    }
}

/// `RestartSession` admin command: reloads the current session config in place
/// and re-broadcasts session start / weather, without persisting results or
/// bumping to the next session index.
pub(crate) async fn restart_session(ctx: &HandlerContext) {
    let index = ctx.session.restart_current().await;
    ctx.dynamic_track.on_session_start(crate::rng::unit()).await;
    ctx.weather.on_session_start(index as u32, crate::rng::unit()).await;
    broadcast_session_start(ctx).await;
    broadcast_weather(ctx).await;
    ctx.plugins.fire("on_new_session", move |plugin| async move {
        plugin.on_new_session(index).await;
    });
}

/// Broadcasts the freshly selected weather sample to every already-connected
/// car (new joiners get it from `send_first_update_sequence` instead).
async fn broadcast_weather(ctx: &HandlerContext) {
    let sample = ctx.weather.current().await;
    let mut w = PacketWriter::new();
    w.write_u8(protocol::TCP_MESSAGE_WEATHER)
        .write_f32(sample.ambient_c)
        .write_f32(sample.road_c)
        .write_f32(sample.wind_speed)
        .write_f32(sample.wind_direction);
    ctx.state.broadcast_all_tcp(w).await;
}

fn now_millis() -> u32 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u32
}
