//! TCP message handlers (component 4.8).

use super::HandlerContext;
use crate::codec::{CodecResult, PacketReader, PacketWriter};
use crate::data::{Car, CarId, Driver};
use crate::protocol::{self, handshake_failed};
use crate::server_state::ConnId;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(u16),
    #[error("booking in progress, {0}s remaining")]
    StillBooking(u32),
    #[error("guid is block-listed or not on the join list")]
    BlockListed,
    #[error("wrong password")]
    WrongPassword,
    #[error("session is closed to new entrants")]
    SessionClosed,
    #[error("no slots available for car model")]
    NoSlotsAvailable,
    #[error("driver pre-allocation guid mismatch")]
    AuthFailed,
}

/// Handles `HandshakeBegin`. On success, connects the car, writes the
/// handshake-success packet, and fires `OnNewConnection`. On failure, writes the
/// matching failure opcode and the caller closes the connection.
pub async fn handle_handshake(
    ctx: &HandlerContext,
    conn_id: ConnId,
    body: &[u8],
) -> CodecResult<Result<CarId, HandshakeError>> {
    let mut r = PacketReader::new(bytes::Bytes::copy_from_slice(body));
    let client_protocol = r.read_u16()?;
    if client_protocol != protocol::PROTOCOL_VERSION {
        return Ok(Err(HandshakeError::UnsupportedProtocol(protocol::PROTOCOL_VERSION)));
    }

    let guid = r.read_ascii_string()?;
    let driver_name = r.read_utf32_string()?;
    let driver_team = r.read_utf32_string()?;
    let nation = r.read_ascii_string()?;
    let car_model = r.read_ascii_string()?;
    let password = r.read_ascii_string()?;

    if let Some(remaining) = ctx.session.booking_remaining_seconds(Instant::now()).await {
        return Ok(Err(HandshakeError::StillBooking(remaining)));
    }

    if ctx.state.is_blocked(&guid).await || ctx.state.is_no_join(&guid).await {
        return Ok(Err(HandshakeError::BlockListed));
    }

    let server_password = &ctx.config.server.password;
    let admin_password = &ctx.config.server.admin_password;
    let is_admin = !admin_password.is_empty() && password == *admin_password;
    if !server_password.is_empty() && password != *server_password && !is_admin {
        return Ok(Err(HandshakeError::WrongPassword));
    }

    if !ctx.session.current_session_is_open().await {
        return Ok(Err(HandshakeError::SessionClosed));
    }

    let allow_any_model = !ctx.config.race.locked_entry_list;
    let slot = ctx.state.entry_list.first_free_slot(&car_model, &guid, allow_any_model);
    let car = match slot {
        Ok(Some(car)) => car,
        Ok(None) => return Ok(Err(HandshakeError::NoSlotsAvailable)),
        Err(()) => return Ok(Err(HandshakeError::AuthFailed)),
    };

    car.set_connected(true);
    {
        let mut inner = car.inner.write().await;
        inner.driver = Driver {
            name: driver_name,
            team: driver_team,
            guid: guid.clone(),
            nation,
            is_admin,
            join_time: Some(Instant::now()),
            load_time: None,
        };
        inner.connection.has_sent_first_update = false;
    }

    ctx.state.register_tcp(conn_id, car.car_id, guid).await;

    ctx.plugins.fire("on_new_connection", {
        let car = car.clone();
        move |plugin| async move {
            plugin.on_new_connection(car.snapshot().await).await;
        }
    });

    info!(car_id = car.car_id, "driver connected");
    Ok(Ok(car.car_id))
}

pub fn failure_opcode(err: &HandshakeError) -> u8 {
    match err {
        HandshakeError::UnsupportedProtocol(_) => handshake_failed::UNSUPPORTED_PROTOCOL,
        HandshakeError::StillBooking(_) => handshake_failed::STILL_BOOKING,
        HandshakeError::BlockListed => handshake_failed::BLOCK_LISTED,
        HandshakeError::WrongPassword => handshake_failed::WRONG_PASSWORD,
        HandshakeError::SessionClosed => handshake_failed::SESSION_CLOSED,
        HandshakeError::NoSlotsAvailable => handshake_failed::NO_SLOTS_AVAILABLE,
        HandshakeError::AuthFailed => handshake_failed::AUTH_FAILED,
    }
}

/// Builds the handshake-success packet in the exact field order the real client
/// expects (see component 4.8's documented field list).
#[allow(clippy::too_many_arguments)]
pub async fn build_handshake_success(
    ctx: &HandlerContext,
    car: &Car,
    leaderboard_position: u8,
    elapsed_session_ms: u32,
    random_seed: u32,
    now_ms: u32,
) -> PacketWriter {
    let race = &ctx.config.race;
    let current_index = ctx.session.current_index().await;
    let current_cfg = race.sessions.get(current_index).cloned();
    let current_grip = ctx.dynamic_track.current_grip().await;
    let server = &ctx.config.server;
    let mut w = PacketWriter::new();
    w.write_u8(protocol::TCP_HANDSHAKE_SUCCESS)
        .write_utf32_string(&server.name)
        .write_u16(server.udp_port)
        .write_u8(server.client_send_interval_hz as u8)
        .write_ascii_string(&race.track)
        .write_ascii_string(&race.track_layout)
        .write_ascii_string(&car.model)
        .write_ascii_string(&car.skin)
        .write_f32(race.sun_angle)
        .write_u8(race.allowed_tyres_out.max(0) as u8)
        .write_u8(race.tyre_blankets_allowed as u8)
        .write_u8(race.traction_control_allowed)
        .write_u8(race.abs_allowed)
        .write_u8(race.stability_control_allowed as u8)
        .write_u8(race.auto_clutch_allowed as u8)
        .write_u8(0) // start rule
        .write_f32(race.damage_multiplier / 100.0)
        .write_f32(race.fuel_rate / 100.0)
        .write_f32(race.tyre_wear_rate / 100.0)
        .write_u8(race.force_virtual_mirror as u8)
        .write_u16(race.max_contacts_per_km.max(0) as u16)
        .write_u32(race.race_over_time * 1000)
        .write_u32(race.result_screen_time * 1000)
        .write_u8(race.race_extra_lap as u8)
        .write_u8(race.race_gas_penalty_disabled as u8)
        .write_u16(race.race_pit_window_start.max(0) as u16)
        .write_u16(race.race_pit_window_end.max(0) as u16)
        .write_i16(race.reversed_grid_race_positions as i16)
        .write_u8(car.car_id)
        .write_u8(race.sessions.len() as u8);

    for s in &race.sessions {
        w.write_u8(s.kind.wire_value())
            .write_u8((s.laps.min(255)) as u8)
            .write_u16((s.time_seconds / 60) as u16);
    }

    let legal_tyres = car.allowed_tyres.join(";");
    let (session_name, session_kind_wire, session_time_min, session_laps) = match &current_cfg {
        Some(cfg) => (cfg.name.clone(), cfg.kind.wire_value(), (cfg.time_seconds / 60) as u16, cfg.laps.min(255) as u8),
        None => (String::new(), 0, 0, 0),
    };
    w.write_ascii_string(&session_name)
        .write_u8(current_index.min(255) as u8)
        .write_u8(session_kind_wire)
        .write_u16(session_time_min)
        .write_u8(session_laps)
        .write_f32(current_grip)
        .write_u8(leaderboard_position)
        .write_u32(elapsed_session_ms)
        .write_u8(ctx.checksums.entries.len() as u8);

    for entry in &ctx.checksums.entries {
        w.write_ascii_string(&entry.filename);
    }

    w.write_ascii_string(&legal_tyres)
        .write_u32(random_seed)
        .write_u32(now_ms);

    w
}

pub async fn handle_disconnect(ctx: &HandlerContext, conn_id: ConnId) {
    let Some(car_id) = ctx.state.car_by_tcp(conn_id).await else {
        return;
    };
    disconnect_car(ctx, car_id).await;
}

pub async fn disconnect_car(ctx: &HandlerContext, car_id: CarId) {
    let Some(car) = ctx.state.by_id(car_id).map(Arc::clone) else { return };
    let (guid, udp_addr) = {
        let inner = car.inner.read().await;
        (inner.driver.guid.clone(), inner.connection.udp_addr)
    };
    car.set_connected(false);
    ctx.state.unregister(0, udp_addr, &guid).await;

    ctx.plugins.fire("on_connection_closed", {
        let car = car.clone();
        move |plugin| async move {
            plugin.on_connection_closed(car.snapshot().await).await;
        }
    });
}

pub async fn handle_checksum(ctx: &HandlerContext, conn_id: ConnId, body: &[u8]) -> CodecResult<()> {
    let Some(car_id) = ctx.state.car_by_tcp(conn_id).await else {
        return Ok(());
    };
    let Some(car) = ctx.state.by_id(car_id) else { return Ok(()) };

    let expected_count = ctx.checksums.entries.len();
    let mut reported = Vec::with_capacity(expected_count);
    let mut r = PacketReader::new(bytes::Bytes::copy_from_slice(body));
    for _ in 0..expected_count {
        let bytes = r.read_bytes(16)?;
        let mut digest = [0u8; 16];
        digest.copy_from_slice(&bytes);
        reported.push(digest);
    }

    let passed = ctx.checksums.verify(&reported);
    let mut inner = car.inner.write().await;
    if !passed {
        inner.connection.failed_checksum = true;
        warn!(car_id, "checksum verification failed");
        if inner.connection.has_sent_first_update {
            drop(inner);
            disconnect_car(ctx, car_id).await;
        }
    }
    Ok(())
}

pub async fn handle_tyre_change(ctx: &HandlerContext, conn_id: ConnId, body: &[u8]) -> CodecResult<()> {
    let Some(car_id) = ctx.state.car_by_tcp(conn_id).await else { return Ok(()) };
    let Some(car) = ctx.state.by_id(car_id) else { return Ok(()) };

    let mut r = PacketReader::new(bytes::Bytes::copy_from_slice(body));
    let tyre = r.read_ascii_string()?;
    if !car.allowed_tyres.iter().any(|t| t == &tyre) {
        return Ok(());
    }

    {
        let mut inner = car.inner.write().await;
        if let Some(last) = inner.session.laps.last_mut() {
            last.tyre = tyre.clone();
        }
    }

    ctx.plugins.fire("on_tyre_change", {
        let tyre = tyre.clone();
        move |plugin| async move {
            plugin.on_tyre_change(car_id, &tyre).await;
        }
    });

    let mut w = PacketWriter::new();
    w.write_u8(protocol::TCP_MESSAGE_TYRE_CHANGE)
        .write_u8(car_id)
        .write_ascii_string(&tyre);
    ctx.state.broadcast_all_tcp(w).await;
    Ok(())
}

pub async fn handle_mandatory_pit_completed(ctx: &HandlerContext, conn_id: ConnId) {
    let Some(car_id) = ctx.state.car_by_tcp(conn_id).await else { return };
    let Some(car) = ctx.state.by_id(car_id) else { return };
    car.inner.write().await.session.mandatory_pit_done = true;
}

pub async fn handle_push_to_pass(ctx: &HandlerContext, conn_id: ConnId) {
    let Some(car_id) = ctx.state.car_by_tcp(conn_id).await else { return };
    let Some(car) = ctx.state.by_id(car_id) else { return };
    let mut inner = car.inner.write().await;
    if inner.session.p2p_count > 0 {
        inner.session.p2p_count -= 1;
    }
}

pub async fn handle_chat(ctx: &HandlerContext, conn_id: ConnId, body: &[u8]) -> CodecResult<()> {
    let Some(car_id) = ctx.state.car_by_tcp(conn_id).await else { return Ok(()) };
    let Some(car) = ctx.state.by_id(car_id) else { return Ok(()) };
    let mut r = PacketReader::new(bytes::Bytes::copy_from_slice(body));
    let message = r.read_utf32_string()?;

    ctx.plugins.fire("on_chat", {
        let message = message.clone();
        move |plugin| async move {
            plugin.on_chat(car_id, &message).await;
        }
    });

    let mut w = PacketWriter::new();
    w.write_u8(protocol::TCP_MESSAGE_CHAT).write_u8(car_id).write_utf32_string(&message);

    if car.inner.read().await.driver.is_admin {
        ctx.state.broadcast_all_tcp(w).await;
    } else {
        ctx.state.write_packet(car, w).await;
    }
    Ok(())
}

pub async fn handle_admin_command(ctx: &HandlerContext, conn_id: ConnId, body: &[u8]) -> CodecResult<()> {
    let Some(car_id) = ctx.state.car_by_tcp(conn_id).await else { return Ok(()) };
    let Some(car) = ctx.state.by_id(car_id) else { return Ok(()) };
    if !car.inner.read().await.driver.is_admin {
        return Ok(());
    }

    let mut r = PacketReader::new(bytes::Bytes::copy_from_slice(body));
    let command = r.read_ascii_string()?;
    info!(car_id, %command, "admin command received");

    let mut parts = command.split_whitespace();
    let verb = parts.next().unwrap_or("");
    let target: Option<CarId> = parts.next().and_then(|s| s.parse().ok());

    match verb {
        "kick_id" => {
            if let Some(target) = target {
                info!(car_id, target, "admin kick");
                disconnect_car(ctx, target).await;
            }
        }
        "ban_id" => {
            if let Some(target) = target {
                if let Some(target_car) = ctx.state.by_id(target) {
                    let guid = target_car.inner.read().await.driver.guid.clone();
                    info!(car_id, target, %guid, "admin ban");
                    ctx.state.add_block_persisted(guid, &ctx.config.server.blocklist_file).await;
                    disconnect_car(ctx, target).await;
                }
            }
        }
        "next_session" => {
            info!(car_id, "admin next_session");
            crate::transport::advance_session(ctx).await;
        }
        "restart_session" => {
            info!(car_id, "admin restart_session");
            crate::transport::restart_session(ctx).await;
        }
        other => {
            warn!(car_id, command = other, "unrecognized admin command");
        }
    }
    Ok(())
}

pub async fn handle_lap_completed(ctx: &HandlerContext, conn_id: ConnId, body: &[u8]) -> CodecResult<()> {
    let Some(car_id) = ctx.state.car_by_tcp(conn_id).await else { return Ok(()) };
    let mut r = PacketReader::new(bytes::Bytes::copy_from_slice(body));
    let lap_time_ms = r.read_u32()?;
    let cuts = r.read_u32()?;

    let Some(car) = ctx.state.by_id(car_id) else { return Ok(()) };
    {
        let inner = car.inner.read().await;
        if inner.session.has_completed_session {
            // entrants who have completed the session can't complete more laps
            return Ok(());
        }
    }
    {
        let mut inner = car.inner.write().await;
        inner.session.laps.push(crate::data::Lap {
            completed_at: Instant::now(),
            lap_time_ms,
            cuts,
            sector_splits_ms: Vec::new(),
            tyre: String::new(),
            in_mandatory_pit_window: inner.session.mandatory_pit_done,
        });
    }

    ctx.session.complete_lap(car_id, lap_time_ms, Instant::now()).await;

    ctx.plugins.fire("on_lap_completed", move |plugin| async move {
        plugin.on_lap_completed(car_id, lap_time_ms).await;
    });
    Ok(())
}
