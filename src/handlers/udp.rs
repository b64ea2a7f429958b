//! UDP message handlers (component 4.8).

use super::HandlerContext;
use crate::codec::{CodecResult, PacketReader, PacketWriter};
use crate::data::{CarId, PluginStatus};
use crate::protocol;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::info;

/// Handles `CarUpdate`. Validates monotonic timestamp, stores telemetry, and
/// triggers the first-update sequence exactly once per connection.
pub async fn handle_car_update(ctx: &HandlerContext, addr: SocketAddr, body: &[u8]) -> CodecResult<()> {
    let Some(car_id) = ctx.state.car_by_udp(addr).await else { return Ok(()) };
    let Some(car) = ctx.state.by_id(car_id) else { return Ok(()) };

    let mut r = PacketReader::new(bytes::Bytes::copy_from_slice(body));
    let timestamp = r.read_u32()?;
    let sequence = r.read_u8()?;
    let position = r.read_vector3f()?;
    let rotation = r.read_vector3f()?;
    let velocity = r.read_vector3f()?;
    let tyre_angular_speed = [r.read_u8()?, r.read_u8()?, r.read_u8()?, r.read_u8()?];
    let steer_angle = r.read_u8()?;
    let wheel_angle = r.read_u8()?;
    let engine_rpm = r.read_u16()?;
    let gear_index = r.read_u8()?;
    let status_bytes = r.read_u32()?;
    let performance_delta = r.read_i16()?;
    let gas = r.read_u8()?;
    let normalised_spline_pos = r.read_f32()?;

    let mut needs_first_update = false;
    {
        let mut inner = car.inner.write().await;
        if timestamp < inner.connection.last_udp_timestamp && inner.connection.last_udp_timestamp != 0 {
            return Ok(()); // stale/out-of-order datagram, drop
        }
        inner.connection.last_udp_timestamp = timestamp;

        let status = PluginStatus {
            timestamp,
            sequence,
            position,
            rotation,
            velocity,
            tyre_angular_speed,
            steer_angle,
            wheel_angle,
            engine_rpm,
            gear_index,
            status_bytes,
            performance_delta,
            gas,
            normalised_spline_pos,
        };
        inner.plugin_status = status;
        inner.broadcast_status = if ctx.session.current_solo_qualifying_pinned().await {
            PluginStatus::default()
        } else {
            status
        };
        inner.connection.has_update_to_broadcast = true;

        if !inner.connection.has_sent_first_update {
            inner.connection.has_sent_first_update = true;
            needs_first_update = true;
        }
    }

    ctx.plugins.fire("on_car_update", move |plugin| async move {
        plugin.on_car_update(car_id).await;
    });

    if needs_first_update {
        send_first_update_sequence(ctx, car_id).await;
    }

    Ok(())
}

/// The first-update sequence (§4.8): fires exactly once per connection on the
/// first `CarUpdate` after handshake. If `FailedChecksum` was already set, the
/// deferred kick fires here, before anything else.
pub async fn send_first_update_sequence(ctx: &HandlerContext, car_id: CarId) {
    let Some(car) = ctx.state.by_id(car_id) else { return };

    let failed_checksum = car.inner.read().await.connection.failed_checksum;
    if failed_checksum {
        super::tcp::disconnect_car(ctx, car_id).await;
        return;
    }

    // ConnectedEntrants
    let mut w = PacketWriter::new();
    w.write_u8(protocol::TCP_CONNECTED_ENTRANTS);
    let connected: Vec<_> = ctx.state.entry_list.iter().filter(|c| c.is_connected()).collect();
    w.write_u8(connected.len() as u8);
    for entrant in &connected {
        let name = entrant.inner.read().await.driver.name.clone();
        w.write_u8(entrant.car_id).write_utf32_string(&name);
    }
    ctx.state.write_packet(car, w).await;

    // Current weather.
    let sample = ctx.weather.current().await;
    let mut ww = PacketWriter::new();
    ww.write_u8(protocol::TCP_MESSAGE_WEATHER)
        .write_f32(sample.ambient_c)
        .write_f32(sample.road_c)
        .write_f32(sample.wind_speed)
        .write_f32(sample.wind_direction);
    ctx.state.write_packet(car, ww).await;

    // Synthetic server-car lap completion to backfill this car's leaderboard view.
    ctx.session.complete_lap(protocol::SERVER_CAR_ID, 0, Instant::now()).await;

    for entrant in &connected {
        if entrant.car_id == car.car_id {
            continue;
        }
        let inner = entrant.inner.read().await;
        let tyre = inner.session.laps.last().map(|l| l.tyre.as_str()).unwrap_or("").to_string();
        let p2p_count = inner.session.p2p_count;
        let mandatory_pit_done = inner.session.mandatory_pit_done;
        drop(inner);

        let mut tw = PacketWriter::new();
        tw.write_u8(protocol::TCP_MESSAGE_TYRE_CHANGE).write_u8(entrant.car_id).write_ascii_string(&tyre);
        ctx.state.write_packet(car, tw).await;

        let mut pw = PacketWriter::new();
        pw.write_u8(protocol::TCP_MESSAGE_PUSH_TO_PASS_BROADCAST)
            .write_u8(entrant.car_id)
            .write_u8(p2p_count);
        ctx.state.write_packet(car, pw).await;

        let mut mw = PacketWriter::new();
        mw.write_u8(protocol::TCP_MANDATORY_PIT_COMPLETED_BROADCAST)
            .write_u8(entrant.car_id)
            .write_u8(mandatory_pit_done as u8);
        ctx.state.write_packet(car, mw).await;
    }

    // Balance of Performance for this car.
    let mut bw = PacketWriter::new();
    bw.write_u8(protocol::TCP_MESSAGE_BOP)
        .write_u8(car.car_id)
        .write_f32(car.ballast_kg)
        .write_f32(car.restrictor);
    ctx.state.write_packet(car, bw).await;

    // MOTD.
    if !ctx.config.server.welcome_message.is_empty() {
        let mut mw = PacketWriter::new();
        mw.write_u8(protocol::TCP_MESSAGE_MOTD).write_utf32_string(&ctx.config.server.welcome_message);
        ctx.state.write_packet(car, mw).await;
    }

    // Fixed setup, if this entry's slot has one configured.
    if let Some(entry) = ctx.config.entry_list.iter().find(|e| e.car_id == car.car_id) {
        if let Some(setup) = &entry.fixed_setup {
            let mut sw = PacketWriter::new();
            sw.write_u8(protocol::TCP_MESSAGE_FIXED_SETUP).write_ascii_string(setup);
            ctx.state.write_packet(car, sw).await;
        }
    }

    // DRS zones.
    if ctx.config.race.drs_zones_enabled {
        let mut dw = PacketWriter::new();
        dw.write_u8(protocol::TCP_MESSAGE_DRS_ZONES).write_u8(ctx.config.race.drs_zones.len() as u8);
        for zone in &ctx.config.race.drs_zones {
            dw.write_f32(zone.start).write_f32(zone.end);
        }
        ctx.state.write_packet(car, dw).await;
    }

    // Solo qualifying gets a one-off explanatory chat line.
    if ctx.session.current_solo_qualifying_pinned().await {
        let mut cw = PacketWriter::new();
        cw.write_u8(protocol::TCP_MESSAGE_CHAT)
            .write_u8(protocol::SERVER_CAR_ID)
            .write_utf32_string("Solo qualifying: other cars are hidden in the pits until the session ends.");
        ctx.state.write_packet(car, cw).await;
    }

    info!(car_id, "first-update sequence sent");
}

/// Handles `SessionInfo`: if the client's view of the session type disagrees
/// with the authoritative one, re-sends current session info to resync it.
pub async fn handle_session_info(ctx: &HandlerContext, addr: SocketAddr, body: &[u8]) -> CodecResult<()> {
    let Some(car_id) = ctx.state.car_by_udp(addr).await else { return Ok(()) };
    let mut r = PacketReader::new(bytes::Bytes::copy_from_slice(body));
    let client_session_type = r.read_u8()?;

    let authoritative = ctx.session.current_kind().await.wire_value();
    if client_session_type != authoritative {
        let Some(car) = ctx.state.by_id(car_id) else { return Ok(()) };
        let mut w = PacketWriter::new();
        w.write_u8(protocol::TCP_CURRENT_SESSION_INFO).write_u8(authoritative);
        ctx.state.write_packet(car, w).await;
    }
    Ok(())
}

/// Handles the one-shot UDP handshake-associate datagram: binds `addr` to the
/// `CarID` the client was assigned in its TCP handshake-success reply. This is
/// the "pre-handshake handshake-ping" exception to the unknown-address drop
/// rule — it is the only UDP message accepted from an address with no routing
/// entry yet.
pub async fn handle_udp_handshake(ctx: &HandlerContext, addr: SocketAddr, body: &[u8]) -> CodecResult<()> {
    let mut r = PacketReader::new(bytes::Bytes::copy_from_slice(body));
    let car_id = r.read_u8()?;

    let Some(car) = ctx.state.by_id(car_id) else { return Ok(()) };
    if !car.is_connected() {
        return Ok(());
    }

    ctx.state.register_udp(addr, car_id).await;
    car.inner.write().await.connection.udp_addr = Some(addr);
    Ok(())
}

/// Handles `Ping`: updates measured ping and clock offset on the car.
pub async fn handle_ping(ctx: &HandlerContext, addr: SocketAddr, body: &[u8]) -> CodecResult<()> {
    let Some(car_id) = ctx.state.car_by_udp(addr).await else { return Ok(()) };
    let Some(car) = ctx.state.by_id(car_id) else { return Ok(()) };

    let mut r = PacketReader::new(bytes::Bytes::copy_from_slice(body));
    let client_time = r.read_u32()?;
    let server_time_sent = r.read_u32()?;

    let now_ms = now_millis();
    let rtt = now_ms.saturating_sub(server_time_sent);
    let mut inner = car.inner.write().await;
    inner.connection.ping_ms = rtt;
    inner.connection.time_offset_ms = client_time as i64 - now_ms as i64;
    Ok(())
}

fn now_millis() -> u32 {
    // Server-relative clock; wraps after ~49 days, matching the wire field width.
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u32
}
