//! Entry list & car state (component 4.2) and the shared data model (§3).
//!
//! `Car` owns one per-entrant lock guarding everything that mutates after
//! construction; identity fields (`car_id`, `model`, `skin`) never change within a
//! session cycle and are plain fields read without locking.

use crate::codec::Vector3F;
use crate::protocol::SERVER_CAR_ID;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

pub type CarId = u8;
pub type Guid = String;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Driver {
    pub name: String,
    pub team: String,
    pub guid: Guid,
    pub nation: String,
    pub is_admin: bool,
    #[serde(skip)]
    pub join_time: Option<Instant>,
    #[serde(skip)]
    pub load_time: Option<Instant>,
}

/// Raw last-received telemetry, as reported by the client's `CarUpdate` packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct PluginStatus {
    pub timestamp: u32,
    pub sequence: u8,
    pub position: Vector3F,
    pub rotation: Vector3F,
    pub velocity: Vector3F,
    pub tyre_angular_speed: [u8; 4],
    pub steer_angle: u8,
    pub wheel_angle: u8,
    pub engine_rpm: u16,
    pub gear_index: u8,
    pub status_bytes: u32,
    pub performance_delta: i16,
    pub gas: u8,
    pub normalised_spline_pos: f32,
}

/// What other cars are shown for this car. Equal to `PluginStatus` except during
/// solo qualifying, where it is pinned to the pit box.
pub type BroadcastStatus = PluginStatus;

#[derive(Debug, Clone)]
pub struct Lap {
    pub completed_at: Instant,
    pub lap_time_ms: u32,
    pub cuts: u32,
    pub sector_splits_ms: Vec<u32>,
    pub tyre: String,
    pub in_mandatory_pit_window: bool,
}

/// Per-session-scoped car data, reset on every session transition.
#[derive(Debug, Clone, Default)]
pub struct SessionData {
    pub laps: Vec<Lap>,
    pub best_lap_ms: Option<u32>,
    pub cuts_this_lap: u32,
    pub num_laps: u32,
    pub p2p_count: u8,
    pub mandatory_pit_done: bool,
    pub has_completed_session: bool,
    pub has_extra_lap_to_go: bool,
    pub grid_position: u8,
    pub last_lap_completed_at: Option<Instant>,
    pub total_time_ms: u64,
}

/// A live TCP connection handle: the socket write-half, guarded by a per-connection
/// mutex so frames from different tasks never interleave on the wire.
pub struct TcpHandle {
    pub writer: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    pub peer_addr: SocketAddr,
}

#[derive(Default)]
pub struct Connection {
    pub tcp: Option<Arc<TcpHandle>>,
    pub udp_addr: Option<SocketAddr>,
    pub time_offset_ms: i64,
    pub ping_ms: u32,
    pub last_udp_timestamp: u32,
    pub has_sent_first_update: bool,
    pub has_update_to_broadcast: bool,
    pub failed_checksum: bool,
}

pub struct Car {
    pub car_id: CarId,
    pub model: String,
    pub skin: String,
    pub allowed_tyres: Vec<String>,
    pub ballast_kg: f32,
    pub restrictor: f32,
    /// Pre-allocated GUID from the entry list, if this slot is reserved for a
    /// specific driver rather than open to anyone driving `model`.
    pub guid: Option<String>,

    /// True once a driver occupies this slot.
    is_connected: AtomicBool,

    pub inner: RwLock<CarInner>,
}

#[derive(Default)]
pub struct CarInner {
    pub driver: Driver,
    pub connection: Connection,
    pub plugin_status: PluginStatus,
    pub broadcast_status: BroadcastStatus,
    pub session: SessionData,
}

impl Car {
    pub fn new_slot(car_id: CarId, model: String, skin: String, allowed_tyres: Vec<String>) -> Self {
        Self {
            car_id,
            model,
            skin,
            allowed_tyres,
            ballast_kg: 0.0,
            restrictor: 0.0,
            guid: None,
            is_connected: AtomicBool::new(false),
            inner: RwLock::new(CarInner::default()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.is_connected.store(connected, Ordering::Release);
    }

    /// Lock-free snapshot safe to hand to plugin callbacks.
    pub async fn snapshot(&self) -> CarSnapshot {
        let inner = self.inner.read().await;
        CarSnapshot {
            car_id: self.car_id,
            model: self.model.clone(),
            skin: self.skin.clone(),
            driver: inner.driver.clone(),
            is_connected: self.is_connected(),
            has_sent_first_update: inner.connection.has_sent_first_update,
            num_laps: inner.session.num_laps,
            best_lap_ms: inner.session.best_lap_ms,
            has_completed_session: inner.session.has_completed_session,
            grid_position: inner.session.grid_position,
        }
    }
}

/// Lock-free snapshot of a car, handed to plugin callbacks.
#[derive(Debug, Clone)]
pub struct CarSnapshot {
    pub car_id: CarId,
    pub model: String,
    pub skin: String,
    pub driver: Driver,
    pub is_connected: bool,
    pub has_sent_first_update: bool,
    pub num_laps: u32,
    pub best_lap_ms: Option<u32>,
    pub has_completed_session: bool,
    pub grid_position: u8,
}

/// Ordered sequence of entry-list slots keyed by `CarID`. Size is fixed at
/// construction (configuration x track pit count).
pub struct EntryList {
    pub cars: Vec<Arc<Car>>,
}

impl EntryList {
    pub fn new(cars: Vec<Arc<Car>>) -> Self {
        Self { cars }
    }

    pub fn len(&self) -> usize {
        self.cars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cars.is_empty()
    }

    pub fn get(&self, car_id: CarId) -> Option<&Arc<Car>> {
        self.cars.iter().find(|c| c.car_id == car_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Car>> {
        self.cars.iter()
    }

    /// First free slot whose model matches (or, if `allow_any_model`, any free
    /// slot), skipping slots pre-allocated to a different GUID. Used by
    /// `ConnectCar`. Returns `Err(())` when the only slot(s) that would
    /// otherwise fit are reserved for a different driver's GUID, so the caller
    /// can distinguish "no slot at all" from "pre-allocated GUID mismatch".
    pub fn first_free_slot(&self, car_model: &str, guid: &str, allow_any_model: bool) -> Result<Option<&Arc<Car>>, ()> {
        let mut reserved_for_other_guid = false;
        for car in &self.cars {
            if car.is_connected() || !(allow_any_model || car.model == car_model) {
                continue;
            }
            match &car.guid {
                Some(reserved) if reserved == guid => return Ok(Some(car)),
                Some(_) => reserved_for_other_guid = true,
                None => return Ok(Some(car)),
            }
        }
        if reserved_for_other_guid {
            Err(())
        } else {
            Ok(None)
        }
    }
}

/// `ServerCarID` is never a real entry-list slot; used only for synthetic lap
/// completions that backfill a newly connected client's leaderboard view.
pub fn is_server_car_id(id: CarId) -> bool {
    id == SERVER_CAR_ID
}

/// The four session kinds the state machine cycles through.
///
/// Configuration files spell these out by name; the wire protocol encodes them as
/// the numeric `SessionType` byte via `SessionKind::wire_value`, independent of
/// this enum's `serde` representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    Booking,
    Practice,
    Qualifying,
    Race,
    /// Wire value 4. Behaves identically to `Practice` in every session-manager
    /// branch; the real client distinguishes it only for its own UI label.
    ChampionshipPractice,
}

impl SessionKind {
    pub fn wire_value(self) -> u8 {
        match self {
            SessionKind::Booking => 0,
            SessionKind::Practice => 1,
            SessionKind::Qualifying => 2,
            SessionKind::Race => 3,
            SessionKind::ChampionshipPractice => 4,
        }
    }

    pub fn from_wire_value(v: u8) -> Option<Self> {
        match v {
            0 => Some(SessionKind::Booking),
            1 => Some(SessionKind::Practice),
            2 => Some(SessionKind::Qualifying),
            3 => Some(SessionKind::Race),
            4 => Some(SessionKind::ChampionshipPractice),
            _ => None,
        }
    }
}

/// The session lifecycle state shared by every `SessionKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    WaitingForWait,
    Green,
    Finishing,
    Advancing,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub kind: SessionKind,
    pub name: String,
    /// Duration in seconds, for time-limited sessions (Practice/Qualifying, or
    /// Race when `laps` is zero).
    pub time_seconds: u32,
    pub laps: u32,
    pub is_open: bool,
    pub wait_time_seconds: u32,
    pub is_solo: bool,
}

pub struct CurrentSession {
    pub index: usize,
    pub config: SessionConfig,
    pub phase: SessionPhase,
    pub started_at: Instant,
    pub move_to_next_at: Option<Instant>,
    pub session_over_broadcast_sent: bool,
    pub reverse_grid_race_started: bool,
    pub num_completed_laps: u32,
}

impl CurrentSession {
    pub fn new(index: usize, config: SessionConfig) -> Self {
        Self {
            index,
            config,
            phase: SessionPhase::WaitingForWait,
            started_at: Instant::now(),
            move_to_next_at: None,
            session_over_broadcast_sent: false,
            reverse_grid_race_started: false,
            num_completed_laps: 0,
        }
    }
}

/// A single leaderboard row, derived from a car's session data; not stored, only
/// computed on demand by the session manager's comparator rules.
#[derive(Debug, Clone)]
pub struct LeaderboardEntry {
    pub car_id: CarId,
    pub num_laps: u32,
    pub best_lap_ms: Option<u32>,
    pub total_time_ms: u64,
    pub has_completed_session: bool,
}

/// Sorts `entries` per the rules for `kind`: Race orders by laps desc then total
/// time asc; Practice/Qualifying order by best lap asc (cars with no lap last, in
/// original entry order).
pub fn sort_leaderboard(entries: &mut [LeaderboardEntry], kind: SessionKind) {
    match kind {
        SessionKind::Race => entries.sort_by(|a, b| {
            b.num_laps
                .cmp(&a.num_laps)
                .then_with(|| a.total_time_ms.cmp(&b.total_time_ms))
        }),
        SessionKind::Practice | SessionKind::Qualifying | SessionKind::Booking | SessionKind::ChampionshipPractice => {
            entries.sort_by(|a, b| match (a.best_lap_ms, b.best_lap_ms) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            })
        }
    }
}

/// Reverses the grid for the second race of a reverse-grid event: the top `k`
/// finishers of `leaderboard` are reversed in place, the remainder keep their order.
///
/// The reversal window truncates at the first non-finisher encountered within
/// the first `k` entries, so a DNF never gets pulled to the front of the grid.
pub fn reverse_leaderboard(k: usize, leaderboard: &[LeaderboardEntry]) -> Vec<LeaderboardEntry> {
    let mut k = k.min(leaderboard.len());
    for (i, entry) in leaderboard.iter().take(k).enumerate() {
        if !entry.has_completed_session {
            k = i;
            break;
        }
    }

    let mut out = Vec::with_capacity(leaderboard.len());
    out.extend(leaderboard[..k].iter().rev().cloned());
    out.extend(leaderboard[k..].iter().cloned());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_car(id: CarId) -> Car {
        Car::new_slot(id, "ks_mazda_mx5_cup".into(), "red_01".into(), vec!["SM".into()])
    }

    #[test]
    fn entry_list_finds_free_slot_matching_model() {
        let cars = vec![Arc::new(make_car(0)), Arc::new(make_car(1))];
        cars[0].set_connected(true);
        let list = EntryList::new(cars);

        let slot = list.first_free_slot("ks_mazda_mx5_cup", "guid-1", false).unwrap().unwrap();
        assert_eq!(slot.car_id, 1);
    }

    #[test]
    fn entry_list_returns_none_when_full() {
        let cars = vec![Arc::new(make_car(0))];
        cars[0].set_connected(true);
        let list = EntryList::new(cars);

        assert!(list.first_free_slot("ks_mazda_mx5_cup", "guid-1", false).unwrap().is_none());
    }

    #[test]
    fn entry_list_matches_pre_allocated_guid_to_its_reserved_slot() {
        let mut reserved = make_car(0);
        reserved.guid = Some("driver-guid".into());
        let cars = vec![Arc::new(reserved), Arc::new(make_car(1))];
        let list = EntryList::new(cars);

        let slot = list.first_free_slot("ks_mazda_mx5_cup", "driver-guid", false).unwrap().unwrap();
        assert_eq!(slot.car_id, 0);
    }

    #[test]
    fn entry_list_rejects_guid_mismatch_on_a_reserved_slot() {
        let mut reserved = make_car(0);
        reserved.guid = Some("owner-guid".into());
        let cars = vec![Arc::new(reserved)];
        let list = EntryList::new(cars);

        assert!(list.first_free_slot("ks_mazda_mx5_cup", "someone-else", false).is_err());
    }

    #[tokio::test]
    async fn snapshot_reflects_session_data() {
        let car = make_car(3);
        {
            let mut inner = car.inner.write().await;
            inner.session.num_laps = 4;
            inner.session.best_lap_ms = Some(91_234);
        }

        let snap = car.snapshot().await;
        assert_eq!(snap.car_id, 3);
        assert_eq!(snap.num_laps, 4);
        assert_eq!(snap.best_lap_ms, Some(91_234));
    }

    #[test]
    fn server_car_id_is_recognised() {
        assert!(is_server_car_id(SERVER_CAR_ID));
        assert!(!is_server_car_id(0));
    }

    #[test]
    fn race_leaderboard_orders_by_laps_then_time() {
        let mut entries = vec![
            LeaderboardEntry { car_id: 0, num_laps: 5, best_lap_ms: Some(90_000), total_time_ms: 500_000, has_completed_session: true },
            LeaderboardEntry { car_id: 1, num_laps: 6, best_lap_ms: Some(91_000), total_time_ms: 480_000, has_completed_session: true },
            LeaderboardEntry { car_id: 2, num_laps: 6, best_lap_ms: Some(89_000), total_time_ms: 470_000, has_completed_session: true },
        ];
        sort_leaderboard(&mut entries, SessionKind::Race);
        assert_eq!(entries.iter().map(|e| e.car_id).collect::<Vec<_>>(), vec![2, 1, 0]);
    }

    #[test]
    fn qualifying_leaderboard_orders_by_best_lap_no_lap_last() {
        let mut entries = vec![
            LeaderboardEntry { car_id: 0, num_laps: 1, best_lap_ms: None, total_time_ms: 0, has_completed_session: false },
            LeaderboardEntry { car_id: 1, num_laps: 2, best_lap_ms: Some(85_000), total_time_ms: 0, has_completed_session: false },
            LeaderboardEntry { car_id: 2, num_laps: 1, best_lap_ms: Some(84_500), total_time_ms: 0, has_completed_session: false },
        ];
        sort_leaderboard(&mut entries, SessionKind::Qualifying);
        assert_eq!(entries.iter().map(|e| e.car_id).collect::<Vec<_>>(), vec![2, 1, 0]);
    }

    #[test]
    fn reverse_leaderboard_flips_only_top_k_when_all_finished() {
        let leaderboard = vec![
            LeaderboardEntry { car_id: 0, num_laps: 10, best_lap_ms: None, total_time_ms: 0, has_completed_session: true },
            LeaderboardEntry { car_id: 1, num_laps: 10, best_lap_ms: None, total_time_ms: 0, has_completed_session: true },
            LeaderboardEntry { car_id: 2, num_laps: 10, best_lap_ms: None, total_time_ms: 0, has_completed_session: true },
            LeaderboardEntry { car_id: 3, num_laps: 10, best_lap_ms: None, total_time_ms: 0, has_completed_session: true },
        ];
        let reversed = reverse_leaderboard(2, &leaderboard);
        assert_eq!(reversed.iter().map(|e| e.car_id).collect::<Vec<_>>(), vec![1, 0, 2, 3]);
    }

    #[test]
    fn reverse_leaderboard_truncates_at_first_non_finisher() {
        // Requested window is 3, but car 1 (2nd place) didn't finish, so only
        // the top 1 actually reverses (a no-op) and the rest is untouched.
        let leaderboard = vec![
            LeaderboardEntry { car_id: 0, num_laps: 10, best_lap_ms: None, total_time_ms: 0, has_completed_session: true },
            LeaderboardEntry { car_id: 1, num_laps: 8, best_lap_ms: None, total_time_ms: 0, has_completed_session: false },
            LeaderboardEntry { car_id: 2, num_laps: 10, best_lap_ms: None, total_time_ms: 0, has_completed_session: true },
            LeaderboardEntry { car_id: 3, num_laps: 10, best_lap_ms: None, total_time_ms: 0, has_completed_session: true },
        ];
        let reversed = reverse_leaderboard(3, &leaderboard);
        assert_eq!(reversed.iter().map(|e| e.car_id).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn reverse_leaderboard_with_negative_k_reverses_all_finishers_only() {
        let leaderboard = vec![
            LeaderboardEntry { car_id: 0, num_laps: 10, best_lap_ms: None, total_time_ms: 0, has_completed_session: true },
            LeaderboardEntry { car_id: 1, num_laps: 10, best_lap_ms: None, total_time_ms: 0, has_completed_session: true },
            LeaderboardEntry { car_id: 2, num_laps: 9, best_lap_ms: None, total_time_ms: 0, has_completed_session: false },
            LeaderboardEntry { car_id: 3, num_laps: 10, best_lap_ms: None, total_time_ms: 0, has_completed_session: true },
        ];
        let reversed = reverse_leaderboard(leaderboard.len(), &leaderboard);
        assert_eq!(reversed.iter().map(|e| e.car_id).collect::<Vec<_>>(), vec![1, 0, 2, 3]);
    }
}
