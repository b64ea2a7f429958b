//! Server state (component 4.3): the four routing maps plus block/no-join lists.

use crate::codec::PacketWriter;
use crate::data::{Car, CarId, EntryList, Guid};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;

/// One process-wide unique id per accepted TCP connection, used as the `byTCP` key
/// since raw socket handles aren't hashable the way we need.
pub type ConnId = u64;

/// State errors (§7): a car wasn't found by the routing key a caller expected to
/// resolve. UDP telemetry from an unregistered address is dropped silently rather
/// than raising this; this type is for paths where the lookup ought to succeed.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("no car registered for connection {0}")]
    UnknownConnection(ConnId),
    #[error("no car registered for guid {0}")]
    UnknownGuid(Guid),
    #[error("no car with id {0}")]
    UnknownCarId(CarId),
}

/// Generates process-wide unique `ConnId`s for newly accepted TCP connections.
#[derive(Default)]
pub struct ConnIdGenerator(AtomicU64);

impl ConnIdGenerator {
    pub fn next(&self) -> ConnId {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

#[derive(Default)]
struct Routing {
    by_tcp: HashMap<ConnId, CarId>,
    by_udp: HashMap<SocketAddr, CarId>,
    by_guid: HashMap<Guid, CarId>,
}

pub struct ServerState {
    pub entry_list: EntryList,
    routing: RwLock<Routing>,
    block_list: RwLock<HashSet<Guid>>,
    no_join_list: RwLock<HashSet<Guid>>,
}

impl ServerState {
    pub fn new(entry_list: EntryList, block_list: HashSet<Guid>) -> Self {
        Self {
            entry_list,
            routing: RwLock::new(Routing::default()),
            block_list: RwLock::new(block_list),
            no_join_list: RwLock::new(HashSet::new()),
        }
    }

    pub fn by_id(&self, car_id: CarId) -> Option<&Arc<Car>> {
        self.entry_list.get(car_id)
    }

    pub async fn register_tcp(&self, conn_id: ConnId, car_id: CarId, guid: Guid) {
        let mut routing = self.routing.write().await;
        routing.by_tcp.insert(conn_id, car_id);
        routing.by_guid.insert(guid, car_id);
    }

    pub async fn register_udp(&self, addr: SocketAddr, car_id: CarId) {
        self.routing.write().await.by_udp.insert(addr, car_id);
    }

    pub async fn car_by_tcp(&self, conn_id: ConnId) -> Option<CarId> {
        self.routing.read().await.by_tcp.get(&conn_id).copied()
    }

    pub async fn car_by_udp(&self, addr: SocketAddr) -> Option<CarId> {
        self.routing.read().await.by_udp.get(&addr).copied()
    }

    pub async fn car_by_guid(&self, guid: &str) -> Option<CarId> {
        self.routing.read().await.by_guid.get(guid).copied()
    }

    /// Unregisters every routing entry pointing at `car_id`. Called from
    /// `DisconnectCar`; never removes the GUID from the block/no-join lists.
    pub async fn unregister(&self, conn_id: ConnId, udp_addr: Option<SocketAddr>, guid: &str) {
        let mut routing = self.routing.write().await;
        routing.by_tcp.remove(&conn_id);
        if let Some(addr) = udp_addr {
            routing.by_udp.remove(&addr);
        }
        routing.by_guid.remove(guid);
    }

    pub async fn is_blocked(&self, guid: &str) -> bool {
        self.block_list.read().await.contains(guid)
    }

    pub async fn is_no_join(&self, guid: &str) -> bool {
        self.no_join_list.read().await.contains(guid)
    }

    pub async fn add_no_join(&self, guid: Guid) {
        self.no_join_list.write().await.insert(guid);
    }

    pub async fn add_block(&self, guid: Guid) {
        self.block_list.write().await.insert(guid);
    }

    /// Sends `body` as one TCP frame to every connected car.
    pub async fn broadcast_all_tcp(&self, body: PacketWriter) {
        let frame = body.into_tcp_frame();
        for car in self.entry_list.iter() {
            if !car.is_connected() {
                continue;
            }
            let tcp = {
                let inner = car.inner.read().await;
                inner.connection.tcp.clone()
            };
            let Some(tcp) = tcp else { continue };
            let mut writer = tcp.writer.lock().await;
            if let Err(err) = writer.write_all(&frame).await {
                warn!(car_id = car.car_id, error = %err, "broadcast write failed");
            }
        }
    }

    /// Sends `body` as one TCP frame to a single car, if it has a live connection.
    pub async fn write_packet(&self, car: &Car, body: PacketWriter) {
        let frame = body.into_tcp_frame();
        let tcp = {
            let inner = car.inner.read().await;
            inner.connection.tcp.clone()
        };
        let Some(tcp) = tcp else { return };
        let mut writer = tcp.writer.lock().await;
        if let Err(err) = writer.write_all(&frame).await {
            warn!(car_id = car.car_id, error = %err, "targeted write failed");
        }
    }

    pub fn connected_count(&self) -> usize {
        self.entry_list.iter().filter(|c| c.is_connected()).count()
    }

    /// Appends `guid` to the in-memory block list and the on-disk blocklist file
    /// (§6, `BlockListModeAddToList`). File I/O errors are logged, not propagated —
    /// the in-memory block still takes effect for the running process.
    pub async fn add_block_persisted(&self, guid: Guid, blocklist_file: &str) {
        self.add_block(guid.clone()).await;
        if blocklist_file.is_empty() {
            return;
        }
        let opened = tokio::fs::OpenOptions::new().create(true).append(true).open(blocklist_file).await;
        let result = match opened {
            Ok(mut file) => file.write_all(format!("{guid}\n").as_bytes()).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(error = %err, blocklist_file, "failed to append to blocklist file");
        }
    }
}

/// Reads `path` once at boot: one GUID per line, blank lines and `#`-prefixed
/// comments ignored. A missing file yields an empty block list rather than an error.
pub fn load_blocklist(path: &str) -> HashSet<Guid> {
    if path.is_empty() {
        return HashSet::new();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect(),
        Err(err) => {
            warn!(error = %err, path, "failed to read blocklist file, starting with an empty block list");
            HashSet::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Car;

    fn make_state() -> ServerState {
        let cars = vec![
            Arc::new(Car::new_slot(0, "ks_mazda_mx5_cup".into(), "red_01".into(), vec!["SM".into()])),
            Arc::new(Car::new_slot(1, "ks_mazda_mx5_cup".into(), "blue_01".into(), vec!["SM".into()])),
        ];
        ServerState::new(EntryList::new(cars), HashSet::new())
    }

    #[tokio::test]
    async fn registers_and_looks_up_by_tcp_and_guid() {
        let state = make_state();
        state.register_tcp(42, 0, "S123".into()).await;
        assert_eq!(state.car_by_tcp(42).await, Some(0));
        assert_eq!(state.car_by_guid("S123").await, Some(0));
    }

    #[tokio::test]
    async fn unregister_clears_all_maps() {
        let state = make_state();
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        state.register_tcp(1, 0, "S123".into()).await;
        state.register_udp(addr, 0).await;

        state.unregister(1, Some(addr), "S123").await;

        assert_eq!(state.car_by_tcp(1).await, None);
        assert_eq!(state.car_by_udp(addr).await, None);
        assert_eq!(state.car_by_guid("S123").await, None);
    }

    #[tokio::test]
    async fn block_list_and_no_join_list_are_independent() {
        let state = make_state();
        state.add_block("BAD1".into()).await;
        state.add_no_join("BAD2".into()).await;

        assert!(state.is_blocked("BAD1").await);
        assert!(!state.is_blocked("BAD2").await);
        assert!(state.is_no_join("BAD2").await);
        assert!(!state.is_no_join("BAD1").await);
    }
}
