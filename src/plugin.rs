//! Plugin event bus (component 4.10): a fixed capability set fired from a bounded
//! worker pool so a slow or erroring plugin can't stall the session tick.

use crate::data::{CarSnapshot, LeaderboardEntry};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::warn;

const PLUGIN_CALL_SOFT_DEADLINE: Duration = Duration::from_secs(2);
const PLUGIN_WORKER_PERMITS: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct CollisionEvent {
    pub car_id: u8,
    pub other_car_id: Option<u8>,
    pub speed_mps: f32,
}

/// The fixed set of callbacks the server fires. Every method has a default no-op
/// body so implementors only override what they need; `SortLeaderboard` is the one
/// callback with an observable return value (an override changes broadcast order).
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn on_new_connection(&self, _car: CarSnapshot) {}
    async fn on_connection_closed(&self, _car: CarSnapshot) {}
    async fn on_new_session(&self, _session_index: usize) {}
    async fn on_end_session(&self, _results_filename: &str) {}
    async fn on_client_loaded(&self, _car_id: u8) {}
    async fn on_lap_completed(&self, _car_id: u8, _lap_time_ms: u32) {}
    async fn on_sector_completed(&self, _car_id: u8, _sector: u32, _split_ms: u32) {}
    async fn on_car_update(&self, _car_id: u8) {}
    async fn on_chat(&self, _car_id: u8, _message: &str) {}
    async fn on_collision_with_car(&self, _event: CollisionEvent) {}
    async fn on_collision_with_env(&self, _car_id: u8, _speed_mps: f32) {}
    async fn on_weather_change(&self, _graphics: &str) {}
    async fn on_tyre_change(&self, _car_id: u8, _tyre: &str) {}
    async fn on_version(&self, _version: u16) {}
    async fn on_client_event(&self, _car_id: u8, _event_name: &str) {}

    /// Optional leaderboard override. Returning `None` (the default) leaves the
    /// server's own comparator rules in effect.
    fn sort_leaderboard(&self, _entries: &[LeaderboardEntry]) -> Option<Vec<LeaderboardEntry>> {
        None
    }
}

/// The default attached plugin: every callback is the trait's no-op default.
pub struct NullPlugin;

#[async_trait]
impl Plugin for NullPlugin {}

/// Fans plugin callbacks out onto a bounded worker pool. Callbacks that exceed
/// the soft deadline are logged, not cancelled — the original message dispatch is
/// never blocked on plugin completion either way, since `fire` returns immediately.
pub struct PluginBus {
    plugin: Arc<dyn Plugin>,
    permits: Arc<Semaphore>,
}

impl PluginBus {
    pub fn new(plugin: Arc<dyn Plugin>) -> Self {
        Self {
            plugin,
            permits: Arc::new(Semaphore::new(PLUGIN_WORKER_PERMITS)),
        }
    }

    pub fn null() -> Self {
        Self::new(Arc::new(NullPlugin))
    }

    /// Spawns `call` on the worker pool, logging (never propagating) errors and a
    /// soft-deadline overrun.
    pub fn fire<F, Fut>(&self, label: &'static str, call: F)
    where
        F: FnOnce(Arc<dyn Plugin>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let plugin = self.plugin.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let started = tokio::time::Instant::now();
            call(plugin).await;
            if started.elapsed() > PLUGIN_CALL_SOFT_DEADLINE {
                warn!(callback = label, elapsed_ms = started.elapsed().as_millis() as u64, "plugin callback exceeded soft deadline");
            }
        });
    }

    pub fn plugin(&self) -> Arc<dyn Plugin> {
        self.plugin.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Flag(Arc<AtomicBool>);

    #[async_trait]
    impl Plugin for Flag {
        async fn on_client_loaded(&self, _car_id: u8) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn fire_invokes_the_callback_asynchronously() {
        let flag = Arc::new(AtomicBool::new(false));
        let bus = PluginBus::new(Arc::new(Flag(flag.clone())));

        bus.fire("on_client_loaded", move |plugin| async move {
            plugin.on_client_loaded(3).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn null_plugin_never_panics_on_any_callback() {
        let bus = PluginBus::null();
        bus.fire("on_chat", |plugin| async move {
            plugin.on_chat(0, "hello").await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn default_sort_leaderboard_defers_to_server() {
        assert!(NullPlugin.sort_leaderboard(&[]).is_none());
    }
}
