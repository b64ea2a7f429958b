//! Dynamic track grip model (component 4.5).

use crate::config::DynamicTrackConfig;
use tokio::sync::RwLock;

pub struct DynamicTrack {
    config: DynamicTrackConfig,
    state: RwLock<State>,
}

struct State {
    current_grip: f32,
    session_start_grip: f32,
}

impl DynamicTrack {
    pub fn new(config: DynamicTrackConfig) -> Self {
        Self {
            config,
            state: RwLock::new(State {
                current_grip: 0.0,
                session_start_grip: 0.0,
            }),
        }
    }

    pub async fn current_grip(&self) -> f32 {
        self.state.read().await.current_grip
    }

    /// `random_unit` is a caller-supplied value in [0, 1) (the server's PRNG),
    /// kept out of this module so grip math stays deterministic and testable.
    pub async fn on_session_start(&self, random_unit: f32) {
        let start = self.config.session_start_percent as f32 / 100.0;
        let randomness = self.config.randomness_percent as f32 / 100.0;
        let grip = (start + random_unit.clamp(0.0, 1.0) * randomness).clamp(0.0, 1.0);

        let mut state = self.state.write().await;
        state.current_grip = grip;
        state.session_start_grip = grip;
    }

    pub async fn on_lap_completed(&self) {
        let gain = if self.config.lap_gain_percent == 0 {
            0.0
        } else {
            0.01 / (self.config.lap_gain_percent as f32 / 100.0)
        };

        let mut state = self.state.write().await;
        state.current_grip = (state.current_grip + gain).clamp(0.0, 1.0);
    }

    /// Carries grip forward into the next session, decaying the gain made during
    /// this session by `session_transfer_percent`. Skipped for the reverse-grid
    /// second race, which keeps the grip level the first race ended at.
    pub async fn on_session_transition(&self, is_reverse_grid_replay: bool) {
        if is_reverse_grid_replay {
            return;
        }
        let transfer = self.config.session_transfer_percent as f32 / 100.0;

        let mut state = self.state.write().await;
        let gained = state.current_grip - state.session_start_grip;
        let next_start = (state.current_grip - gained * (1.0 - transfer)).clamp(0.0, 1.0);
        state.current_grip = next_start;
        state.session_start_grip = next_start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> DynamicTrackConfig {
        DynamicTrackConfig {
            session_start_percent: 90,
            randomness_percent: 10,
            session_transfer_percent: 80,
            lap_gain_percent: 100,
        }
    }

    #[tokio::test]
    async fn session_start_falls_within_configured_band() {
        let track = DynamicTrack::new(cfg());
        track.on_session_start(0.0).await;
        assert!((track.current_grip().await - 0.90).abs() < 1e-6);

        track.on_session_start(1.0).await;
        assert!((track.current_grip().await - 1.00).abs() < 1e-6);
    }

    #[tokio::test]
    async fn lap_completion_increases_grip() {
        let track = DynamicTrack::new(cfg());
        track.on_session_start(0.0).await;
        let before = track.current_grip().await;
        track.on_lap_completed().await;
        assert!(track.current_grip().await > before);
    }

    #[tokio::test]
    async fn grip_never_exceeds_one() {
        let track = DynamicTrack::new(DynamicTrackConfig {
            session_start_percent: 100,
            randomness_percent: 50,
            session_transfer_percent: 100,
            lap_gain_percent: 1,
        });
        track.on_session_start(1.0).await;
        for _ in 0..50 {
            track.on_lap_completed().await;
        }
        assert!(track.current_grip().await <= 1.0);
    }

    #[tokio::test]
    async fn session_transition_carries_partial_gain_forward() {
        let track = DynamicTrack::new(cfg());
        track.on_session_start(0.0).await;
        for _ in 0..5 {
            track.on_lap_completed().await;
        }
        let grip_before_transition = track.current_grip().await;
        track.on_session_transition(false).await;
        let carried = track.current_grip().await;

        assert!(carried <= grip_before_transition);
        assert!(carried >= 0.90);
    }

    #[tokio::test]
    async fn reverse_grid_replay_skips_decay() {
        let track = DynamicTrack::new(cfg());
        track.on_session_start(0.0).await;
        track.on_lap_completed().await;
        let grip_before = track.current_grip().await;

        track.on_session_transition(true).await;
        assert_eq!(track.current_grip().await, grip_before);
    }
}
