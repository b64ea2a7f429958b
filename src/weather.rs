//! Weather manager (component 4.6): scheduled configs with linear blending.

use crate::config::WeatherConfig;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeatherSample {
    pub ambient_c: f32,
    pub road_c: f32,
    pub wind_speed: f32,
    pub wind_direction: f32,
}

const DEFAULT_BLEND_WINDOW_SECONDS: f32 = 60.0;

pub struct WeatherManager {
    schedule: Vec<WeatherConfig>,
    state: RwLock<State>,
}

struct State {
    active_index: Option<usize>,
    sample: WeatherSample,
    /// Set when blending into the next scheduled config; `(from, to, elapsed_s)`.
    blend: Option<(WeatherSample, WeatherSample, f32)>,
}

impl WeatherManager {
    pub fn new(schedule: Vec<WeatherConfig>) -> Self {
        Self {
            schedule,
            state: RwLock::new(State {
                active_index: None,
                sample: WeatherSample {
                    ambient_c: 20.0,
                    road_c: 24.0,
                    wind_speed: 0.0,
                    wind_direction: 0.0,
                },
                blend: None,
            }),
        }
    }

    pub async fn current(&self) -> WeatherSample {
        self.state.read().await.sample
    }

    /// Graphics name of the currently active scheduled config, if any is active.
    pub async fn current_graphics(&self) -> Option<String> {
        let state = self.state.read().await;
        state.active_index.map(|idx| self.schedule[idx].graphics.clone())
    }

    /// Picks the first scheduled config whose `sessions` list contains
    /// `session_index`, samples concrete values with `random_unit` in [0, 1)
    /// supplied by the caller, and starts a fresh (non-blending) sample.
    pub async fn on_session_start(&self, session_index: u32, random_unit: f32) {
        let picked = self
            .schedule
            .iter()
            .position(|cfg| cfg.sessions.is_empty() || cfg.sessions.contains(&session_index));

        let mut state = self.state.write().await;
        state.blend = None;
        state.active_index = picked;

        let Some(idx) = picked else { return };
        let cfg = &self.schedule[idx];
        state.sample = sample_from_config(cfg, random_unit);
        info!(graphics = %cfg.graphics, "weather selected for session");
    }

    /// Advances blending toward the next scheduled config if the active one's
    /// `duration_seconds` has elapsed. `elapsed_seconds` is time since session
    /// start. Returns `true` once a blend completes, so the caller can fire
    /// `OnWeatherChange` and broadcast the new sample.
    pub async fn tick(&self, elapsed_seconds: f32, random_unit: f32) -> bool {
        let mut state = self.state.write().await;
        let Some(idx) = state.active_index else { return false };
        let duration_seconds = self.schedule[idx].duration_seconds;

        if duration_seconds <= 0.0 || elapsed_seconds < duration_seconds {
            return false;
        }

        let next_idx = (idx + 1) % self.schedule.len().max(1);
        if next_idx == idx || self.schedule.is_empty() {
            return false;
        }

        if state.blend.is_none() {
            let from = state.sample;
            let to = sample_from_config(&self.schedule[next_idx], random_unit);
            state.blend = Some((from, to, 0.0));
        }

        if let Some((from, to, blended_s)) = state.blend.as_mut() {
            *blended_s += elapsed_seconds - duration_seconds;
            let t = (*blended_s / DEFAULT_BLEND_WINDOW_SECONDS).clamp(0.0, 1.0);
            state.sample = lerp_sample(*from, *to, t);
            if t >= 1.0 {
                state.active_index = Some(next_idx);
                state.blend = None;
                info!("weather blend complete, advanced to next scheduled config");
                return true;
            }
        }
        false
    }
}

fn sample_from_config(cfg: &WeatherConfig, random_unit: f32) -> WeatherSample {
    let r = random_unit.clamp(0.0, 1.0);
    WeatherSample {
        ambient_c: cfg.base_temperature_ambient + (r * 2.0 - 1.0) * cfg.variation_ambient,
        road_c: cfg.base_temperature_road + (r * 2.0 - 1.0) * cfg.variation_road,
        wind_speed: cfg.wind_base_speed_min + r * (cfg.wind_base_speed_max - cfg.wind_base_speed_min),
        wind_direction: cfg.wind_base_direction + (r * 2.0 - 1.0) * cfg.wind_variation_direction,
    }
}

fn lerp_sample(from: WeatherSample, to: WeatherSample, t: f32) -> WeatherSample {
    WeatherSample {
        ambient_c: from.ambient_c + (to.ambient_c - from.ambient_c) * t,
        road_c: from.road_c + (to.road_c - from.road_c) * t,
        wind_speed: from.wind_speed + (to.wind_speed - from.wind_speed) * t,
        wind_direction: from.wind_direction + (to.wind_direction - from.wind_direction) * t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(graphics: &str, sessions: Vec<u32>) -> WeatherConfig {
        WeatherConfig {
            graphics: graphics.into(),
            duration_seconds: 0.0,
            base_temperature_ambient: 20.0,
            base_temperature_road: 26.0,
            variation_ambient: 0.0,
            variation_road: 0.0,
            wind_base_speed_min: 0.0,
            wind_base_speed_max: 0.0,
            wind_base_direction: 0.0,
            wind_variation_direction: 0.0,
            sessions,
        }
    }

    #[tokio::test]
    async fn picks_config_matching_session_index() {
        let mgr = WeatherManager::new(vec![cfg("3_clear", vec![0]), cfg("7_rain", vec![1])]);
        mgr.on_session_start(1, 0.5).await;
        let sample = mgr.current().await;
        assert_eq!(sample.ambient_c, 20.0);
        assert_eq!(sample.road_c, 26.0);
    }

    #[tokio::test]
    async fn no_match_leaves_sample_unset() {
        let mgr = WeatherManager::new(vec![cfg("3_clear", vec![5])]);
        mgr.on_session_start(1, 0.0).await;
        assert_eq!(mgr.state.read().await.active_index, None);
    }

    #[tokio::test]
    async fn tick_blends_toward_next_config_over_window() {
        let mut clear = cfg("3_clear", vec![0]);
        clear.duration_seconds = 1.0;
        let mut rainy = cfg("7_rain", vec![1]);
        rainy.base_temperature_ambient = 10.0;
        let mgr = WeatherManager::new(vec![clear, rainy]);
        mgr.on_session_start(0, 0.0).await;

        let changed = mgr.tick(DEFAULT_BLEND_WINDOW_SECONDS + 1.0, 0.5).await;
        assert!(!changed);
        let blended = mgr.current().await;
        assert!(blended.ambient_c < 20.0);

        let changed = mgr.tick(DEFAULT_BLEND_WINDOW_SECONDS + 1.0 + DEFAULT_BLEND_WINDOW_SECONDS, 0.5).await;
        assert!(changed);
        let final_sample = mgr.current().await;
        assert_eq!(final_sample.ambient_c, 10.0);
    }
}
