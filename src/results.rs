//! Persisted session results (§6): one JSON file per non-empty session, written
//! under the configured base directory. The filename is the value handed back to
//! `Plugin::on_end_session`.

use crate::data::{LeaderboardEntry, SessionKind};
use serde::Serialize;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResultsError {
    #[error("failed to write results file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize)]
pub struct SessionResult {
    pub session_index: usize,
    pub session_name: String,
    pub session_kind: SessionKind,
    pub written_at_unix_ms: u128,
    pub leaderboard: Vec<ResultRow>,
}

#[derive(Debug, Serialize)]
pub struct ResultRow {
    pub car_id: u8,
    pub num_laps: u32,
    pub best_lap_ms: Option<u32>,
    pub total_time_ms: u64,
    pub has_completed_session: bool,
}

impl From<&LeaderboardEntry> for ResultRow {
    fn from(e: &LeaderboardEntry) -> Self {
        Self {
            car_id: e.car_id,
            num_laps: e.num_laps,
            best_lap_ms: e.best_lap_ms,
            total_time_ms: e.total_time_ms,
            has_completed_session: e.has_completed_session,
        }
    }
}

/// Writes `leaderboard` as one results JSON file under `base_dir`, skipping the
/// write entirely for an empty leaderboard (mirrors "one results JSON per
/// non-empty session"). Returns the filename handed to `OnEndSession`, or `None`
/// if nothing was written.
pub async fn write_session_result(
    base_dir: &str,
    session_index: usize,
    session_name: &str,
    session_kind: SessionKind,
    leaderboard: &[LeaderboardEntry],
) -> Result<Option<String>, ResultsError> {
    if leaderboard.is_empty() {
        return Ok(None);
    }

    tokio::fs::create_dir_all(base_dir).await.map_err(|source| ResultsError::Io {
        path: base_dir.to_string(),
        source,
    })?;

    let written_at_unix_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
    let result = SessionResult {
        session_index,
        session_name: session_name.to_string(),
        session_kind,
        written_at_unix_ms,
        leaderboard: leaderboard.iter().map(ResultRow::from).collect(),
    };

    let filename = format!("session_{session_index}_{session_name}.json");
    let path = Path::new(base_dir).join(&filename);
    let body = serde_json::to_vec_pretty(&result).expect("SessionResult serializes infallibly");
    tokio::fs::write(&path, body).await.map_err(|source| ResultsError::Io {
        path: path.display().to_string(),
        source,
    })?;

    Ok(Some(filename))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(car_id: u8) -> LeaderboardEntry {
        LeaderboardEntry {
            car_id,
            num_laps: 5,
            best_lap_ms: Some(90_000),
            total_time_ms: 450_000,
            has_completed_session: true,
        }
    }

    #[tokio::test]
    async fn empty_leaderboard_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let filename = write_session_result(dir.path().to_str().unwrap(), 0, "Race", SessionKind::Race, &[])
            .await
            .unwrap();
        assert!(filename.is_none());
    }

    #[tokio::test]
    async fn non_empty_leaderboard_writes_a_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let leaderboard = vec![row(0), row(1)];
        let filename = write_session_result(dir.path().to_str().unwrap(), 2, "Race", SessionKind::Race, &leaderboard)
            .await
            .unwrap()
            .expect("should write a file");

        let contents = tokio::fs::read_to_string(dir.path().join(&filename)).await.unwrap();
        assert!(contents.contains("\"car_id\": 0"));
    }
}
