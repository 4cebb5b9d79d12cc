//! On-disk artifact catalogue. Every record is JSON, written to a sibling
//! temp file first and renamed into place.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::TrainerError;
use crate::features::{GameDifferentialRow, TeamGameRow};
use crate::models::ann::AnnArtifact;
use crate::temporal::WeekKey;
use crate::training_state::CURRENT_REVISION;

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("failed to move {} into place", path.display()))?;
    Ok(())
}

/// `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Like [`read_json`] but a missing file is [`TrainerError::MissingArtifact`].
pub fn require_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    read_json(path)?.ok_or_else(|| TrainerError::missing(path).into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeekStatus {
    Trained,
    Cached,
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMarker {
    pub season: i32,
    pub week: u32,
    pub revision: String,
    pub status: WeekStatus,
    pub completed_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMarker {
    pub start_season: i32,
    pub end_season: i32,
    pub revision: String,
    pub seasons: Vec<i32>,
    pub completed_at: String,
}

/// Feature rows built for one season (with the prior season as context).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeasonCache {
    pub season: i32,
    pub revision: String,
    pub team_rows: Vec<TeamGameRow>,
    pub diff_rows: Vec<GameDifferentialRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnCheckpoint {
    pub trained_for: WeekKey,
    pub revision: String,
    pub ann: AnnArtifact,
}

/// Root of one artifact tree and the naming rules under it.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn weekly(&self, prefix: &str, week: WeekKey) -> PathBuf {
        self.root
            .join(format!("{prefix}_{}_W{:02}.json", week.season, week.week))
    }

    pub fn predictions_path(&self, week: WeekKey) -> PathBuf {
        self.weekly("predictions", week)
    }

    pub fn model_path(&self, week: WeekKey) -> PathBuf {
        self.weekly("model", week)
    }

    pub fn diagnostics_path(&self, week: WeekKey) -> PathBuf {
        self.weekly("diagnostics", week)
    }

    pub fn outcomes_path(&self, week: WeekKey) -> PathBuf {
        self.weekly("outcomes", week)
    }

    pub fn metrics_path(&self, week: WeekKey) -> PathBuf {
        self.weekly("metrics", week)
    }

    pub fn hybrid_path(&self, week: WeekKey) -> PathBuf {
        self.weekly("hybrid", week)
    }

    pub fn rollup_path(&self, season: i32) -> PathBuf {
        self.root.join(format!("season_{season}_rollup.json"))
    }

    pub fn training_state_path(&self) -> PathBuf {
        self.root.join("training_state.json")
    }

    pub fn status_path(&self, week: WeekKey) -> PathBuf {
        self.root
            .join("status")
            .join(format!("{}_W{:02}.json", week.season, week.week))
    }

    pub fn chunk_path(&self, start: i32, end: i32) -> PathBuf {
        self.root
            .join("chunks")
            .join(format!("chunk_{start}_{end}.json"))
    }

    pub fn season_cache_path(&self, season: i32) -> PathBuf {
        self.root
            .join("seasons")
            .join(format!("season_{season}.json"))
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.root.join("checkpoints").join("ann_latest.json")
    }

    /// Written only after the week's full artifact set is on disk.
    pub fn write_status(&self, week: WeekKey, status: WeekStatus) -> Result<StatusMarker> {
        let marker = StatusMarker {
            season: week.season,
            week: week.week,
            revision: CURRENT_REVISION.to_string(),
            status,
            completed_at: Utc::now().to_rfc3339(),
        };
        write_json_atomic(&self.status_path(week), &marker)?;
        Ok(marker)
    }

    /// Marker for `week` under the running revision, if any.
    pub fn status(&self, week: WeekKey) -> Result<Option<StatusMarker>> {
        let marker: Option<StatusMarker> = read_json(&self.status_path(week))?;
        Ok(marker.filter(|m| current(&m.revision, "status marker")))
    }

    pub fn write_chunk_marker(&self, start: i32, end: i32, seasons: Vec<i32>) -> Result<()> {
        let marker = ChunkMarker {
            start_season: start,
            end_season: end,
            revision: CURRENT_REVISION.to_string(),
            seasons,
            completed_at: Utc::now().to_rfc3339(),
        };
        write_json_atomic(&self.chunk_path(start, end), &marker)
    }

    pub fn chunk_marker(&self, start: i32, end: i32) -> Result<Option<ChunkMarker>> {
        let marker: Option<ChunkMarker> = read_json(&self.chunk_path(start, end))?;
        Ok(marker.filter(|m| current(&m.revision, "chunk marker")))
    }

    pub fn write_season_cache(
        &self,
        season: i32,
        team_rows: &[TeamGameRow],
        diff_rows: &[GameDifferentialRow],
    ) -> Result<()> {
        let cache = SeasonCache {
            season,
            revision: CURRENT_REVISION.to_string(),
            team_rows: team_rows.to_vec(),
            diff_rows: diff_rows.to_vec(),
        };
        write_json_atomic(&self.season_cache_path(season), &cache)
    }

    pub fn season_cache(&self, season: i32) -> Result<Option<SeasonCache>> {
        let cache: Option<SeasonCache> = read_json(&self.season_cache_path(season))?;
        Ok(cache.filter(|c| current(&c.revision, "season cache")))
    }

    pub fn write_checkpoint(&self, trained_for: WeekKey, ann: &AnnArtifact) -> Result<()> {
        let checkpoint = AnnCheckpoint {
            trained_for,
            revision: CURRENT_REVISION.to_string(),
            ann: ann.clone(),
        };
        write_json_atomic(&self.checkpoint_path(), &checkpoint)
    }

    pub fn checkpoint(&self) -> Result<Option<AnnCheckpoint>> {
        let checkpoint: Option<AnnCheckpoint> = read_json(&self.checkpoint_path())?;
        Ok(checkpoint.filter(|c| current(&c.revision, "ann checkpoint")))
    }
}

fn current(revision: &str, what: &str) -> bool {
    let ok = revision == CURRENT_REVISION;
    if !ok {
        debug!(found = revision, expected = CURRENT_REVISION, "ignoring stale {what}");
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weekly_names_are_zero_padded() {
        let store = ArtifactStore::new("/tmp/a");
        let week = WeekKey::new(2023, 5);
        assert_eq!(
            store.predictions_path(week),
            PathBuf::from("/tmp/a/predictions_2023_W05.json")
        );
        assert_eq!(
            store.status_path(week),
            PathBuf::from("/tmp/a/status/2023_W05.json")
        );
        assert_eq!(
            store.chunk_path(1999, 2001),
            PathBuf::from("/tmp/a/chunks/chunk_1999_2001.json")
        );
        assert_eq!(
            store.rollup_path(2023),
            PathBuf::from("/tmp/a/season_2023_rollup.json")
        );
    }

    #[test]
    fn atomic_write_leaves_no_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("value.json");
        write_json_atomic(&path, &vec![1, 2, 3]).expect("write");
        let back: Option<Vec<i32>> = read_json(&path).expect("read");
        assert_eq!(back, Some(vec![1, 2, 3]));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn missing_required_artifact_is_typed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = require_json::<Vec<i32>>(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainerError>(),
            Some(TrainerError::MissingArtifact { .. })
        ));
    }

    #[test]
    fn stale_markers_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let week = WeekKey::new(2001, 3);
        store.write_status(week, WeekStatus::Trained).expect("write");
        assert_eq!(
            store.status(week).expect("read").map(|m| m.status),
            Some(WeekStatus::Trained)
        );

        let stale = StatusMarker {
            season: 2001,
            week: 3,
            revision: "ensemble-2019.1".to_string(),
            status: WeekStatus::Trained,
            completed_at: Utc::now().to_rfc3339(),
        };
        write_json_atomic(&store.status_path(week), &stale).expect("write");
        assert_eq!(store.status(week).expect("read"), None);
    }
}
