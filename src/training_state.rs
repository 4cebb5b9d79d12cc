//! Revision-stamped record of completed historical coverage.
//!
//! The record is read and written only through [`TrainingStateStore`]; the
//! only two ways to change it are [`mark_bootstrap_completed`] and
//! [`record_latest_run`], both of which return a new state.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::artifacts::write_json_atomic;
use crate::error::TrainerError;
use crate::temporal::WeekKey;

/// Bump when artifacts or features change shape; invalidates all coverage.
pub const CURRENT_REVISION: &str = "ensemble-2024.3";
pub const MODEL_TRAINING: &str = "model_training";
pub const HYBRID_V2: &str = "hybrid_v2";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonCoverage {
    pub season: i32,
    /// Weeks replayed to a status marker.
    pub weeks: Vec<u32>,
    /// Weeks the season's schedule holds. The season counts as covered only
    /// once every one of them is in `weeks`.
    #[serde(default)]
    pub scheduled: Vec<u32>,
}

impl SeasonCoverage {
    pub fn is_complete(&self) -> bool {
        !self.scheduled.is_empty() && self.scheduled.iter().all(|w| self.weeks.contains(w))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub start_season: i32,
    pub end_season: i32,
    pub seasons: Vec<SeasonCoverage>,
}

impl ChunkRecord {
    fn last_week(&self) -> Option<WeekKey> {
        self.seasons
            .iter()
            .filter_map(|s| s.weeks.iter().max().map(|w| WeekKey::new(s.season, *w)))
            .max()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestRun {
    pub season: i32,
    pub week: u32,
    pub timestamp: String,
}

impl LatestRun {
    pub fn week_key(&self) -> WeekKey {
        WeekKey::new(self.season, self.week)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    #[serde(default)]
    revision: Option<String>,
    #[serde(default)]
    coverage: BTreeMap<i32, BTreeSet<u32>>,
    #[serde(default)]
    scheduled: BTreeMap<i32, BTreeSet<u32>>,
    #[serde(default)]
    chunks: Vec<ChunkRecord>,
    #[serde(default)]
    latest_run: Option<LatestRun>,
    #[serde(default)]
    updated_at: Option<String>,
}

impl PipelineRecord {
    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    pub fn chunks(&self) -> &[ChunkRecord] {
        &self.chunks
    }

    pub fn latest_run(&self) -> Option<&LatestRun> {
        self.latest_run.as_ref()
    }

    pub fn completed_weeks(&self, season: i32) -> Option<&BTreeSet<u32>> {
        self.coverage.get(&season)
    }

    pub fn scheduled_weeks(&self, season: i32) -> Option<&BTreeSet<u32>> {
        self.scheduled.get(&season)
    }

    /// Every scheduled week of `season` has been replayed.
    pub fn covers_season(&self, season: i32) -> bool {
        let Some(expected) = self.scheduled.get(&season).filter(|w| !w.is_empty()) else {
            return false;
        };
        self.coverage
            .get(&season)
            .is_some_and(|done| done.is_superset(expected))
    }

    pub fn has_chunk(&self, start: i32, end: i32) -> bool {
        self.chunks
            .iter()
            .any(|c| c.start_season == start && c.end_season == end)
    }

    pub fn is_current(&self) -> bool {
        self.revision.as_deref() == Some(CURRENT_REVISION)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    #[serde(default)]
    pipelines: BTreeMap<String, PipelineRecord>,
}

impl TrainingState {
    pub fn pipeline(&self, key: &str) -> Option<&PipelineRecord> {
        self.pipelines.get(key)
    }

    /// The record for `key` as it stands under the running revision:
    /// a stale revision counts as no coverage at all.
    fn current_record(&self, key: &str) -> PipelineRecord {
        self.pipelines
            .get(key)
            .filter(|r| r.is_current())
            .cloned()
            .unwrap_or_default()
    }

    fn with_record(&self, key: &str, record: PipelineRecord) -> Self {
        let mut next = self.clone();
        next.pipelines.insert(key.to_string(), record);
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootstrapRequirement {
    pub min_season: i32,
    pub required_through_season: i32,
    pub force: bool,
}

pub fn should_run_historical_bootstrap(
    state: &TrainingState,
    key: &str,
    req: &BootstrapRequirement,
) -> bool {
    if req.force {
        return true;
    }
    let Some(record) = state.pipeline(key) else {
        return true;
    };
    if !record.is_current() {
        let mismatch = TrainerError::BootstrapRevisionMismatch {
            found: record.revision.clone(),
            expected: CURRENT_REVISION.to_string(),
        };
        warn!(pipeline = key, "{mismatch}; full re-bootstrap required");
        return true;
    }
    if record.latest_run.is_none() {
        return true;
    }
    (req.min_season..=req.required_through_season).any(|s| !record.covers_season(s))
}

/// Merges a finished chunk into the record. Coverage only grows; a stale
/// revision starts over from empty.
pub fn mark_bootstrap_completed(
    state: &TrainingState,
    key: &str,
    chunk: ChunkRecord,
    now: DateTime<Utc>,
) -> TrainingState {
    let mut record = state.current_record(key);
    let stamp = now.to_rfc3339();

    for season in &chunk.seasons {
        record
            .coverage
            .entry(season.season)
            .or_default()
            .extend(season.weeks.iter().copied());
        record
            .scheduled
            .entry(season.season)
            .or_default()
            .extend(season.scheduled.iter().copied());
    }

    let last = chunk.last_week();
    match record
        .chunks
        .iter_mut()
        .find(|c| c.start_season == chunk.start_season && c.end_season == chunk.end_season)
    {
        Some(existing) => {
            for season in chunk.seasons {
                match existing.seasons.iter_mut().find(|s| s.season == season.season) {
                    Some(s) => {
                        s.weeks = merge_weeks(&s.weeks, &season.weeks);
                        s.scheduled = merge_weeks(&s.scheduled, &season.scheduled);
                    }
                    None => existing.seasons.push(season),
                }
            }
            existing.seasons.sort_by_key(|s| s.season);
        }
        None => {
            record.chunks.push(chunk);
            record.chunks.sort_by_key(|c| c.start_season);
        }
    }

    if let Some(last) = last
        && record
            .latest_run
            .as_ref()
            .is_none_or(|run| run.week_key() < last)
    {
        record.latest_run = Some(LatestRun {
            season: last.season,
            week: last.week,
            timestamp: stamp.clone(),
        });
    }

    record.revision = Some(CURRENT_REVISION.to_string());
    record.updated_at = Some(stamp);
    state.with_record(key, record)
}

fn merge_weeks(a: &[u32], b: &[u32]) -> Vec<u32> {
    let merged: BTreeSet<u32> = a.iter().chain(b).copied().collect();
    merged.into_iter().collect()
}

/// Points the record at `week` unless it already points later.
pub fn record_latest_run(
    state: &TrainingState,
    key: &str,
    week: WeekKey,
    now: DateTime<Utc>,
) -> TrainingState {
    let mut record = state.current_record(key);
    let stamp = now.to_rfc3339();
    if record
        .latest_run
        .as_ref()
        .is_none_or(|run| run.week_key() <= week)
    {
        record.latest_run = Some(LatestRun {
            season: week.season,
            week: week.week,
            timestamp: stamp.clone(),
        });
    }
    record.revision = Some(CURRENT_REVISION.to_string());
    record.updated_at = Some(stamp);
    state.with_record(key, record)
}

/// Persistence seam for the training state. Loading never fails: an
/// unreadable record is reported and replaced by an empty one.
pub trait TrainingStateStore {
    fn load(&self) -> TrainingState;
    fn save(&self, state: &TrainingState) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrainingStateStore for JsonStateStore {
    fn load(&self) -> TrainingState {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return TrainingState::default();
            }
            Err(err) => {
                let corrupt = TrainerError::StateCorruption {
                    path: self.path.clone(),
                    reason: err.to_string(),
                };
                warn!("{corrupt}; starting from an empty training state");
                return TrainingState::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(err) => {
                let corrupt = TrainerError::StateCorruption {
                    path: self.path.clone(),
                    reason: err.to_string(),
                };
                warn!("{corrupt}; starting from an empty training state");
                TrainingState::default()
            }
        }
    }

    fn save(&self, state: &TrainingState) -> Result<()> {
        write_json_atomic(&self.path, state)
    }
}
