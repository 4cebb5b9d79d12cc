//! Historical replay: every week of every required season is trained once,
//! in chronological order, in chunks of a few seasons. Progress is kept in
//! per-week status markers so an interrupted run resumes at the next
//! unmarked week.

use std::ops::RangeInclusive;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactStore, WeekStatus};
use crate::config::TrainerConfig;
use crate::dataset::{SeasonSource, SeasonTables};
use crate::error::TrainerError;
use crate::features::{GameDifferentialRow, TeamGameRow, build_differential_features, build_features};
use crate::limiter::BoundedPool;
use crate::models::set::WarmStart;
use crate::temporal::{WeekKey, sort_chronologically};
use crate::trainer::WeeklyTrainer;
use crate::training_state::{
    BootstrapRequirement, ChunkRecord, MODEL_TRAINING, SeasonCoverage, TrainingState,
    TrainingStateStore, mark_bootstrap_completed, should_run_historical_bootstrap,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonWindow {
    pub start: i32,
    pub end: i32,
}

impl SeasonWindow {
    pub fn seasons(&self) -> RangeInclusive<i32> {
        self.start..=self.end
    }
}

/// Splits `[start, end]` into consecutive windows of at most `max` seasons.
pub fn plan_chunks(start: i32, end: i32, max: usize) -> Vec<SeasonWindow> {
    let max = max.max(1) as i32;
    let mut chunks = Vec::new();
    let mut from = start;
    while from <= end {
        let to = (from + max - 1).min(end);
        chunks.push(SeasonWindow {
            start: from,
            end: to,
        });
        from = to + 1;
    }
    chunks
}

/// A user-supplied season window must be ordered, inside the supported
/// range, and fit in one chunk.
pub fn validate_explicit_window(
    start: i32,
    end: i32,
    cfg: &TrainerConfig,
) -> Result<SeasonWindow, TrainerError> {
    let invalid = |reason: String| TrainerError::ExplicitWindowInvalid { start, end, reason };
    if start > end {
        return Err(invalid("start season is after end season".to_string()));
    }
    if start < cfg.min_season || end > cfg.max_supported_season {
        return Err(invalid(format!(
            "outside supported seasons {}..={}",
            cfg.min_season, cfg.max_supported_season
        )));
    }
    let span = (end - start + 1) as usize;
    if span > cfg.chunk_max_seasons {
        return Err(invalid(format!(
            "spans {span} seasons, more than one chunk of {}",
            cfg.chunk_max_seasons
        )));
    }
    Ok(SeasonWindow { start, end })
}

/// Feature rows for a span of seasons plus the seasons that could not be
/// loaded.
#[derive(Debug, Clone, Default)]
pub struct LoadedRows {
    pub team_rows: Vec<TeamGameRow>,
    pub diff_rows: Vec<GameDifferentialRow>,
    pub unavailable: Vec<i32>,
}

impl LoadedRows {
    pub fn weeks_of(&self, season: i32) -> Vec<u32> {
        let mut weeks: Vec<u32> = self
            .diff_rows
            .iter()
            .filter(|r| r.season == season)
            .map(|r| r.week)
            .collect();
        weeks.sort_unstable();
        weeks.dedup();
        weeks
    }
}

/// Builds per-season feature rows, reusing the season cache for seasons whose
/// schedule is complete.
pub struct RowLoader<'a> {
    source: &'a dyn SeasonSource,
    store: &'a ArtifactStore,
    pool: BoundedPool,
    min_season: i32,
}

impl<'a> RowLoader<'a> {
    pub fn new(source: &'a dyn SeasonSource, store: &'a ArtifactStore, cfg: &TrainerConfig) -> Self {
        Self {
            source,
            store,
            pool: BoundedPool::new("season-load", cfg.season_load_concurrency),
            min_season: cfg.min_season,
        }
    }

    pub fn load(&self, seasons: RangeInclusive<i32>) -> Result<LoadedRows> {
        let seasons: Vec<i32> = seasons.filter(|s| *s >= self.min_season).collect();
        let results = self.pool.map_ordered(seasons.clone(), |season| self.season_rows(season));

        let mut out = LoadedRows::default();
        for (season, result) in seasons.into_iter().zip(results) {
            match result? {
                Some((team, diff)) => {
                    out.team_rows.extend(team);
                    out.diff_rows.extend(diff);
                }
                None => out.unavailable.push(season),
            }
        }
        sort_chronologically(&mut out.team_rows);
        sort_chronologically(&mut out.diff_rows);
        Ok(out)
    }

    fn season_rows(&self, season: i32) -> Result<Option<(Vec<TeamGameRow>, Vec<GameDifferentialRow>)>> {
        if let Some(cache) = self.store.season_cache(season)? {
            debug!(season, "season cache hit");
            return Ok(Some((cache.team_rows, cache.diff_rows)));
        }
        let Some(current) = self.tables(season) else {
            return Ok(None);
        };
        let mut context = Vec::with_capacity(2);
        if season > self.min_season
            && let Some(prior) = self.tables(season - 1)
        {
            context.push(prior);
        }
        let complete = season_complete(&current);
        context.push(current);

        let team: Vec<TeamGameRow> = build_features(&context)
            .into_iter()
            .filter(|r| r.season == season)
            .collect();
        let diff: Vec<GameDifferentialRow> = build_differential_features(&context)
            .into_iter()
            .filter(|r| r.season == season)
            .collect();
        if complete && !diff.is_empty() {
            self.store.write_season_cache(season, &team, &diff)?;
        }
        Ok(Some((team, diff)))
    }

    fn tables(&self, season: i32) -> Option<SeasonTables> {
        match self.source.load_season(season) {
            Ok(tables) => Some(tables),
            Err(err) => {
                warn!(season, source = self.source.name(), error = %err, "season unavailable, skipping");
                None
            }
        }
    }
}

fn season_complete(tables: &SeasonTables) -> bool {
    let mut regular = tables.schedules.iter().filter(|g| g.is_regular_season()).peekable();
    regular.peek().is_some() && regular.all(|g| g.is_final())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapSummary {
    pub ran: bool,
    pub chunks_planned: usize,
    pub chunks_skipped: usize,
    /// Chunks left unrecorded because a season was missing or not fully
    /// replayed; they are retried on the next run.
    pub chunks_incomplete: usize,
    pub weeks_trained: usize,
    pub weeks_cached: usize,
    pub weeks_skipped: usize,
    /// Weeks already marked by an earlier run.
    pub weeks_resumed: usize,
    pub unavailable_seasons: Vec<i32>,
}

pub struct HistoricalBootstrap<'a> {
    cfg: &'a TrainerConfig,
    trainer: &'a WeeklyTrainer,
    state_store: &'a dyn TrainingStateStore,
    loader: RowLoader<'a>,
    train_pool: BoundedPool,
}

impl<'a> HistoricalBootstrap<'a> {
    pub fn new(
        cfg: &'a TrainerConfig,
        source: &'a dyn SeasonSource,
        trainer: &'a WeeklyTrainer,
        state_store: &'a dyn TrainingStateStore,
    ) -> Self {
        Self {
            cfg,
            trainer,
            state_store,
            loader: RowLoader::new(source, trainer.store(), cfg),
            train_pool: BoundedPool::new("week-train", cfg.train_concurrency),
        }
    }

    /// The window to replay: the explicit batch window when configured,
    /// otherwise every season from `min_season` through `through`.
    pub fn window(&self, through: i32) -> Result<Option<SeasonWindow>, TrainerError> {
        match (self.cfg.batch_start_season, self.cfg.batch_end_season) {
            (Some(start), Some(end)) => validate_explicit_window(start, end, self.cfg).map(Some),
            (Some(start), None) | (None, Some(start)) => Err(TrainerError::ExplicitWindowInvalid {
                start,
                end: start,
                reason: "both BATCH_START_SEASON and BATCH_END_SEASON are required".to_string(),
            }),
            (None, None) if through < self.cfg.min_season => Ok(None),
            (None, None) => Ok(Some(SeasonWindow {
                start: self.cfg.min_season,
                end: through,
            })),
        }
    }

    pub fn run(&self, required_through_season: i32) -> Result<BootstrapSummary> {
        let mut summary = BootstrapSummary::default();
        let Some(window) = self.window(required_through_season)? else {
            return Ok(summary);
        };
        let mut state = self.state_store.load();
        let requirement = BootstrapRequirement {
            min_season: window.start,
            required_through_season: window.end,
            force: self.cfg.force_historical,
        };
        if !should_run_historical_bootstrap(&state, MODEL_TRAINING, &requirement) {
            info!(start = window.start, end = window.end, "historical coverage complete");
            return Ok(summary);
        }

        summary.ran = true;
        let chunks = plan_chunks(window.start, window.end, self.cfg.chunk_max_seasons);
        summary.chunks_planned = chunks.len();
        info!(
            start = window.start,
            end = window.end,
            chunks = chunks.len(),
            force = self.cfg.force_historical,
            "starting historical bootstrap"
        );

        for chunk in chunks {
            if !self.cfg.force_historical && self.chunk_done(&state, chunk)? {
                debug!(chunk = %format!("{}-{}", chunk.start, chunk.end), "chunk already complete");
                summary.chunks_skipped += 1;
                continue;
            }
            state = self.run_chunk(state, chunk, &mut summary)?;
        }
        info!(
            trained = summary.weeks_trained,
            cached = summary.weeks_cached,
            skipped = summary.weeks_skipped,
            resumed = summary.weeks_resumed,
            "historical bootstrap finished"
        );
        Ok(summary)
    }

    fn chunk_done(&self, state: &TrainingState, chunk: SeasonWindow) -> Result<bool> {
        let recorded = state.pipeline(MODEL_TRAINING).is_some_and(|r| {
            r.is_current()
                && r.has_chunk(chunk.start, chunk.end)
                && chunk.seasons().all(|s| r.covers_season(s))
        });
        Ok(recorded && self.trainer.store().chunk_marker(chunk.start, chunk.end)?.is_some())
    }

    fn run_chunk(
        &self,
        state: TrainingState,
        chunk: SeasonWindow,
        summary: &mut BootstrapSummary,
    ) -> Result<TrainingState> {
        let store = self.trainer.store();
        let context_start = chunk.start - self.cfg.train_lookback_seasons.max(0);
        let rows = self.loader.load(context_start..=chunk.end)?;
        for season in rows.unavailable.iter().filter(|s| chunk.seasons().contains(*s)) {
            summary.unavailable_seasons.push(*season);
        }

        let weeks: Vec<WeekKey> = chunk
            .seasons()
            .flat_map(|s| rows.weeks_of(s).into_iter().map(move |w| WeekKey::new(s, w)))
            .collect();
        let mut pending = Vec::with_capacity(weeks.len());
        for week in &weeks {
            if !self.cfg.force_historical && store.status(*week)?.is_some() {
                summary.weeks_resumed += 1;
            } else {
                pending.push(*week);
            }
        }
        info!(
            chunk = %format!("{}-{}", chunk.start, chunk.end),
            weeks = weeks.len(),
            pending = pending.len(),
            "replaying chunk"
        );

        for wave in pending.chunks(self.train_pool.limit()) {
            let first = wave[0];
            let checkpoint = store.checkpoint()?.filter(|c| c.trained_for < first);
            let warm = WarmStart {
                ann: checkpoint.as_ref().map(|c| &c.ann),
                ..WarmStart::default()
            };
            let trainer = self.trainer;
            let (team_rows, diff_rows) = (&rows.team_rows, &rows.diff_rows);
            let outcomes = self.train_pool.map_ordered(wave.to_vec(), |week| {
                trainer.run_week(week, team_rows, diff_rows, warm)
            });

            let mut newest = None;
            for (week, outcome) in wave.iter().zip(outcomes) {
                let outcome = outcome?;
                match outcome.status() {
                    WeekStatus::Trained => summary.weeks_trained += 1,
                    WeekStatus::Cached => summary.weeks_cached += 1,
                    WeekStatus::Skipped => summary.weeks_skipped += 1,
                }
                if let Some(ann) = outcome.ann().filter(|a| !a.committees.is_empty()) {
                    newest = Some((*week, ann.clone()));
                }
            }
            if let Some((week, ann)) = newest {
                store.write_checkpoint(week, &ann)?;
            }
        }

        let mut seasons = Vec::new();
        for season in chunk.seasons() {
            let scheduled = rows.weeks_of(season);
            let mut weeks = Vec::with_capacity(scheduled.len());
            for week in &scheduled {
                if store.status(WeekKey::new(season, *week))?.is_some() {
                    weeks.push(*week);
                }
            }
            seasons.push(SeasonCoverage {
                season,
                weeks,
                scheduled,
            });
        }
        let incomplete: Vec<i32> = seasons
            .iter()
            .filter(|s| !s.is_complete() || rows.unavailable.contains(&s.season))
            .map(|s| s.season)
            .collect();
        if !incomplete.is_empty() {
            warn!(
                chunk = %format!("{}-{}", chunk.start, chunk.end),
                seasons = ?incomplete,
                "chunk incomplete, leaving it unrecorded"
            );
            summary.chunks_incomplete += 1;
            return Ok(state);
        }

        store.write_chunk_marker(chunk.start, chunk.end, chunk.seasons().collect())?;
        let next = mark_bootstrap_completed(
            &state,
            MODEL_TRAINING,
            ChunkRecord {
                start_season: chunk.start,
                end_season: chunk.end,
                seasons,
            },
            Utc::now(),
        );
        self.state_store.save(&next)?;
        Ok(next)
    }
}
