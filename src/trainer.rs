//! Weekly training: split strictly before the target week, fit the four
//! learners and the blend, score the target week, persist the artifact set.

use std::collections::HashMap;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::artifacts::{ArtifactStore, WeekStatus, read_json, write_json_atomic};
use crate::calibration::{CalibrationReport, Recalibration, recalibrate};
use crate::config::TrainerConfig;
use crate::explain::{Driver, TOP_DRIVERS, narrative, top_drivers};
use crate::features::{DIFF_LAYOUT, FeatureRow, GameDifferentialRow, TEAM_LAYOUT, TeamGameRow};
use crate::models::ann::AnnArtifact;
use crate::models::bradley_terry::BootstrapEstimate;
use crate::models::clamp_prob;
use crate::models::set::{GameScore, LearnerSet, PerModel, TrainedModels, WarmStart};
use crate::stacking::{BlendWeights, fit_blend, out_of_fold};
use crate::temporal::{Timed, WeekKey, distinct_weeks, split_at_target};
use crate::training_state::{CURRENT_REVISION, MODEL_TRAINING, TrainingStateStore, record_latest_run};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
    pub mean: f64,
    pub draws: usize,
    pub fallback: bool,
}

impl From<BootstrapEstimate> for Interval {
    fn from(est: BootstrapEstimate) -> Self {
        Self {
            lower: est.lower,
            upper: est.upper,
            mean: est.mean,
            draws: est.draws,
            fallback: est.fallback,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamePrediction {
    pub game_id: String,
    pub season: i32,
    pub week: u32,
    pub home_team: String,
    pub away_team: String,
    pub probabilities: PerModel<f64>,
    /// Blend before recalibration.
    pub blended: f64,
    pub calibrated: f64,
    /// Paired-comparison bootstrap interval on the home-win probability.
    pub interval: Interval,
    pub narrative: String,
    pub drivers: Vec<Driver>,
}

impl Timed for GamePrediction {
    fn week_key(&self) -> WeekKey {
        WeekKey::new(self.season, self.week)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub season: i32,
    pub week: u32,
    pub revision: String,
    pub feature_hash: String,
    pub trained_at: String,
    pub weights: BlendWeights,
    pub calibration: Option<Recalibration>,
    pub models: TrainedModels,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub season: i32,
    pub week: u32,
    pub revision: String,
    pub feature_hash: String,
    pub training_rows: usize,
    pub training_games: usize,
    pub training_weeks: usize,
    pub test_games: usize,
    pub oof_games: usize,
    pub oof_folds: usize,
    pub oof_in_sample: bool,
    pub oof_variance: PerModel<f64>,
    pub per_model: PerModel<CalibrationReport>,
    pub blended: CalibrationReport,
    pub calibrated: CalibrationReport,
    pub searched_weights: BlendWeights,
    pub weights: BlendWeights,
    pub calibration: Option<Recalibration>,
    pub active_models: PerModel<bool>,
    pub ann_seeds_requested: usize,
    pub ann_seeds_finished: usize,
    pub elapsed_ms: u64,
    pub trained_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeekArtifacts {
    pub predictions: Vec<GamePrediction>,
    pub model: ModelRecord,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WeekOutcome {
    Trained(Box<WeekArtifacts>),
    /// Feature hash matched the artifact already on disk.
    Cached(Box<WeekArtifacts>),
    Skipped { reason: String },
}

impl WeekOutcome {
    pub fn status(&self) -> WeekStatus {
        match self {
            Self::Trained(_) => WeekStatus::Trained,
            Self::Cached(_) => WeekStatus::Cached,
            Self::Skipped { .. } => WeekStatus::Skipped,
        }
    }

    pub fn artifacts(&self) -> Option<&WeekArtifacts> {
        match self {
            Self::Trained(a) | Self::Cached(a) => Some(a),
            Self::Skipped { .. } => None,
        }
    }

    pub fn ann(&self) -> Option<&AnnArtifact> {
        self.artifacts().map(|a| &a.model.models.ann)
    }
}

pub struct WeeklyTrainer {
    learners: LearnerSet,
    store: ArtifactStore,
    lookback_seasons: i32,
    min_train_games: usize,
}

impl WeeklyTrainer {
    pub fn new(cfg: &TrainerConfig) -> Self {
        Self::with_store(cfg, ArtifactStore::new(&cfg.artifact_dir))
    }

    pub fn with_store(cfg: &TrainerConfig, store: ArtifactStore) -> Self {
        Self {
            learners: LearnerSet::from_config(cfg),
            store,
            lookback_seasons: cfg.train_lookback_seasons.max(0),
            min_train_games: cfg.min_train_games,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn learners(&self) -> &LearnerSet {
        &self.learners
    }

    /// Trains (or reloads) one week and writes its status marker after the
    /// artifact set is on disk.
    pub fn run_week(
        &self,
        target: WeekKey,
        team_rows: &[TeamGameRow],
        diff_rows: &[GameDifferentialRow],
        warm: WarmStart<'_>,
    ) -> Result<WeekOutcome> {
        let outcome = self.train_week(target, team_rows, diff_rows, warm)?;
        self.store.write_status(target, outcome.status())?;
        Ok(outcome)
    }

    pub fn train_week(
        &self,
        target: WeekKey,
        team_rows: &[TeamGameRow],
        diff_rows: &[GameDifferentialRow],
        warm: WarmStart<'_>,
    ) -> Result<WeekOutcome> {
        let started = Instant::now();
        let earliest = target.season - self.lookback_seasons;
        let team = split_at_target(team_rows, target);
        let diff = split_at_target(diff_rows, target);
        let train_team: Vec<TeamGameRow> =
            team.train.into_iter().filter(|r| r.season >= earliest).collect();
        let train_diff: Vec<GameDifferentialRow> =
            diff.train.into_iter().filter(|r| r.season >= earliest).collect();
        let (test_team, mut test_diff) = (team.test, diff.test);
        test_diff.sort_by(|a, b| a.game_id.cmp(&b.game_id));

        let training_games = train_diff.iter().filter(|r| r.label().is_some()).count();
        if test_diff.is_empty() {
            return Ok(skipped(target, "no games scheduled"));
        }
        if training_games < self.min_train_games {
            return Ok(skipped(
                target,
                &format!("{training_games} labelled games before target (need {})", self.min_train_games),
            ));
        }

        let hash = feature_hash(target, &train_team, &train_diff, &test_team, &test_diff);
        if let Some(cached) = self.load_cached(target, &hash)? {
            debug!(season = target.season, week = target.week, "feature hash unchanged, reusing artifacts");
            return Ok(WeekOutcome::Cached(Box::new(cached)));
        }

        let oof = out_of_fold(&self.learners, &train_team, &train_diff, warm.ann)?;
        let models = self.learners.train_all(&train_team, &train_diff, warm);
        let active = models.active();
        let training_weeks = distinct_weeks(&train_diff);
        let fit = fit_blend(&oof, training_weeks, active);

        let scores = self
            .learners
            .predict_games(&models, &test_team, &test_diff, &train_diff)?;
        let predictions =
            self.predict_week(&models, &fit.weights, fit.calibration.as_ref(), &scores, &test_diff)?;

        let trained_at = Utc::now().to_rfc3339();
        let diagnostics = Diagnostics {
            season: target.season,
            week: target.week,
            revision: CURRENT_REVISION.to_string(),
            feature_hash: hash.clone(),
            training_rows: train_team.len(),
            training_games,
            training_weeks,
            test_games: test_diff.len(),
            oof_games: fit.oof_games,
            oof_folds: fit.folds,
            oof_in_sample: fit.in_sample,
            oof_variance: fit.oof_variance,
            per_model: fit.per_model,
            blended: fit.blended,
            calibrated: fit.calibrated,
            searched_weights: fit.searched,
            weights: fit.weights,
            calibration: fit.calibration,
            active_models: PerModel::from_array(active),
            ann_seeds_requested: models.ann.seeds_requested,
            ann_seeds_finished: models.ann.seeds_finished,
            elapsed_ms: started.elapsed().as_millis() as u64,
            trained_at: trained_at.clone(),
        };
        let model = ModelRecord {
            season: target.season,
            week: target.week,
            revision: CURRENT_REVISION.to_string(),
            feature_hash: hash,
            trained_at,
            weights: fit.weights,
            calibration: fit.calibration,
            models,
        };

        write_json_atomic(&self.store.predictions_path(target), &predictions)?;
        write_json_atomic(&self.store.diagnostics_path(target), &diagnostics)?;
        // Model last: its hash is what the idempotence check reads.
        write_json_atomic(&self.store.model_path(target), &model)?;

        info!(
            season = target.season,
            week = target.week,
            games = predictions.len(),
            training_games,
            oof_folds = diagnostics.oof_folds,
            log_loss = diagnostics.calibrated.metrics.log_loss,
            elapsed_ms = diagnostics.elapsed_ms,
            "trained week"
        );
        Ok(WeekOutcome::Trained(Box::new(WeekArtifacts {
            predictions,
            model,
            diagnostics,
        })))
    }

    fn predict_week(
        &self,
        models: &TrainedModels,
        weights: &BlendWeights,
        calibration: Option<&Recalibration>,
        scores: &HashMap<String, GameScore>,
        test_diff: &[GameDifferentialRow],
    ) -> Result<Vec<GamePrediction>> {
        let mut out = Vec::with_capacity(test_diff.len());
        for row in test_diff {
            let Some(score) = scores.get(&row.game_id) else {
                continue;
            };
            let blended = weights.blend(&score.probs);
            let calibrated = recalibrate(calibration, blended);

            let interval = Interval::from(score.bootstrap);
            // Carry the bootstrap spread over to the final probability.
            let band = (!interval.fallback).then(|| {
                (
                    clamp_prob(calibrated - (interval.mean - interval.lower)),
                    clamp_prob(calibrated + (interval.upper - interval.mean)),
                )
            });
            let drivers = top_drivers(&models.bradley_terry, row, TOP_DRIVERS)?;
            out.push(GamePrediction {
                game_id: row.game_id.clone(),
                season: row.season,
                week: row.week,
                home_team: row.home_team.clone(),
                away_team: row.away_team.clone(),
                probabilities: PerModel::from_array(score.probs),
                blended,
                calibrated,
                interval,
                narrative: narrative(row, calibrated, band, &drivers),
                drivers,
            });
        }
        Ok(out)
    }

    fn load_cached(&self, target: WeekKey, hash: &str) -> Result<Option<WeekArtifacts>> {
        let Some(model) = read_json::<ModelRecord>(&self.store.model_path(target))? else {
            return Ok(None);
        };
        if model.feature_hash != hash || model.revision != CURRENT_REVISION {
            return Ok(None);
        }
        let predictions = read_json::<Vec<GamePrediction>>(&self.store.predictions_path(target))?;
        let diagnostics = read_json::<Diagnostics>(&self.store.diagnostics_path(target))?;
        Ok(match (predictions, diagnostics) {
            (Some(predictions), Some(diagnostics)) => Some(WeekArtifacts {
                predictions,
                model,
                diagnostics,
            }),
            _ => None,
        })
    }
}

/// Moves the model-training pointer to `target` when the week left an
/// artifact set behind. A skipped week leaves the state untouched.
pub fn record_week_run(
    state_store: &dyn TrainingStateStore,
    target: WeekKey,
    outcome: &WeekOutcome,
) -> Result<bool> {
    if outcome.artifacts().is_none() {
        return Ok(false);
    }
    let state = record_latest_run(&state_store.load(), MODEL_TRAINING, target, Utc::now());
    state_store.save(&state)?;
    Ok(true)
}

fn skipped(target: WeekKey, reason: &str) -> WeekOutcome {
    debug!(season = target.season, week = target.week, reason, "skipping week");
    WeekOutcome::Skipped {
        reason: reason.to_string(),
    }
}

/// Hex SHA-256 over the feature layouts, the row counts on both sides of the
/// split and the target week.
pub fn feature_hash(
    target: WeekKey,
    train_team: &[TeamGameRow],
    train_diff: &[GameDifferentialRow],
    test_team: &[TeamGameRow],
    test_diff: &[GameDifferentialRow],
) -> String {
    let labelled = train_diff.iter().filter(|r| r.label().is_some()).count();
    let mut hasher = Sha256::new();
    hasher.update(CURRENT_REVISION.as_bytes());
    hasher.update(target.to_string().as_bytes());
    for name in TEAM_LAYOUT.names.iter().chain(DIFF_LAYOUT.names.iter()) {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
    }
    for count in [train_team.len(), train_diff.len(), labelled, test_team.len(), test_diff.len()] {
        hasher.update((count as u64).to_le_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
