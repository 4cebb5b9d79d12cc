//! Lower-frequency recalibration of an already-trained week: blend weights
//! from recorded diagnostics with a diversity guard on the network, and a
//! calibration refit over a sliding window of graded weeks.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::artifacts::{ArtifactStore, read_json, require_json, write_json_atomic};
use crate::calibration::{Recalibration, recalibrate};
use crate::config::TrainerConfig;
use crate::outcomes::WeekOutcomes;
use crate::stacking::{BlendWeights, DIVERSITY_VARIANCE_FLOOR, apply_diversity_guard};
use crate::temporal::WeekKey;
use crate::trainer::{Diagnostics, GamePrediction, ModelRecord};
use crate::training_state::{CURRENT_REVISION, HYBRID_V2, TrainingStateStore, record_latest_run};

/// Weeks per season scanned when walking back across a season boundary.
const MAX_WEEKS_PER_SEASON: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightSource {
    PriorDiagnostics,
    ModelArtifact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridPrediction {
    pub game_id: String,
    pub home_team: String,
    pub away_team: String,
    pub blended: f64,
    pub calibrated: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridRecord {
    pub season: i32,
    pub week: u32,
    pub revision: String,
    pub weight_source: WeightSource,
    pub ann_variance: Option<f64>,
    pub diversity_guard_applied: bool,
    pub weights: BlendWeights,
    pub calibration: Option<Recalibration>,
    /// False when the previous calibration was reused.
    pub refit: bool,
    pub window_weeks: Vec<WeekKey>,
    pub window_games: usize,
    pub predictions: Vec<HybridPrediction>,
    pub created_at: String,
}

pub struct HybridRecalibrator<'a> {
    store: &'a ArtifactStore,
    state_store: &'a dyn TrainingStateStore,
    window_weeks: usize,
    force: bool,
}

impl<'a> HybridRecalibrator<'a> {
    pub fn new(
        cfg: &TrainerConfig,
        store: &'a ArtifactStore,
        state_store: &'a dyn TrainingStateStore,
    ) -> Self {
        Self {
            store,
            state_store,
            window_weeks: cfg.hybrid_window_weeks.max(1),
            force: cfg.force_hybrid,
        }
    }

    /// Fails with `MissingArtifact` when the week's model or predictions are
    /// absent.
    pub fn run(&self, week: WeekKey) -> Result<HybridRecord> {
        let model: ModelRecord = require_json(&self.store.model_path(week))?;
        let predictions: Vec<GamePrediction> = require_json(&self.store.predictions_path(week))?;
        let state = self.state_store.load();

        let (source, base, ann_variance) = self.base_weights(week, &model)?;
        let guard = ann_variance.is_some_and(|v| v < DIVERSITY_VARIANCE_FLOOR);
        let weights = apply_diversity_guard(base, ann_variance.unwrap_or(f64::INFINITY));

        let cached = state
            .pipeline(HYBRID_V2)
            .filter(|r| r.is_current())
            .and_then(|r| r.latest_run())
            .filter(|run| run.week_key() <= week)
            .map(|run| self.store.hybrid_path(run.week_key()))
            .map(|path| read_json::<HybridRecord>(&path))
            .transpose()?
            .flatten()
            .and_then(|r| r.calibration);

        let window = self.window(week)?;
        let window_weeks: Vec<WeekKey> =
            window.iter().map(|o| WeekKey::new(o.season, o.week)).collect();
        let (calibration, refit, window_games) = match cached {
            Some(cal) if !self.force => {
                debug!(season = week.season, week = week.week, "reusing cached hybrid calibration");
                (Some(cal), false, 0)
            }
            _ => {
                let (preds, labels): (Vec<f64>, Vec<f64>) = window
                    .iter()
                    .flat_map(|o| o.games.iter())
                    .map(|g| (weights.blend(&g.probabilities.to_array()), g.actual))
                    .unzip();
                let fitted = Recalibration::fit(&preds, &labels).or(model.calibration);
                (fitted, true, labels.len())
            }
        };

        let hybrid_predictions = predictions
            .iter()
            .map(|p| {
                let blended = weights.blend(&p.probabilities.to_array());
                HybridPrediction {
                    game_id: p.game_id.clone(),
                    home_team: p.home_team.clone(),
                    away_team: p.away_team.clone(),
                    blended,
                    calibrated: recalibrate(calibration.as_ref(), blended),
                }
            })
            .collect();

        let record = HybridRecord {
            season: week.season,
            week: week.week,
            revision: CURRENT_REVISION.to_string(),
            weight_source: source,
            ann_variance,
            diversity_guard_applied: guard,
            weights,
            calibration,
            refit,
            window_weeks,
            window_games,
            predictions: hybrid_predictions,
            created_at: Utc::now().to_rfc3339(),
        };
        write_json_atomic(&self.store.hybrid_path(week), &record)?;
        let next = record_latest_run(&state, HYBRID_V2, week, Utc::now());
        self.state_store.save(&next)?;

        info!(
            season = week.season,
            week = week.week,
            refit,
            guard,
            window_games,
            "hybrid recalibration written"
        );
        Ok(record)
    }

    /// Prior week's recorded weights when available, else the model's own.
    fn base_weights(
        &self,
        week: WeekKey,
        model: &ModelRecord,
    ) -> Result<(WeightSource, BlendWeights, Option<f64>)> {
        if let Some(prev) = previous_week(week)
            && let Some(diag) = read_json::<Diagnostics>(&self.store.diagnostics_path(prev))?
            && diag.revision == CURRENT_REVISION
        {
            return Ok((
                WeightSource::PriorDiagnostics,
                diag.weights,
                Some(diag.oof_variance.ann),
            ));
        }
        let variance = read_json::<Diagnostics>(&self.store.diagnostics_path(week))?
            .map(|d| d.oof_variance.ann);
        Ok((WeightSource::ModelArtifact, model.weights, variance))
    }

    /// Up to `window_weeks` graded weeks strictly before `week`, newest first.
    fn window(&self, week: WeekKey) -> Result<Vec<WeekOutcomes>> {
        let mut out = Vec::with_capacity(self.window_weeks);
        let mut cursor = previous_week(week);
        let mut scanned = 0;
        while let Some(prev) = cursor {
            if out.len() >= self.window_weeks || scanned >= 2 * MAX_WEEKS_PER_SEASON {
                break;
            }
            if let Some(graded) = read_json::<WeekOutcomes>(&self.store.outcomes_path(prev))? {
                out.push(graded);
            }
            scanned += 1;
            cursor = previous_week(prev);
        }
        Ok(out)
    }
}

/// The week before `week`; week 1 steps back to the end of the prior season.
fn previous_week(week: WeekKey) -> Option<WeekKey> {
    match week.week {
        0 => None,
        1 => Some(WeekKey::new(week.season - 1, MAX_WEEKS_PER_SEASON)),
        w => Some(WeekKey::new(week.season, w - 1)),
    }
}
