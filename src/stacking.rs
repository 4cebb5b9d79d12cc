use std::collections::{HashMap, HashSet};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::calibration::{CalibrationReport, Recalibration, recalibrate};
use crate::features::{FeatureRow, GameDifferentialRow, TeamGameRow};
use crate::models::ann::AnnArtifact;
use crate::models::set::{LearnerSet, ModelProbs, PerModel, WarmStart};
use crate::models::{ModelKind, clamp_prob};

pub const GRID_STEP: f64 = 0.05;
pub const MAX_FOLDS: usize = 5;
pub const GAMES_PER_FOLD: usize = 30;
/// Below this many labelled games the blend is fit on in-sample predictions.
pub const MIN_OOF_GAMES: usize = 20;
pub const DIVERSITY_VARIANCE_FLOOR: f64 = 0.01;
const DIVERSITY_CUT: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlendWeights {
    pub logistic: f64,
    pub tree: f64,
    pub bradley_terry: f64,
    pub ann: f64,
}

impl BlendWeights {
    pub fn uniform() -> Self {
        Self::from_array([0.25; 4])
    }

    pub fn from_array(w: [f64; 4]) -> Self {
        Self {
            logistic: w[0],
            tree: w[1],
            bradley_terry: w[2],
            ann: w[3],
        }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.logistic, self.tree, self.bradley_terry, self.ann]
    }

    pub fn get(&self, kind: ModelKind) -> f64 {
        self.as_array()[kind.index()]
    }

    pub fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }

    /// Non-negative, summing to one; uniform when everything collapsed to zero.
    pub fn normalized(&self) -> Self {
        let w = self.as_array().map(|v| if v.is_finite() { v.max(0.0) } else { 0.0 });
        let total: f64 = w.iter().sum();
        if total <= 0.0 {
            return Self::uniform();
        }
        Self::from_array(w.map(|v| v / total))
    }

    pub fn blend(&self, probs: &ModelProbs) -> f64 {
        let w = self.as_array();
        clamp_prob(w.iter().zip(probs).map(|(w, p)| w * p).sum())
    }
}

/// Fewer training weeks means less trust in the data-hungry models.
pub fn clamp_weights(weights: BlendWeights, distinct_weeks: usize) -> BlendWeights {
    let mut w = weights;
    if distinct_weeks < 4 {
        w.ann *= 0.5;
    }
    if distinct_weeks < 3 {
        w.logistic *= 0.8;
    }
    w.normalized()
}

/// Cuts a collapsed network's weight by 40% and shares the cut evenly
/// among the other three models.
pub fn apply_diversity_guard(weights: BlendWeights, ann_variance: f64) -> BlendWeights {
    let mut w = weights.normalized();
    if ann_variance.is_finite() && ann_variance < DIVERSITY_VARIANCE_FLOOR {
        let cut = w.ann * DIVERSITY_CUT;
        w.ann -= cut;
        w.logistic += cut / 3.0;
        w.tree += cut / 3.0;
        w.bradley_terry += cut / 3.0;
    }
    w.normalized()
}

pub fn mean_log_loss(preds: &[f64], labels: &[f64]) -> f64 {
    if preds.is_empty() {
        return f64::INFINITY;
    }
    preds
        .iter()
        .zip(labels)
        .map(|(p, y)| {
            let p = clamp_prob(*p);
            -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
        })
        .sum::<f64>()
        / preds.len() as f64
}

/// Exhaustive search over simplex points on a `GRID_STEP` lattice, minimising
/// log-loss. Inactive models stay at zero; the first minimum found wins.
pub fn grid_search(oof: &[ModelProbs], labels: &[f64], active: [bool; 4]) -> BlendWeights {
    if !active.iter().any(|a| *a) || oof.is_empty() {
        return BlendWeights::uniform();
    }
    let steps = (1.0 / GRID_STEP).round() as usize;
    let range = |i: usize, left: usize| if active[i] { left } else { 0 };

    let mut best = None;
    let mut best_loss = f64::INFINITY;
    let mut blended = vec![0.0; oof.len()];
    for a in 0..=range(0, steps) {
        for b in 0..=range(1, steps - a) {
            for c in 0..=range(2, steps - a - b) {
                let d = steps - a - b - c;
                if d > 0 && !active[3] {
                    continue;
                }
                let w = BlendWeights::from_array([a, b, c, d].map(|k| k as f64 * GRID_STEP));
                for (slot, probs) in blended.iter_mut().zip(oof) {
                    *slot = w.blend(probs);
                }
                let loss = mean_log_loss(&blended, labels);
                if loss < best_loss {
                    best_loss = loss;
                    best = Some(w);
                }
            }
        }
    }
    best.unwrap_or_else(BlendWeights::uniform)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OofPredictions {
    pub game_ids: Vec<String>,
    pub probs: Vec<ModelProbs>,
    pub labels: Vec<f64>,
    pub folds: usize,
    pub in_sample: bool,
}

impl OofPredictions {
    pub fn column(&self, kind: ModelKind) -> Vec<f64> {
        self.probs.iter().map(|p| p[kind.index()]).collect()
    }

    pub fn variance(&self, kind: ModelKind) -> f64 {
        variance(&self.column(kind))
    }
}

pub fn variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n
}

pub fn fold_count(games: usize) -> usize {
    (games / GAMES_PER_FOLD).clamp(2, MAX_FOLDS)
}

/// Out-of-fold game probabilities for every labelled training game.
/// Folds are contiguous chronological blocks of games.
pub fn out_of_fold(
    learners: &LearnerSet,
    team_rows: &[TeamGameRow],
    diff_rows: &[GameDifferentialRow],
    ann_warm: Option<&AnnArtifact>,
) -> Result<OofPredictions> {
    let games: Vec<&GameDifferentialRow> = diff_rows.iter().filter(|r| r.label().is_some()).collect();
    let n = games.len();
    if n == 0 {
        return Ok(OofPredictions::default());
    }
    let warm = WarmStart {
        ann: ann_warm,
        ..WarmStart::default()
    };

    if n < MIN_OOF_GAMES {
        debug!(games = n, "too few games for folds, using in-sample blend inputs");
        let models = learners.train_all(team_rows, diff_rows, warm);
        let preds = learners.predict_games(&models, team_rows, diff_rows, diff_rows)?;
        return Ok(collect(&games, |id| preds.get(id).map(|s| s.probs), 1, true));
    }

    let k = fold_count(n);
    let mut probs = HashMap::with_capacity(n);
    for f in 0..k {
        let held: HashSet<&str> = games[f * n / k..(f + 1) * n / k]
            .iter()
            .map(|g| g.game_id.as_str())
            .collect();
        let fit_team: Vec<TeamGameRow> = team_rows
            .iter()
            .filter(|r| !held.contains(r.game_id.as_str()))
            .cloned()
            .collect();
        let fit_diff: Vec<GameDifferentialRow> = diff_rows
            .iter()
            .filter(|r| !held.contains(r.game_id.as_str()))
            .cloned()
            .collect();
        let eval_team: Vec<TeamGameRow> = team_rows
            .iter()
            .filter(|r| held.contains(r.game_id.as_str()))
            .cloned()
            .collect();
        let eval_diff: Vec<GameDifferentialRow> = diff_rows
            .iter()
            .filter(|r| held.contains(r.game_id.as_str()))
            .cloned()
            .collect();

        let models = learners.train_all(&fit_team, &fit_diff, warm);
        let scores = learners.predict_games(&models, &eval_team, &eval_diff, &fit_diff)?;
        probs.extend(scores.into_iter().map(|(id, score)| (id, score.probs)));
    }
    Ok(collect(&games, |id| probs.get(id).copied(), k, false))
}

fn collect(
    games: &[&GameDifferentialRow],
    lookup: impl Fn(&str) -> Option<ModelProbs>,
    folds: usize,
    in_sample: bool,
) -> OofPredictions {
    let mut out = OofPredictions {
        folds,
        in_sample,
        ..OofPredictions::default()
    };
    for g in games {
        let (Some(p), Some(y)) = (lookup(&g.game_id), g.label()) else {
            continue;
        };
        out.game_ids.push(g.game_id.clone());
        out.probs.push(p);
        out.labels.push(y);
    }
    out
}

/// Everything the blend fit decided, plus the OOF evidence behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlendFit {
    pub searched: BlendWeights,
    pub weights: BlendWeights,
    pub calibration: Option<Recalibration>,
    pub oof_games: usize,
    pub folds: usize,
    pub in_sample: bool,
    pub oof_variance: PerModel<f64>,
    pub per_model: PerModel<CalibrationReport>,
    pub blended: CalibrationReport,
    pub calibrated: CalibrationReport,
}

pub fn fit_blend(oof: &OofPredictions, distinct_weeks: usize, active: [bool; 4]) -> BlendFit {
    let searched = grid_search(&oof.probs, &oof.labels, active);
    let mut weights = clamp_weights(searched, distinct_weeks);
    // Clamping renormalises; keep inactive models at zero.
    if active.iter().any(|a| *a) {
        let mut w = weights.as_array();
        for (slot, on) in w.iter_mut().zip(active) {
            if !on {
                *slot = 0.0;
            }
        }
        weights = BlendWeights::from_array(w).normalized();
    }

    let blended: Vec<f64> = oof.probs.iter().map(|p| weights.blend(p)).collect();
    let calibration = Recalibration::fit(&blended, &oof.labels);
    let calibrated: Vec<f64> = blended
        .iter()
        .map(|p| recalibrate(calibration.as_ref(), *p))
        .collect();

    BlendFit {
        searched,
        weights,
        calibration,
        oof_games: oof.labels.len(),
        folds: oof.folds,
        in_sample: oof.in_sample,
        oof_variance: PerModel::from_array(ModelKind::ALL.map(|k| oof.variance(k))),
        per_model: PerModel::from_array(
            ModelKind::ALL.map(|k| CalibrationReport::build(&oof.column(k), &oof.labels)),
        ),
        blended: CalibrationReport::build(&blended, &oof.labels),
        calibrated: CalibrationReport::build(&calibrated, &oof.labels),
    }
}
