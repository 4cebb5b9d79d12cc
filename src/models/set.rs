use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::TrainerConfig;
use crate::features::{FeatureRow, GameDifferentialRow, TeamGameRow};
use crate::models::ann::{AnnArtifact, AnnLearner};
use crate::models::bradley_terry::{BootstrapEstimate, BradleyTerryArtifact, BradleyTerryLearner};
use crate::models::logistic::{LogisticArtifact, LogisticLearner};
use crate::models::tree::{TreeArtifact, TreeLearner};
use crate::models::{BaseLearner, ModelKind, clamp_prob};

/// Per-model home-win probabilities for one game, in `ModelKind::ALL` order.
pub type ModelProbs = [f64; 4];

/// One value per base learner, keyed by name when serialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerModel<T> {
    pub logistic: T,
    pub tree: T,
    pub bradley_terry: T,
    pub ann: T,
}

impl<T> PerModel<T> {
    pub fn from_array([logistic, tree, bradley_terry, ann]: [T; 4]) -> Self {
        Self {
            logistic,
            tree,
            bradley_terry,
            ann,
        }
    }

    pub fn get(&self, kind: ModelKind) -> &T {
        match kind {
            ModelKind::Logistic => &self.logistic,
            ModelKind::Tree => &self.tree,
            ModelKind::BradleyTerry => &self.bradley_terry,
            ModelKind::Ann => &self.ann,
        }
    }
}

impl<T: Clone> PerModel<T> {
    pub fn to_array(&self) -> [T; 4] {
        ModelKind::ALL.map(|k| self.get(k).clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LearnerSet {
    pub logistic: LogisticLearner,
    pub tree: TreeLearner,
    pub bradley_terry: BradleyTerryLearner,
    pub ann: AnnLearner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModels {
    pub logistic: LogisticArtifact,
    pub tree: TreeArtifact,
    pub bradley_terry: BradleyTerryArtifact,
    pub ann: AnnArtifact,
}

impl TrainedModels {
    /// Which models actually learned something; inactive ones are held at
    /// zero blend weight.
    pub fn active(&self) -> [bool; 4] {
        [
            self.logistic.trained_rows > 0,
            !self.tree.leaves.is_empty() && self.tree.leaves.iter().any(|l| l.count > 0.0),
            self.bradley_terry.model.trained_rows > 0,
            !self.ann.committees.is_empty(),
        ]
    }
}

/// Earlier artifacts to start optimisation from.
#[derive(Debug, Clone, Copy, Default)]
pub struct WarmStart<'a> {
    pub logistic: Option<&'a LogisticArtifact>,
    pub bradley_terry: Option<&'a BradleyTerryArtifact>,
    pub ann: Option<&'a AnnArtifact>,
}

impl<'a> WarmStart<'a> {
    pub fn from_models(models: &'a TrainedModels) -> Self {
        Self {
            logistic: Some(&models.logistic),
            bradley_terry: Some(&models.bradley_terry),
            ann: Some(&models.ann),
        }
    }
}

impl LearnerSet {
    pub fn from_config(cfg: &TrainerConfig) -> Self {
        Self {
            logistic: LogisticLearner::new(cfg.logistic.clone()),
            tree: TreeLearner::new(cfg.tree.clone()),
            bradley_terry: BradleyTerryLearner::new(cfg.bradley_terry.clone()),
            ann: AnnLearner::new(cfg.ann.clone()),
        }
    }

    /// Trains all four learners. The network committee runs alongside the
    /// three cheaper models.
    pub fn train_all(
        &self,
        team_rows: &[TeamGameRow],
        diff_rows: &[GameDifferentialRow],
        warm: WarmStart<'_>,
    ) -> TrainedModels {
        let ((logistic, tree, bradley_terry), ann) = rayon::join(
            || {
                (
                    self.logistic.train_from(team_rows, warm.logistic),
                    self.tree.train(team_rows),
                    self.bradley_terry.train_from(diff_rows, warm.bradley_terry),
                )
            },
            || self.ann.train_from(team_rows, warm.ann),
        );
        TrainedModels {
            logistic,
            tree,
            bradley_terry,
            ann,
        }
    }

    /// Game-level probabilities for every game in `diff_rows`. The
    /// paired-comparison column is the bootstrap draw mean, resampled from
    /// the actuals in `context` before each game's week.
    pub fn predict_games(
        &self,
        models: &TrainedModels,
        team_rows: &[TeamGameRow],
        diff_rows: &[GameDifferentialRow],
        context: &[GameDifferentialRow],
    ) -> Result<HashMap<String, GameScore>> {
        let logistic = team_to_game(team_rows, &self.logistic.predict(&models.logistic, team_rows)?);
        let tree = team_to_game(team_rows, &self.tree.predict(&models.tree, team_rows)?);
        let ann = team_to_game(team_rows, &self.ann.predict(&models.ann, team_rows)?);
        let bt = self
            .bradley_terry
            .estimate_rows(&models.bradley_terry, diff_rows, context)?;

        let mut out = HashMap::with_capacity(diff_rows.len());
        for (row, bootstrap) in diff_rows.iter().zip(bt) {
            let id = row.game_id();
            let mut probs = [0.5; 4];
            probs[ModelKind::Logistic.index()] = logistic.get(id).copied().unwrap_or(0.5);
            probs[ModelKind::Tree.index()] = tree.get(id).copied().unwrap_or(0.5);
            probs[ModelKind::BradleyTerry.index()] = bootstrap.mean;
            probs[ModelKind::Ann.index()] = ann.get(id).copied().unwrap_or(0.5);
            out.insert(id.to_string(), GameScore { probs, bootstrap });
        }
        Ok(out)
    }
}

/// One game's per-model probabilities and the paired-comparison bootstrap
/// behind its `BradleyTerry` entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GameScore {
    pub probs: ModelProbs,
    pub bootstrap: BootstrapEstimate,
}

/// Folds the two team-perspective rows of each game into one home-win
/// probability: the mean of the home row and the complement of the away row.
pub fn team_to_game(rows: &[TeamGameRow], preds: &[f64]) -> HashMap<String, f64> {
    let mut sides: HashMap<&str, (Option<f64>, Option<f64>)> = HashMap::new();
    for (row, p) in rows.iter().zip(preds) {
        let entry = sides.entry(row.game_id.as_str()).or_default();
        if row.is_home {
            entry.0 = Some(*p);
        } else {
            entry.1 = Some(1.0 - *p);
        }
    }
    sides
        .into_iter()
        .map(|(id, (home, away))| {
            let p = match (home, away) {
                (Some(h), Some(a)) => (h + a) / 2.0,
                (Some(h), None) => h,
                (None, Some(a)) => a,
                (None, None) => 0.5,
            };
            (id.to_string(), clamp_prob(p))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::StatSnapshot;

    fn team_row(game: &str, team: &str, is_home: bool) -> TeamGameRow {
        TeamGameRow {
            game_id: game.to_string(),
            season: 2022,
            week: 3,
            team: team.to_string(),
            opponent: String::new(),
            is_home,
            profile: StatSnapshot::default(),
            opponent_profile: StatSnapshot::default(),
            win_pct: 0.5,
            opponent_win_pct: 0.5,
            power_rating: 0.0,
            opponent_power_rating: 0.0,
            injury_burden: 0.0,
            opponent_injury_burden: 0.0,
            games_played: 2,
            win: None,
        }
    }

    #[test]
    fn team_rows_fold_into_home_probability() {
        let rows = vec![
            team_row("g1", "A", true),
            team_row("g1", "B", false),
            team_row("g2", "C", false),
        ];
        let games = team_to_game(&rows, &[0.7, 0.4, 0.2]);
        assert!((games["g1"] - 0.65).abs() < 1e-12);
        assert!((games["g2"] - 0.8).abs() < 1e-12);
    }
}
