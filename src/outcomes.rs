//! Grades a finished week against its stored predictions and keeps a
//! season-level rollup of the weekly metrics.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::artifacts::{ArtifactStore, read_json, require_json, write_json_atomic};
use crate::calibration::{CalibrationReport, Metrics};
use crate::dataset::ScheduleRow;
use crate::models::ModelKind;
use crate::models::set::PerModel;
use crate::temporal::{Timed, WeekKey};
use crate::trainer::GamePrediction;
use crate::training_state::CURRENT_REVISION;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameOutcome {
    pub game_id: String,
    pub home_team: String,
    pub away_team: String,
    pub home_score: u32,
    pub away_score: u32,
    /// 1 home win, 0 away win, 0.5 tie.
    pub actual: f64,
    pub probabilities: PerModel<f64>,
    pub blended: f64,
    pub calibrated: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekOutcomes {
    pub season: i32,
    pub week: u32,
    pub revision: String,
    pub graded_at: String,
    pub games: Vec<GameOutcome>,
}

impl WeekOutcomes {
    pub fn labels(&self) -> Vec<f64> {
        self.games.iter().map(|g| g.actual).collect()
    }

    pub fn column(&self, kind: ModelKind) -> Vec<f64> {
        self.games.iter().map(|g| *g.probabilities.get(kind)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeekMetrics {
    pub season: i32,
    pub week: u32,
    pub games: usize,
    pub per_model: PerModel<CalibrationReport>,
    pub blended: CalibrationReport,
    pub calibrated: CalibrationReport,
    pub graded_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RollupMetrics {
    pub per_model: PerModel<Metrics>,
    pub blended: Metrics,
    pub calibrated: Metrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeasonRollup {
    pub season: i32,
    pub games: usize,
    /// Graded weeks; the totals are their sample-weighted means.
    pub weeks: BTreeMap<u32, RollupMetrics>,
    pub totals: RollupMetrics,
    pub updated_at: String,
}

/// Joins predictions with final scores. `Ok(None)` when no game of the week
/// is final yet; a missing predictions file is fatal.
pub fn grade_week(
    store: &ArtifactStore,
    week: WeekKey,
    schedule: &[ScheduleRow],
) -> Result<Option<(WeekOutcomes, WeekMetrics)>> {
    let predictions: Vec<GamePrediction> = require_json(&store.predictions_path(week))?;
    let finals: HashMap<&str, &ScheduleRow> = schedule
        .iter()
        .filter(|g| g.is_regular_season() && g.week_key() == week && g.is_final())
        .map(|g| (g.game_id.as_str(), g))
        .collect();

    let mut games = Vec::new();
    for pred in &predictions {
        let Some(game) = finals.get(pred.game_id.as_str()) else {
            continue;
        };
        let (Some(home_score), Some(away_score), Some(actual)) =
            (game.home_score, game.away_score, game.home_result())
        else {
            continue;
        };
        games.push(GameOutcome {
            game_id: pred.game_id.clone(),
            home_team: pred.home_team.clone(),
            away_team: pred.away_team.clone(),
            home_score,
            away_score,
            actual,
            probabilities: pred.probabilities,
            blended: pred.blended,
            calibrated: pred.calibrated,
        });
    }
    if games.is_empty() {
        return Ok(None);
    }

    let graded_at = Utc::now().to_rfc3339();
    let outcomes = WeekOutcomes {
        season: week.season,
        week: week.week,
        revision: CURRENT_REVISION.to_string(),
        graded_at: graded_at.clone(),
        games,
    };
    let labels = outcomes.labels();
    let blended: Vec<f64> = outcomes.games.iter().map(|g| g.blended).collect();
    let calibrated: Vec<f64> = outcomes.games.iter().map(|g| g.calibrated).collect();
    let metrics = WeekMetrics {
        season: week.season,
        week: week.week,
        games: outcomes.games.len(),
        per_model: PerModel::from_array(
            ModelKind::ALL.map(|k| CalibrationReport::build(&outcomes.column(k), &labels)),
        ),
        blended: CalibrationReport::build(&blended, &labels),
        calibrated: CalibrationReport::build(&calibrated, &labels),
        graded_at,
    };

    write_json_atomic(&store.outcomes_path(week), &outcomes)?;
    write_json_atomic(&store.metrics_path(week), &metrics)?;
    let rollup = refresh_rollup(store, &metrics)?;
    info!(
        season = week.season,
        week = week.week,
        games = metrics.games,
        log_loss = metrics.calibrated.metrics.log_loss,
        season_games = rollup.games,
        "graded week"
    );
    Ok(Some((outcomes, metrics)))
}

/// Replaces this week's entry in the season rollup and recomputes totals.
pub fn refresh_rollup(store: &ArtifactStore, metrics: &WeekMetrics) -> Result<SeasonRollup> {
    let path = store.rollup_path(metrics.season);
    let mut rollup: SeasonRollup = read_json(&path)?.unwrap_or_else(|| SeasonRollup {
        season: metrics.season,
        ..SeasonRollup::default()
    });
    rollup.weeks.insert(
        metrics.week,
        RollupMetrics {
            per_model: PerModel::from_array(ModelKind::ALL.map(|k| metrics.per_model.get(k).metrics)),
            blended: metrics.blended.metrics,
            calibrated: metrics.calibrated.metrics,
        },
    );
    let weeks: Vec<&RollupMetrics> = rollup.weeks.values().collect();
    rollup.games = weeks.iter().map(|w| w.calibrated.samples).sum();
    rollup.totals = RollupMetrics {
        per_model: PerModel::from_array(
            ModelKind::ALL.map(|k| weighted_mean(weeks.iter().map(|w| *w.per_model.get(k)))),
        ),
        blended: weighted_mean(weeks.iter().map(|w| w.blended)),
        calibrated: weighted_mean(weeks.iter().map(|w| w.calibrated)),
    };
    rollup.updated_at = Utc::now().to_rfc3339();
    write_json_atomic(&path, &rollup)?;
    Ok(rollup)
}

fn weighted_mean(items: impl Iterator<Item = Metrics>) -> Metrics {
    let mut total = Metrics::default();
    for m in items {
        let n = m.samples as f64;
        total.samples += m.samples;
        total.log_loss += m.log_loss * n;
        total.brier += m.brier * n;
        total.auc += m.auc * n;
        total.accuracy += m.accuracy * n;
    }
    if total.samples > 0 {
        let n = total.samples as f64;
        total.log_loss /= n;
        total.brier /= n;
        total.auc /= n;
        total.accuracy /= n;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrainerError;
    use crate::trainer::Interval;

    fn prediction(game_id: &str, p: f64) -> GamePrediction {
        GamePrediction {
            game_id: game_id.to_string(),
            season: 2022,
            week: 6,
            home_team: "H".to_string(),
            away_team: "A".to_string(),
            probabilities: PerModel::from_array([p; 4]),
            blended: p,
            calibrated: p,
            interval: Interval {
                lower: p,
                upper: p,
                mean: p,
                draws: 1,
                fallback: true,
            },
            narrative: String::new(),
            drivers: Vec::new(),
        }
    }

    fn game(game_id: &str, home: Option<u32>, away: Option<u32>) -> ScheduleRow {
        ScheduleRow {
            game_id: game_id.to_string(),
            season: 2022,
            week: 6,
            game_type: "REG".to_string(),
            home_team: "H".to_string(),
            away_team: "A".to_string(),
            home_score: home,
            away_score: away,
        }
    }

    #[test]
    fn grades_final_games_and_rolls_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let week = WeekKey::new(2022, 6);
        write_json_atomic(
            &store.predictions_path(week),
            &vec![prediction("g1", 0.7), prediction("g2", 0.4), prediction("g3", 0.5)],
        )
        .expect("write");
        let schedule = vec![
            game("g1", Some(24), Some(17)),
            game("g2", Some(20), Some(20)),
            game("g3", None, None),
        ];

        let (outcomes, metrics) = grade_week(&store, week, &schedule).expect("grade").expect("final games");
        assert_eq!(outcomes.labels(), vec![1.0, 0.5]);
        assert_eq!(metrics.games, 2);
        assert!(store.outcomes_path(week).exists());

        let rollup: SeasonRollup = read_json(&store.rollup_path(2022)).expect("read").expect("rollup");
        assert_eq!(rollup.games, 2);
        assert_eq!(rollup.weeks.len(), 1);

        // Regrading the same week replaces rather than double counts.
        grade_week(&store, week, &schedule).expect("regrade");
        let rollup: SeasonRollup = read_json(&store.rollup_path(2022)).expect("read").expect("rollup");
        assert_eq!(rollup.games, 2);
    }

    #[test]
    fn unplayed_week_is_not_graded_and_missing_predictions_are_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let week = WeekKey::new(2022, 6);
        let err = grade_week(&store, week, &[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrainerError>(),
            Some(TrainerError::MissingArtifact { .. })
        ));

        write_json_atomic(&store.predictions_path(week), &vec![prediction("g1", 0.6)]).expect("write");
        assert!(grade_week(&store, week, &[game("g1", None, None)]).expect("grade").is_none());
    }

    #[test]
    fn rollup_weights_by_sample_count() {
        let a = Metrics {
            samples: 1,
            log_loss: 1.0,
            ..Metrics::default()
        };
        let b = Metrics {
            samples: 3,
            log_loss: 0.2,
            ..Metrics::default()
        };
        let m = weighted_mean([a, b].into_iter());
        assert_eq!(m.samples, 4);
        assert!((m.log_loss - 0.4).abs() < 1e-12);
    }
}
