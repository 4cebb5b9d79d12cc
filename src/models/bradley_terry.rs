use std::collections::HashMap;

use anyhow::Result;
use rand::SeedableRng;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::finite_or;
use crate::features::{DiffFeature, FeatureRow, GameDifferentialRow, StatSnapshot};
use crate::models::logistic::{self, LogisticArtifact, LogisticConfig};
use crate::models::{BaseLearner, ModelKind, clamp_prob, seed_from_key};
use crate::temporal::{Timed, WeekKey, is_before};

const KERNEL_DIMS: usize = StatSnapshot::KERNEL_DIMS;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BradleyTerryConfig {
    pub logistic: LogisticConfig,
    pub draws: usize,
    /// Gaussian kernel bandwidth in standardized stat units.
    pub bandwidth: f64,
    pub half_life_weeks: f64,
    /// Fewer past games than this for either side means no simulation.
    pub min_history: usize,
    /// Most recent games kept per team.
    pub history_limit: usize,
}

impl Default for BradleyTerryConfig {
    fn default() -> Self {
        Self {
            logistic: LogisticConfig {
                learning_rate: 0.05,
                l2: 0.02,
                ..LogisticConfig::default()
            },
            draws: 500,
            bandwidth: 1.0,
            half_life_weeks: 24.0,
            min_history: 3,
            history_limit: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BradleyTerryArtifact {
    pub model: LogisticArtifact,
    /// Spread of each kernel stat across the training actuals.
    pub stat_scale: Vec<f64>,
}

/// One past game of one team: what it produced and what its opponent produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub week: WeekKey,
    pub own: StatSnapshot,
    pub opponent: StatSnapshot,
}

/// Per-team actual stat history, newest last.
#[derive(Debug, Clone, Default)]
pub struct TeamHistory {
    by_team: HashMap<String, Vec<HistoryEntry>>,
}

impl TeamHistory {
    /// Collects actuals from games strictly before `target`.
    pub fn before(rows: &[GameDifferentialRow], target: WeekKey, limit: usize) -> Self {
        let mut by_team: HashMap<String, Vec<HistoryEntry>> = HashMap::new();
        for row in rows.iter().filter(|r| is_before(target, *r)) {
            let (Some(home), Some(away)) = (row.home_actual, row.away_actual) else {
                continue;
            };
            let week = row.week_key();
            by_team.entry(row.home_team.clone()).or_default().push(HistoryEntry {
                week,
                own: home,
                opponent: away,
            });
            by_team.entry(row.away_team.clone()).or_default().push(HistoryEntry {
                week,
                own: away,
                opponent: home,
            });
        }
        for entries in by_team.values_mut() {
            entries.sort_by_key(|e| e.week);
            if entries.len() > limit {
                entries.drain(..entries.len() - limit);
            }
        }
        Self { by_team }
    }

    pub fn get(&self, team: &str) -> &[HistoryEntry] {
        self.by_team.get(team).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn insert(&mut self, team: &str, entries: Vec<HistoryEntry>) {
        self.by_team.insert(team.to_string(), entries);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BootstrapEstimate {
    pub base_prob: f64,
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
    pub draws: usize,
    pub fallback: bool,
}

impl BootstrapEstimate {
    fn degenerate(base_prob: f64, draws: usize) -> Self {
        Self {
            base_prob,
            mean: base_prob,
            lower: base_prob,
            upper: base_prob,
            draws,
            fallback: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BradleyTerryLearner {
    pub cfg: BradleyTerryConfig,
}

impl BradleyTerryLearner {
    pub fn new(cfg: BradleyTerryConfig) -> Self {
        Self { cfg }
    }

    /// Point estimate plus a similarity/recency-weighted resampling of both
    /// teams' actual stat lines, re-scored through the fitted model.
    pub fn simulate(
        &self,
        artifact: &BradleyTerryArtifact,
        row: &GameDifferentialRow,
        history: &TeamHistory,
    ) -> Result<BootstrapEstimate> {
        let keys = artifact.model.layout.resolve::<DiffFeature>()?;
        let base_vector: Vec<f64> = keys.iter().map(|k| finite_or(row.value(*k), 0.0)).collect();
        let base_prob = clamp_prob(artifact.model.score(&base_vector));
        let draws = self.cfg.draws.max(1);

        let target = row.week_key();
        let home = self.sampler(artifact, history.get(&row.home_team), &row.away_profile, target);
        let away = self.sampler(artifact, history.get(&row.away_team), &row.home_profile, target);
        let (Some(home), Some(away)) = (home, away) else {
            return Ok(BootstrapEstimate::degenerate(base_prob, draws));
        };

        let mut rng = StdRng::seed_from_u64(seed_from_key(&row.game_id));
        let mut probs = Vec::with_capacity(draws);
        let mut synthetic = base_vector.clone();
        for _ in 0..draws {
            let h = home.entries[home.index.sample(&mut rng)].own.kernel_vector();
            let a = away.entries[away.index.sample(&mut rng)].own.kernel_vector();
            for (slot, key) in synthetic.iter_mut().zip(&keys) {
                if let Some(i) = key.kernel_index() {
                    *slot = finite_or(h[i] - a[i], 0.0);
                }
            }
            probs.push(artifact.model.score(&synthetic));
        }

        let mean = clamp_prob(probs.iter().sum::<f64>() / probs.len() as f64);
        probs.sort_by(f64::total_cmp);
        Ok(BootstrapEstimate {
            base_prob,
            mean,
            lower: clamp_prob(percentile(&probs, 0.05)),
            upper: clamp_prob(percentile(&probs, 0.95)),
            draws,
            fallback: false,
        })
    }

    /// Bootstrap estimate for each row, drawing from the actuals in
    /// `context` strictly before that row's week. The estimate's `mean` is
    /// the model's game probability; it equals the point estimate when a
    /// side has too little history.
    pub fn estimate_rows(
        &self,
        artifact: &BradleyTerryArtifact,
        rows: &[GameDifferentialRow],
        context: &[GameDifferentialRow],
    ) -> Result<Vec<BootstrapEstimate>> {
        let mut histories: HashMap<WeekKey, TeamHistory> = HashMap::new();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.week_key();
            let history = histories
                .entry(key)
                .or_insert_with(|| TeamHistory::before(context, key, self.cfg.history_limit));
            out.push(self.simulate(artifact, row, history)?);
        }
        Ok(out)
    }

    fn sampler<'h>(
        &self,
        artifact: &BradleyTerryArtifact,
        entries: &'h [HistoryEntry],
        opponent_now: &StatSnapshot,
        target: WeekKey,
    ) -> Option<Sampler<'h>> {
        if entries.len() < self.cfg.min_history.max(1) {
            return None;
        }
        let now = opponent_now.kernel_vector();
        let h2 = 2.0 * self.cfg.bandwidth.max(1e-6).powi(2);
        let half_life = self.cfg.half_life_weeks.max(1e-6);
        let weights: Vec<f64> = entries
            .iter()
            .map(|e| {
                let past = e.opponent.kernel_vector();
                let d2: f64 = (0..KERNEL_DIMS)
                    .map(|i| {
                        let s = artifact.stat_scale.get(i).copied().unwrap_or(1.0).max(1e-9);
                        ((past[i] - now[i]) / s).powi(2)
                    })
                    .sum();
                let similarity = (-d2 / h2).exp();
                let recency = 0.5_f64.powf(e.week.weeks_until(target) / half_life);
                finite_or(similarity * recency, 0.0).max(0.0)
            })
            .collect();
        let index = WeightedIndex::new(&weights).ok()?;
        Some(Sampler { entries, index })
    }
}

struct Sampler<'h> {
    entries: &'h [HistoryEntry],
    index: WeightedIndex<f64>,
}

/// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.5;
    }
    let idx = ((sorted.len() - 1) as f64 * q).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn stat_scale(rows: &[GameDifferentialRow]) -> Vec<f64> {
    let snaps: Vec<[f64; KERNEL_DIMS]> = rows
        .iter()
        .flat_map(|r| [r.home_actual, r.away_actual])
        .flatten()
        .map(|s| s.kernel_vector())
        .collect();
    if snaps.len() < 2 {
        return vec![1.0; KERNEL_DIMS];
    }
    let n = snaps.len() as f64;
    (0..KERNEL_DIMS)
        .map(|i| {
            let mean = snaps.iter().map(|s| s[i]).sum::<f64>() / n;
            let var = snaps.iter().map(|s| (s[i] - mean).powi(2)).sum::<f64>() / n;
            let sd = finite_or(var.sqrt(), 1.0);
            if sd < 1e-9 { 1.0 } else { sd }
        })
        .collect()
}

impl BaseLearner for BradleyTerryLearner {
    type Row = GameDifferentialRow;
    type Artifact = BradleyTerryArtifact;

    fn kind(&self) -> ModelKind {
        ModelKind::BradleyTerry
    }

    fn train_from(
        &self,
        rows: &[GameDifferentialRow],
        warm: Option<&BradleyTerryArtifact>,
    ) -> BradleyTerryArtifact {
        BradleyTerryArtifact {
            model: logistic::train_rows(&self.cfg.logistic, rows, warm.map(|w| &w.model)),
            stat_scale: stat_scale(rows),
        }
    }

    fn predict(&self, artifact: &BradleyTerryArtifact, rows: &[GameDifferentialRow]) -> Result<Vec<f64>> {
        logistic::predict_rows(&artifact.model, rows)
    }
}
