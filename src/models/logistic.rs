use anyhow::Result;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::finite_or;
use crate::features::{FeatureKey, FeatureLayout, FeatureRow, TeamGameRow, labeled_matrix, vectorize};
use crate::models::scaler::FeatureScaler;
use crate::models::{BaseLearner, ModelKind, base_rate, dot, logit, sigmoid};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticConfig {
    pub learning_rate: f64,
    pub l2: f64,
    pub epochs: usize,
    pub batch_size: usize,
    pub seed: u64,
}

impl Default for LogisticConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            l2: 0.01,
            epochs: 200,
            batch_size: 32,
            seed: 17,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticArtifact {
    pub layout: FeatureLayout,
    pub scaler: FeatureScaler,
    pub weights: Vec<f64>,
    pub bias: f64,
    pub trained_rows: usize,
}

impl LogisticArtifact {
    /// Predicts the base rate for every input.
    pub fn constant(layout: FeatureLayout, p: f64) -> Self {
        let dims = layout.len();
        Self {
            layout,
            scaler: FeatureScaler::identity(dims),
            weights: vec![0.0; dims],
            bias: logit(p),
            trained_rows: 0,
        }
    }

    /// Probability for a raw (unscaled) vector in this artifact's layout order.
    pub fn score(&self, raw: &[f64]) -> f64 {
        let z = self.scaler.transform(raw);
        sigmoid(dot(&self.weights, &z) + self.bias)
    }

    /// Per-feature contributions `w_i * z_i` for a raw vector.
    pub fn contributions(&self, raw: &[f64]) -> Vec<f64> {
        self.scaler
            .transform(raw)
            .iter()
            .zip(&self.weights)
            .map(|(z, w)| finite_or(z * w, 0.0))
            .collect()
    }
}

/// Mini-batch gradient descent with L2 on already-standardized rows.
/// Non-finite coordinates are reset to zero after every step.
pub fn fit_matrix(
    xs: &[Vec<f64>],
    ys: &[f64],
    cfg: &LogisticConfig,
    init: Option<(&[f64], f64)>,
) -> (Vec<f64>, f64) {
    let dims = xs.first().map(Vec::len).unwrap_or(0);
    let (mut weights, mut bias) = match init {
        Some((w, b)) if w.len() == dims => (w.to_vec(), finite_or(b, 0.0)),
        _ => (vec![0.0; dims], logit(base_rate(ys))),
    };
    if xs.is_empty() {
        return (weights, bias);
    }

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut order: Vec<usize> = (0..xs.len()).collect();
    let batch = cfg.batch_size.max(1);
    let mut grad = vec![0.0; dims];

    for epoch in 0..cfg.epochs {
        order.shuffle(&mut rng);
        let lr = cfg.learning_rate / (1.0 + epoch as f64 * 0.01);
        for chunk in order.chunks(batch) {
            grad.iter_mut().for_each(|g| *g = 0.0);
            let mut grad_b = 0.0;
            for &i in chunk {
                let p = sigmoid(dot(&weights, &xs[i]) + bias);
                let err = p - ys[i];
                for (g, x) in grad.iter_mut().zip(&xs[i]) {
                    *g += err * x;
                }
                grad_b += err;
            }
            let n = chunk.len() as f64;
            for (w, g) in weights.iter_mut().zip(&grad) {
                *w -= lr * (g / n + cfg.l2 * *w);
                *w = finite_or(*w, 0.0);
            }
            bias = finite_or(bias - lr * grad_b / n, 0.0);
        }
    }
    (weights, bias)
}

/// Trains on any row kind, recording the row kind's canonical layout.
pub fn train_rows<R: FeatureRow>(
    cfg: &LogisticConfig,
    rows: &[R],
    warm: Option<&LogisticArtifact>,
) -> LogisticArtifact {
    let layout = FeatureLayout::of::<R::Key>();
    let (xs, ys) = labeled_matrix(rows, R::Key::ALL);
    if xs.is_empty() {
        return LogisticArtifact::constant(layout, 0.5);
    }
    let scaler = FeatureScaler::fit(&xs);
    let zs = scaler.transform_all(&xs);
    let init = warm
        .filter(|w| w.layout == layout)
        .map(|w| (w.weights.as_slice(), w.bias));
    let (weights, bias) = fit_matrix(&zs, &ys, cfg, init);
    LogisticArtifact {
        layout,
        scaler,
        weights,
        bias,
        trained_rows: xs.len(),
    }
}

/// Scores rows in the artifact's recorded feature order.
pub fn predict_rows<R: FeatureRow>(artifact: &LogisticArtifact, rows: &[R]) -> Result<Vec<f64>> {
    let keys = artifact.layout.resolve::<R::Key>()?;
    Ok(rows
        .iter()
        .map(|row| artifact.score(&vectorize(row, &keys)))
        .collect())
}

/// Team-game logistic regression.
#[derive(Debug, Clone, Default)]
pub struct LogisticLearner {
    pub cfg: LogisticConfig,
}

impl LogisticLearner {
    pub fn new(cfg: LogisticConfig) -> Self {
        Self { cfg }
    }
}

impl BaseLearner for LogisticLearner {
    type Row = TeamGameRow;
    type Artifact = LogisticArtifact;

    fn kind(&self) -> ModelKind {
        ModelKind::Logistic
    }

    fn train_from(&self, rows: &[TeamGameRow], warm: Option<&LogisticArtifact>) -> LogisticArtifact {
        train_rows(&self.cfg, rows, warm)
    }

    fn predict(&self, artifact: &LogisticArtifact, rows: &[TeamGameRow]) -> Result<Vec<f64>> {
        predict_rows(artifact, rows)
    }
}
