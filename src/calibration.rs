use serde::{Deserialize, Serialize};

use crate::error::finite_or;
use crate::models::{clamp_prob, logit, sigmoid};

pub const RECALIBRATION_BINS: usize = 10;
pub const REPORT_BINS: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub samples: usize,
    pub log_loss: f64,
    pub brier: f64,
    pub auc: f64,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBin {
    pub bucket_start: f64,
    pub bucket_end: f64,
    pub count: usize,
    pub avg_pred: f64,
    pub actual_rate: f64,
}

/// Metrics plus calibration error for one prediction vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub metrics: Metrics,
    pub ece: f64,
    pub mce: f64,
    pub bins: Vec<CalibrationBin>,
}

impl CalibrationReport {
    pub fn build(predictions: &[f64], labels: &[f64]) -> Self {
        let bins = calibration_bins(predictions, labels, REPORT_BINS);
        let (ece, mce) = calibration_error(&bins);
        Self {
            metrics: evaluate(predictions, labels),
            ece,
            mce,
            bins,
        }
    }
}

/// Labels are 1 (home win), 0 (loss) or 0.5 (tie, graded as a half).
pub fn evaluate(predictions: &[f64], labels: &[f64]) -> Metrics {
    if predictions.is_empty() || predictions.len() != labels.len() {
        return Metrics::default();
    }

    let mut brier_sum = 0.0_f64;
    let mut log_loss_sum = 0.0_f64;
    let mut correct = 0.0_f64;
    for (p, y) in predictions.iter().zip(labels) {
        let p = clamp_prob(*p);
        brier_sum += (p - y).powi(2);
        log_loss_sum += -(y * p.ln() + (1.0 - y) * (1.0 - p).ln());
        correct += if *y == 0.5 {
            0.5
        } else if (p >= 0.5) == (*y >= 0.5) {
            1.0
        } else {
            0.0
        };
    }

    let n = predictions.len() as f64;
    Metrics {
        samples: predictions.len(),
        brier: brier_sum / n,
        log_loss: log_loss_sum / n,
        auc: auc(predictions, labels),
        accuracy: correct / n,
    }
}

/// Rank-based AUC over decided games; 0.5 when either class is missing.
pub fn auc(predictions: &[f64], labels: &[f64]) -> f64 {
    let mut scored: Vec<(f64, bool)> = predictions
        .iter()
        .zip(labels)
        .filter(|(_, y)| **y == 0.0 || **y == 1.0)
        .map(|(p, y)| (finite_or(*p, 0.5), *y == 1.0))
        .collect();
    let pos = scored.iter().filter(|(_, y)| *y).count() as f64;
    let neg = scored.len() as f64 - pos;
    if pos == 0.0 || neg == 0.0 {
        return 0.5;
    }
    scored.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Average ranks across ties.
    let mut rank_sum_pos = 0.0;
    let mut i = 0;
    while i < scored.len() {
        let mut j = i;
        while j + 1 < scored.len() && scored[j + 1].0 == scored[i].0 {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for item in &scored[i..=j] {
            if item.1 {
                rank_sum_pos += avg_rank;
            }
        }
        i = j + 1;
    }
    (rank_sum_pos - pos * (pos + 1.0) / 2.0) / (pos * neg)
}

pub fn calibration_bins(predictions: &[f64], labels: &[f64], bins: usize) -> Vec<CalibrationBin> {
    let bins = bins.max(2);
    let mut counts = vec![0usize; bins];
    let mut pred_sum = vec![0.0_f64; bins];
    let mut actual_sum = vec![0.0_f64; bins];

    for (p, y) in predictions.iter().zip(labels) {
        let p = finite_or(*p, 0.5).clamp(0.0, 1.0);
        let idx = ((p * bins as f64).floor() as usize).min(bins - 1);
        counts[idx] += 1;
        pred_sum[idx] += p;
        actual_sum[idx] += y;
    }

    (0..bins)
        .map(|i| {
            let count = counts[i];
            let (avg_pred, actual_rate) = if count > 0 {
                (pred_sum[i] / count as f64, actual_sum[i] / count as f64)
            } else {
                (0.0, 0.0)
            };
            CalibrationBin {
                bucket_start: i as f64 / bins as f64,
                bucket_end: (i + 1) as f64 / bins as f64,
                count,
                avg_pred,
                actual_rate,
            }
        })
        .collect()
}

/// (ECE, MCE) over populated bins.
pub fn calibration_error(bins: &[CalibrationBin]) -> (f64, f64) {
    let total: usize = bins.iter().map(|b| b.count).sum();
    if total == 0 {
        return (0.0, 0.0);
    }
    bins.iter().filter(|b| b.count > 0).fold((0.0, 0.0), |(ece, mce), b| {
        let gap = (b.avg_pred - b.actual_rate).abs();
        (ece + gap * b.count as f64 / total as f64, f64::max(mce, gap))
    })
}

/// `sigmoid(beta * p + intercept)` with `beta >= 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Recalibration {
    pub beta: f64,
    pub intercept: f64,
}

impl Recalibration {
    pub fn new(beta: f64, intercept: f64) -> Self {
        Self {
            beta: finite_or(beta, 0.0).max(0.0),
            intercept: finite_or(intercept, 0.0),
        }
    }

    pub fn apply(&self, p: f64) -> f64 {
        clamp_prob(sigmoid(self.beta * finite_or(p, 0.5) + self.intercept))
    }

    /// Weighted least squares of binned empirical log-odds on the binned
    /// mean prediction. `None` when there is nothing to fit.
    pub fn fit(predictions: &[f64], labels: &[f64]) -> Option<Self> {
        if predictions.is_empty() || predictions.len() != labels.len() {
            return None;
        }
        let bins = calibration_bins(predictions, labels, RECALIBRATION_BINS);
        let points: Vec<(f64, f64, f64)> = bins
            .iter()
            .filter(|b| b.count > 0)
            .map(|b| {
                let n = b.count as f64;
                let wins = b.actual_rate * n;
                (b.avg_pred, logit((wins + 0.5) / (n + 1.0)), n)
            })
            .collect();
        if points.len() < 2 {
            return None;
        }

        let wsum: f64 = points.iter().map(|(_, _, w)| w).sum();
        let x_bar = points.iter().map(|(x, _, w)| x * w).sum::<f64>() / wsum;
        let t_bar = points.iter().map(|(_, t, w)| t * w).sum::<f64>() / wsum;
        let sxx: f64 = points.iter().map(|(x, _, w)| w * (x - x_bar).powi(2)).sum();
        let sxt: f64 = points
            .iter()
            .map(|(x, t, w)| w * (x - x_bar) * (t - t_bar))
            .sum();
        if sxx < 1e-12 {
            return None;
        }

        let beta = sxt / sxx;
        if !beta.is_finite() {
            return None;
        }
        if beta < 0.0 {
            // Anti-monotone fit: fall back to the flat base rate.
            let base = labels.iter().sum::<f64>() / labels.len() as f64;
            return Some(Self::new(0.0, logit(base)));
        }
        Some(Self::new(beta, t_bar - beta * x_bar))
    }
}

/// Applies an optional calibration; `None` is the identity.
pub fn recalibrate(cal: Option<&Recalibration>, p: f64) -> f64 {
    match cal {
        Some(c) => c.apply(p),
        None => clamp_prob(p),
    }
}
