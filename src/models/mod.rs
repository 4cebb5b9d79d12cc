pub mod ann;
pub mod bradley_terry;
pub mod logistic;
pub mod scaler;
pub mod set;
pub mod tree;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::finite_or;
use crate::features::FeatureRow;

pub const PROB_EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Logistic,
    Tree,
    BradleyTerry,
    Ann,
}

impl ModelKind {
    /// Blend-vector order.
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Logistic,
        ModelKind::Tree,
        ModelKind::BradleyTerry,
        ModelKind::Ann,
    ];

    pub fn index(self) -> usize {
        match self {
            ModelKind::Logistic => 0,
            ModelKind::Tree => 1,
            ModelKind::BradleyTerry => 2,
            ModelKind::Ann => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::Logistic => "logistic",
            ModelKind::Tree => "tree",
            ModelKind::BradleyTerry => "bradley_terry",
            ModelKind::Ann => "ann",
        }
    }
}

/// Common contract of the four base learners: fit on labelled rows, emit
/// probabilities in [0, 1] for any rows of the same kind.
pub trait BaseLearner: Sync {
    type Row: FeatureRow + Sync;
    type Artifact: Clone + Send;

    fn kind(&self) -> ModelKind;

    fn train_from(&self, rows: &[Self::Row], warm: Option<&Self::Artifact>) -> Self::Artifact;

    fn predict(&self, artifact: &Self::Artifact, rows: &[Self::Row]) -> Result<Vec<f64>>;

    fn train(&self, rows: &[Self::Row]) -> Self::Artifact {
        self.train_from(rows, None)
    }
}

pub fn sigmoid(z: f64) -> f64 {
    let p = if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    };
    finite_or(p, 0.5)
}

pub fn logit(p: f64) -> f64 {
    let p = clamp_prob(p);
    (p / (1.0 - p)).ln()
}

pub fn clamp_prob(p: f64) -> f64 {
    finite_or(p, 0.5).clamp(PROB_EPS, 1.0 - PROB_EPS)
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Stable 64-bit seed derived from a string key.
pub fn seed_from_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Base rate of a label vector, 0.5 when empty.
pub fn base_rate(ys: &[f64]) -> f64 {
    if ys.is_empty() {
        0.5
    } else {
        ys.iter().sum::<f64>() / ys.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigmoid_is_finite_at_extremes() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-12);
        assert!(sigmoid(1000.0) <= 1.0);
        assert!(sigmoid(-1000.0) >= 0.0);
        assert_eq!(sigmoid(f64::NAN), 0.5);
        assert!((sigmoid(logit(0.8)) - 0.8).abs() < 1e-9);
    }

    #[test]
    fn seeds_are_stable_per_key() {
        assert_eq!(seed_from_key("2023_01_KC_DET"), seed_from_key("2023_01_KC_DET"));
        assert_ne!(seed_from_key("2023_01_KC_DET"), seed_from_key("2023_01_DET_KC"));
    }
}
