use serde::{Deserialize, Serialize};

use crate::error::finite_or;

const MIN_STD: f64 = 1e-9;

/// Per-feature z-score parameters, persisted with every linear artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureScaler {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl FeatureScaler {
    pub fn identity(dims: usize) -> Self {
        Self {
            mean: vec![0.0; dims],
            std: vec![1.0; dims],
        }
    }

    pub fn fit(xs: &[Vec<f64>]) -> Self {
        Self::fit_weighted(xs, None)
    }

    pub fn fit_weighted(xs: &[Vec<f64>], weights: Option<&[f64]>) -> Self {
        let dims = xs.first().map(Vec::len).unwrap_or(0);
        let mut mean = vec![0.0; dims];
        let mut var = vec![0.0; dims];
        let weight_of = |i: usize| weights.and_then(|w| w.get(i)).copied().unwrap_or(1.0).max(1e-6);

        let mut wsum = 0.0;
        for (i, x) in xs.iter().enumerate() {
            let w = weight_of(i);
            wsum += w;
            for (m, v) in mean.iter_mut().zip(x) {
                *m += w * v;
            }
        }
        if wsum <= 0.0 {
            return Self::identity(dims);
        }
        for m in &mut mean {
            *m /= wsum;
        }

        for (i, x) in xs.iter().enumerate() {
            let w = weight_of(i);
            for ((acc, v), m) in var.iter_mut().zip(x).zip(&mean) {
                let d = v - m;
                *acc += w * d * d;
            }
        }
        let std = var
            .into_iter()
            .map(|v| {
                let s = finite_or((v / wsum).sqrt(), 1.0);
                // Constant columns pass through centred instead of exploding.
                if s < MIN_STD { 1.0 } else { s }
            })
            .collect();
        Self {
            mean: mean.into_iter().map(|m| finite_or(m, 0.0)).collect(),
            std,
        }
    }

    pub fn dims(&self) -> usize {
        self.mean.len()
    }

    pub fn transform(&self, x: &[f64]) -> Vec<f64> {
        x.iter()
            .enumerate()
            .map(|(i, v)| {
                let m = self.mean.get(i).copied().unwrap_or(0.0);
                let s = self.std.get(i).copied().unwrap_or(1.0);
                finite_or((v - m) / s, 0.0)
            })
            .collect()
    }

    pub fn transform_all(&self, xs: &[Vec<f64>]) -> Vec<Vec<f64>> {
        xs.iter().map(|x| self.transform(x)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standardizes_columns() {
        let xs = vec![vec![1.0, 5.0], vec![3.0, 5.0]];
        let s = FeatureScaler::fit(&xs);
        assert_eq!(s.mean, vec![2.0, 5.0]);
        assert!((s.std[0] - 1.0).abs() < 1e-12);
        assert_eq!(s.std[1], 1.0);
        assert_eq!(s.transform(&[3.0, 9.0]), vec![1.0, 4.0]);
    }

    #[test]
    fn empty_input_is_identity() {
        let s = FeatureScaler::fit(&[]);
        assert_eq!(s.dims(), 0);
        assert!(s.transform(&[]).is_empty());
    }
}
