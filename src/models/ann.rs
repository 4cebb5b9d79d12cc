//! Feed-forward network committee trained with hand-written backprop.
//!
//! Hidden layers are `affine -> batch-norm -> tanh -> dropout`; the output
//! layer is a single sigmoid unit trained on binary cross-entropy. Seeds
//! train in parallel; each network is owned by the job that trains it.

use std::time::{Duration, Instant};

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::finite_or;
use crate::features::{FeatureKey, FeatureLayout, TeamFeature, TeamGameRow, labeled_matrix, vectorize};
use crate::models::scaler::FeatureScaler;
use crate::models::{BaseLearner, ModelKind, clamp_prob, sigmoid};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnConfig {
    pub hidden: Vec<usize>,
    pub learning_rate: f64,
    pub l2: f64,
    pub dropout: f64,
    pub batch_size: usize,
    pub max_epochs: usize,
    pub patience: usize,
    pub seeds: usize,
    /// Best seeds (by validation loss) kept for the committees.
    pub keep_top: usize,
    pub committee_size: usize,
    pub validation_fraction: f64,
    pub bn_momentum: f64,
    pub bn_eps: f64,
    pub time_limit_ms: Option<u64>,
    pub base_seed: u64,
}

impl Default for AnnConfig {
    fn default() -> Self {
        Self {
            hidden: vec![64, 32, 16],
            learning_rate: 0.01,
            l2: 1e-4,
            dropout: 0.2,
            batch_size: 32,
            max_epochs: 200,
            patience: 15,
            seeds: 8,
            keep_top: 6,
            committee_size: 3,
            validation_fraction: 0.15,
            bn_momentum: 0.1,
            bn_eps: 1e-5,
            time_limit_ms: None,
            base_seed: 7,
        }
    }
}

impl AnnConfig {
    pub fn quick() -> Self {
        Self {
            hidden: vec![8, 4],
            learning_rate: 0.05,
            max_epochs: 30,
            patience: 5,
            seeds: 3,
            keep_top: 3,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Tanh,
    Sigmoid,
}

impl Activation {
    fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => sigmoid(x),
        }
    }

    /// Derivative expressed through the activation's own output.
    fn derivative(self, out: f64) -> f64 {
        match self {
            Activation::Tanh => 1.0 - out * out,
            Activation::Sigmoid => out * (1.0 - out),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNorm {
    pub gamma: Vec<f64>,
    pub beta: Vec<f64>,
    pub running_mean: Vec<f64>,
    pub running_var: Vec<f64>,
}

impl BatchNorm {
    fn new(dim: usize) -> Self {
        Self {
            gamma: vec![1.0; dim],
            beta: vec![0.0; dim],
            running_mean: vec![0.0; dim],
            running_var: vec![1.0; dim],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    /// Weights shape: [out_dim][in_dim]
    pub weights: Vec<Vec<f64>>,
    /// Bias shape: [out_dim]
    pub bias: Vec<f64>,
    pub activation: Activation,
    #[serde(default)]
    pub norm: Option<BatchNorm>,
    #[serde(default)]
    pub dropout: f64,
}

impl DenseLayer {
    fn xavier(in_dim: usize, out_dim: usize, activation: Activation, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (in_dim + out_dim).max(1) as f64).sqrt();
        Self {
            weights: (0..out_dim)
                .map(|_| (0..in_dim).map(|_| rng.gen_range(-limit..limit)).collect())
                .collect(),
            bias: vec![0.0; out_dim],
            activation,
            norm: None,
            dropout: 0.0,
        }
    }

    fn in_dim(&self) -> usize {
        self.weights.first().map(|r| r.len()).unwrap_or(0)
    }

    fn out_dim(&self) -> usize {
        self.weights.len()
    }

    fn affine(&self, x: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(x).map(|(w, v)| w * v).sum::<f64>() + b)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Network {
    pub input_dim: usize,
    pub layers: Vec<DenseLayer>,
    pub bn_momentum: f64,
    pub bn_eps: f64,
}

/// Everything the backward pass needs from one layer's forward pass.
struct LayerCache {
    input: Vec<Vec<f64>>,
    /// Normalized pre-activation (the raw pre-activation without batch-norm).
    zhat: Vec<Vec<f64>>,
    inv_std: Vec<f64>,
    batch_mean: Vec<f64>,
    batch_var: Vec<f64>,
    /// Activation output before dropout.
    output: Vec<Vec<f64>>,
    /// Inverted-dropout multipliers; empty when dropout is off.
    mask: Vec<Vec<f64>>,
}

struct ForwardCache {
    layers: Vec<LayerCache>,
    probs: Vec<f64>,
}

#[derive(Debug, Clone)]
struct LayerGrad {
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
    gamma: Vec<f64>,
    beta: Vec<f64>,
}

impl Network {
    pub fn new(input_dim: usize, cfg: &AnnConfig, rng: &mut StdRng) -> Self {
        let mut layers = Vec::with_capacity(cfg.hidden.len() + 1);
        let mut prev = input_dim;
        for &width in &cfg.hidden {
            let mut layer = DenseLayer::xavier(prev, width, Activation::Tanh, rng);
            layer.norm = Some(BatchNorm::new(width));
            layer.dropout = cfg.dropout.clamp(0.0, 0.95);
            layers.push(layer);
            prev = width;
        }
        layers.push(DenseLayer::xavier(prev, 1, Activation::Sigmoid, rng));
        Self {
            input_dim,
            layers,
            bn_momentum: cfg.bn_momentum,
            bn_eps: cfg.bn_eps,
        }
    }

    /// True when this network can be reused as the starting point for `cfg`.
    pub fn matches_shape(&self, input_dim: usize, hidden: &[usize]) -> bool {
        self.input_dim == input_dim
            && self.layers.len() == hidden.len() + 1
            && self.layers.iter().zip(hidden).all(|(l, h)| l.out_dim() == *h)
            && self.layers.first().is_some_and(|l| l.in_dim() == input_dim)
    }

    /// Inference: running batch-norm statistics, no dropout.
    pub fn predict_one(&self, x: &[f64]) -> f64 {
        let mut h = x.to_vec();
        for layer in &self.layers {
            let mut z = layer.affine(&h);
            if let Some(bn) = &layer.norm {
                for (j, v) in z.iter_mut().enumerate() {
                    let inv = 1.0 / (bn.running_var[j] + self.bn_eps).sqrt();
                    *v = bn.gamma[j] * (*v - bn.running_mean[j]) * inv + bn.beta[j];
                }
            }
            h = z
                .into_iter()
                .map(|v| finite_or(layer.activation.apply(v), 0.0))
                .collect();
        }
        clamp_prob(h.first().copied().unwrap_or(0.5))
    }

    pub fn log_loss(&self, xs: &[Vec<f64>], ys: &[f64]) -> f64 {
        if xs.is_empty() {
            return f64::INFINITY;
        }
        let total: f64 = xs
            .iter()
            .zip(ys)
            .map(|(x, y)| bce(self.predict_one(x), *y))
            .sum();
        total / xs.len() as f64
    }

    fn forward_train(&self, batch: Vec<Vec<f64>>, rng: &mut StdRng, use_dropout: bool) -> ForwardCache {
        let bsz = batch.len().max(1) as f64;
        let mut caches = Vec::with_capacity(self.layers.len());
        let mut input = batch;

        for layer in &self.layers {
            let out_dim = layer.out_dim();
            let z: Vec<Vec<f64>> = input.iter().map(|x| layer.affine(x)).collect();

            let (zhat, pre, batch_mean, batch_var, inv_std) = match &layer.norm {
                Some(bn) => {
                    let mut mean = vec![0.0; out_dim];
                    for row in &z {
                        for (m, v) in mean.iter_mut().zip(row) {
                            *m += v / bsz;
                        }
                    }
                    let mut var = vec![0.0; out_dim];
                    for row in &z {
                        for j in 0..out_dim {
                            var[j] += (row[j] - mean[j]).powi(2) / bsz;
                        }
                    }
                    let inv_std: Vec<f64> = var.iter().map(|v| 1.0 / (v + self.bn_eps).sqrt()).collect();
                    let zhat: Vec<Vec<f64>> = z
                        .iter()
                        .map(|row| (0..out_dim).map(|j| (row[j] - mean[j]) * inv_std[j]).collect())
                        .collect();
                    let pre: Vec<Vec<f64>> = zhat
                        .iter()
                        .map(|row| {
                            (0..out_dim).map(|j| bn.gamma[j] * row[j] + bn.beta[j]).collect()
                        })
                        .collect();
                    (zhat, pre, mean, var, inv_std)
                }
                None => (z.clone(), z, Vec::new(), Vec::new(), Vec::new()),
            };

            let output: Vec<Vec<f64>> = pre
                .iter()
                .map(|row| row.iter().map(|v| finite_or(layer.activation.apply(*v), 0.0)).collect())
                .collect();

            let mask: Vec<Vec<f64>> = if use_dropout && layer.dropout > 0.0 {
                let keep = 1.0 - layer.dropout;
                output
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|_| if rng.r#gen::<f64>() < keep { 1.0 / keep } else { 0.0 })
                            .collect()
                    })
                    .collect()
            } else {
                Vec::new()
            };

            let next: Vec<Vec<f64>> = if mask.is_empty() {
                output.clone()
            } else {
                output
                    .iter()
                    .zip(&mask)
                    .map(|(o, m)| o.iter().zip(m).map(|(a, b)| a * b).collect())
                    .collect()
            };

            caches.push(LayerCache {
                input,
                zhat,
                inv_std,
                batch_mean,
                batch_var,
                output,
                mask,
            });
            input = next;
        }

        let probs = input
            .iter()
            .map(|row| clamp_prob(row.first().copied().unwrap_or(0.5)))
            .collect();
        ForwardCache {
            layers: caches,
            probs,
        }
    }

    /// Gradients of the mean binary cross-entropy over the cached batch.
    fn backward(&self, cache: &ForwardCache, ys: &[f64]) -> Vec<LayerGrad> {
        let bsz = ys.len().max(1) as f64;
        let mut grads: Vec<LayerGrad> = Vec::with_capacity(self.layers.len());
        // Gradient w.r.t. the (post-dropout) output of the current layer.
        let mut upstream: Vec<Vec<f64>> = Vec::new();

        for (l, layer) in self.layers.iter().enumerate().rev() {
            let c = &cache.layers[l];
            let out_dim = layer.out_dim();
            let is_output = l + 1 == self.layers.len();

            // d loss / d pre-activation.
            let dpre: Vec<Vec<f64>> = if is_output {
                // Sigmoid + cross-entropy collapses to (p - y).
                cache
                    .probs
                    .iter()
                    .zip(ys)
                    .map(|(p, y)| vec![(p - y) / bsz])
                    .collect()
            } else {
                upstream
                    .iter()
                    .enumerate()
                    .map(|(i, up)| {
                        (0..out_dim)
                            .map(|j| {
                                let m = c.mask.get(i).map(|r| r[j]).unwrap_or(1.0);
                                up[j] * m * layer.activation.derivative(c.output[i][j])
                            })
                            .collect()
                    })
                    .collect()
            };

            let mut g_gamma = Vec::new();
            let mut g_beta = Vec::new();
            let dz: Vec<Vec<f64>> = match &layer.norm {
                Some(bn) => {
                    g_gamma = vec![0.0; out_dim];
                    g_beta = vec![0.0; out_dim];
                    let mut sum_dzhat = vec![0.0; out_dim];
                    let mut sum_dzhat_zhat = vec![0.0; out_dim];
                    let dzhat: Vec<Vec<f64>> = dpre
                        .iter()
                        .zip(&c.zhat)
                        .map(|(dp, zh)| {
                            (0..out_dim)
                                .map(|j| {
                                    g_gamma[j] += dp[j] * zh[j];
                                    g_beta[j] += dp[j];
                                    let d = dp[j] * bn.gamma[j];
                                    sum_dzhat[j] += d;
                                    sum_dzhat_zhat[j] += d * zh[j];
                                    d
                                })
                                .collect()
                        })
                        .collect();
                    dzhat
                        .iter()
                        .zip(&c.zhat)
                        .map(|(dzh, zh)| {
                            (0..out_dim)
                                .map(|j| {
                                    c.inv_std[j] / bsz
                                        * (bsz * dzh[j] - sum_dzhat[j] - zh[j] * sum_dzhat_zhat[j])
                                })
                                .collect()
                        })
                        .collect()
                }
                None => dpre,
            };

            let in_dim = layer.in_dim();
            let mut g_w = vec![vec![0.0; in_dim]; out_dim];
            let mut g_b = vec![0.0; out_dim];
            let mut next_up = vec![vec![0.0; in_dim]; dz.len()];
            for (i, dzi) in dz.iter().enumerate() {
                let x = &c.input[i];
                for j in 0..out_dim {
                    let d = dzi[j];
                    g_b[j] += d;
                    for k in 0..in_dim {
                        g_w[j][k] += d * x[k];
                        next_up[i][k] += d * layer.weights[j][k];
                    }
                }
            }
            grads.push(LayerGrad {
                weights: g_w,
                bias: g_b,
                gamma: g_gamma,
                beta: g_beta,
            });
            upstream = next_up;
        }
        grads.reverse();
        grads
    }

    fn apply_gradients(&mut self, grads: &[LayerGrad], lr: f64, l2: f64) {
        for (layer, g) in self.layers.iter_mut().zip(grads) {
            for (row, grow) in layer.weights.iter_mut().zip(&g.weights) {
                for (w, gw) in row.iter_mut().zip(grow) {
                    *w = finite_or(*w - lr * (gw + l2 * *w), 0.0);
                }
            }
            for (b, gb) in layer.bias.iter_mut().zip(&g.bias) {
                *b = finite_or(*b - lr * gb, 0.0);
            }
            if let Some(bn) = &mut layer.norm {
                for (v, gv) in bn.gamma.iter_mut().zip(&g.gamma) {
                    *v = finite_or(*v - lr * gv, 1.0);
                }
                for (v, gv) in bn.beta.iter_mut().zip(&g.beta) {
                    *v = finite_or(*v - lr * gv, 0.0);
                }
            }
        }
    }

    fn update_running_stats(&mut self, cache: &ForwardCache) {
        let m = self.bn_momentum;
        for (layer, c) in self.layers.iter_mut().zip(&cache.layers) {
            if let Some(bn) = &mut layer.norm {
                for (r, v) in bn.running_mean.iter_mut().zip(&c.batch_mean) {
                    *r = finite_or((1.0 - m) * *r + m * v, 0.0);
                }
                for (r, v) in bn.running_var.iter_mut().zip(&c.batch_var) {
                    *r = finite_or((1.0 - m) * *r + m * v, 1.0).max(0.0);
                }
            }
        }
    }
}

fn bce(p: f64, y: f64) -> f64 {
    let p = clamp_prob(p);
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub seed: u64,
    pub val_loss: f64,
    pub epochs: usize,
    pub network: Network,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Committee {
    pub members: Vec<Member>,
}

impl Committee {
    pub fn predict_one(&self, x: &[f64]) -> f64 {
        if self.members.is_empty() {
            return 0.5;
        }
        self.members.iter().map(|m| m.network.predict_one(x)).sum::<f64>() / self.members.len() as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnArtifact {
    pub layout: FeatureLayout,
    pub scaler: FeatureScaler,
    pub committees: Vec<Committee>,
    pub seeds_requested: usize,
    pub seeds_finished: usize,
    pub trained_rows: usize,
}

impl AnnArtifact {
    /// Mean over committees of each committee's member mean.
    pub fn score(&self, raw: &[f64]) -> f64 {
        if self.committees.is_empty() {
            return 0.5;
        }
        let x = self.scaler.transform(raw);
        let total: f64 = self.committees.iter().map(|c| c.predict_one(&x)).sum();
        clamp_prob(total / self.committees.len() as f64)
    }

    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.committees.iter().flat_map(|c| c.members.iter().map(|m| &m.network))
    }
}

/// Trains one seed with patience-based early stopping; returns the best
/// network seen on the validation rows.
pub fn train_seed(
    cfg: &AnnConfig,
    train: (&[Vec<f64>], &[f64]),
    val: (&[Vec<f64>], &[f64]),
    seed: u64,
    init: Option<&Network>,
) -> Member {
    let (xs, ys) = train;
    let dims = xs.first().map(Vec::len).unwrap_or(0);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut net = match init {
        Some(n) if n.matches_shape(dims, &cfg.hidden) => n.clone(),
        _ => Network::new(dims, cfg, &mut rng),
    };
    // Warm-started networks keep the configured dropout.
    for layer in net.layers.iter_mut().filter(|l| l.norm.is_some()) {
        layer.dropout = cfg.dropout.clamp(0.0, 0.95);
    }

    let (vx, vy) = if val.0.is_empty() { train } else { val };
    let mut best = net.clone();
    let mut best_loss = net.log_loss(vx, vy);
    let mut best_epoch = 0;
    let mut stale = 0;
    let mut order: Vec<usize> = (0..xs.len()).collect();
    let batch = cfg.batch_size.max(2);

    for epoch in 0..cfg.max_epochs {
        order.shuffle(&mut rng);
        for chunk in order.chunks(batch) {
            // Batch statistics are undefined for a single row.
            if chunk.len() < 2 {
                continue;
            }
            let bx: Vec<Vec<f64>> = chunk.iter().map(|&i| xs[i].clone()).collect();
            let by: Vec<f64> = chunk.iter().map(|&i| ys[i]).collect();
            let cache = net.forward_train(bx, &mut rng, true);
            let grads = net.backward(&cache, &by);
            net.apply_gradients(&grads, cfg.learning_rate, cfg.l2);
            net.update_running_stats(&cache);
        }

        let loss = finite_or(net.log_loss(vx, vy), f64::INFINITY);
        if loss + 1e-6 < best_loss {
            best_loss = loss;
            best = net.clone();
            best_epoch = epoch + 1;
            stale = 0;
        } else {
            stale += 1;
            if stale >= cfg.patience.max(1) {
                break;
            }
        }
    }

    Member {
        seed,
        val_loss: best_loss,
        epochs: best_epoch,
        network: best,
    }
}

/// Trains all seeds (stopping early on the time budget after at least one),
/// keeps the best `keep_top`, and groups them into committees.
pub fn train_committees(
    cfg: &AnnConfig,
    xs: &[Vec<f64>],
    ys: &[f64],
    warm: &[Network],
) -> (Vec<Committee>, usize) {
    let n = xs.len();
    let holdout = if n >= 20 {
        ((n as f64 * cfg.validation_fraction).ceil() as usize).clamp(1, n - 1)
    } else {
        0
    };
    let split = n - holdout;
    let train = (&xs[..split], &ys[..split]);
    let val = (&xs[split..], &ys[split..]);

    let started = Instant::now();
    let budget = cfg.time_limit_ms.map(Duration::from_millis);
    let requested = cfg.seeds.max(1);
    let mut members: Vec<Member> = (0..requested)
        .into_par_iter()
        .filter_map(|s| {
            // Seed 0 always runs; later seeds are dropped once the budget is spent.
            if s > 0 && budget.is_some_and(|b| started.elapsed() >= b) {
                return None;
            }
            let seed = cfg.base_seed.wrapping_add(s as u64 * 1_000_003);
            let init = if warm.is_empty() { None } else { warm.get(s % warm.len()) };
            Some(train_seed(cfg, train, val, seed, init))
        })
        .collect();
    let finished = members.len();
    if finished < requested {
        debug!(finished, requested, "ann time budget reached");
    }

    members.sort_by(|a, b| a.val_loss.total_cmp(&b.val_loss));
    members.truncate(cfg.keep_top.max(1));
    let committees = members
        .chunks(cfg.committee_size.max(1))
        .map(|c| Committee { members: c.to_vec() })
        .collect();
    (committees, finished)
}

#[derive(Debug, Clone, Default)]
pub struct AnnLearner {
    pub cfg: AnnConfig,
}

impl AnnLearner {
    pub fn new(cfg: AnnConfig) -> Self {
        Self { cfg }
    }
}

impl BaseLearner for AnnLearner {
    type Row = TeamGameRow;
    type Artifact = AnnArtifact;

    fn kind(&self) -> ModelKind {
        ModelKind::Ann
    }

    /// Rows are expected in chronological order; the most recent slice is
    /// held out for early stopping.
    fn train_from(&self, rows: &[TeamGameRow], warm: Option<&AnnArtifact>) -> AnnArtifact {
        let layout = FeatureLayout::of::<TeamFeature>();
        let (xs, ys) = labeled_matrix(rows, TeamFeature::ALL);
        let scaler = FeatureScaler::fit(&xs);
        if xs.is_empty() {
            return AnnArtifact {
                layout,
                scaler,
                committees: Vec::new(),
                seeds_requested: self.cfg.seeds,
                seeds_finished: 0,
                trained_rows: 0,
            };
        }
        let zs = scaler.transform_all(&xs);
        let warm_nets: Vec<Network> = warm
            .filter(|w| w.layout == layout)
            .map(|w| w.networks().cloned().collect())
            .unwrap_or_default();
        let (committees, finished) = train_committees(&self.cfg, &zs, &ys, &warm_nets);
        AnnArtifact {
            layout,
            scaler,
            committees,
            seeds_requested: self.cfg.seeds,
            seeds_finished: finished,
            trained_rows: xs.len(),
        }
    }

    fn predict(&self, artifact: &AnnArtifact, rows: &[TeamGameRow]) -> Result<Vec<f64>> {
        let keys = artifact.layout.resolve::<TeamFeature>()?;
        Ok(rows
            .iter()
            .map(|row| artifact.score(&vectorize(row, &keys)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_cfg(dropout: f64) -> AnnConfig {
        AnnConfig {
            hidden: vec![4, 3],
            dropout,
            ..AnnConfig::default()
        }
    }

    fn batch() -> (Vec<Vec<f64>>, Vec<f64>) {
        (
            vec![
                vec![0.5, -1.2, 0.3],
                vec![-0.7, 0.4, 1.1],
                vec![1.5, 0.2, -0.4],
                vec![-0.1, -0.9, 0.8],
                vec![0.9, 1.3, -1.0],
            ],
            vec![1.0, 0.0, 1.0, 0.0, 1.0],
        )
    }

    fn batch_loss(net: &Network, xs: &[Vec<f64>], ys: &[f64]) -> f64 {
        let mut rng = StdRng::seed_from_u64(0);
        let cache = net.forward_train(xs.to_vec(), &mut rng, false);
        cache.probs.iter().zip(ys).map(|(p, y)| bce(*p, *y)).sum::<f64>() / ys.len() as f64
    }

    fn numeric(net: &Network, xs: &[Vec<f64>], ys: &[f64], poke: impl Fn(&mut Network, f64)) -> f64 {
        let h = 1e-6;
        let mut plus = net.clone();
        poke(&mut plus, h);
        let mut minus = net.clone();
        poke(&mut minus, -h);
        (batch_loss(&plus, xs, ys) - batch_loss(&minus, xs, ys)) / (2.0 * h)
    }

    fn close(analytic: f64, numeric: f64) -> bool {
        (analytic - numeric).abs() <= 1e-5 + 1e-3 * numeric.abs().max(analytic.abs())
    }

    #[test]
    fn backward_matches_finite_differences_through_batch_norm() {
        let mut rng = StdRng::seed_from_u64(42);
        let net = Network::new(3, &tiny_cfg(0.0), &mut rng);
        let (xs, ys) = batch();
        let cache = net.forward_train(xs.clone(), &mut rng, false);
        let grads = net.backward(&cache, &ys);

        for (l, j, k) in [(0, 1, 2), (0, 3, 0), (1, 2, 1), (2, 0, 1)] {
            let n = numeric(&net, &xs, &ys, |m, h| m.layers[l].weights[j][k] += h);
            assert!(close(grads[l].weights[j][k], n), "w[{l}][{j}][{k}]: {} vs {n}", grads[l].weights[j][k]);
        }
        for (l, j) in [(0, 0), (1, 2)] {
            let n = numeric(&net, &xs, &ys, |m, h| {
                if let Some(bn) = &mut m.layers[l].norm {
                    bn.gamma[j] += h;
                }
            });
            assert!(close(grads[l].gamma[j], n), "gamma[{l}][{j}]");
            let n = numeric(&net, &xs, &ys, |m, h| {
                if let Some(bn) = &mut m.layers[l].norm {
                    bn.beta[j] += h;
                }
            });
            assert!(close(grads[l].beta[j], n), "beta[{l}][{j}]");
        }
        let n = numeric(&net, &xs, &ys, |m, h| m.layers[2].bias[0] += h);
        assert!(close(grads[2].bias[0], n));
        // Batch-norm absorbs the hidden bias.
        assert!(grads[0].bias.iter().all(|g| g.abs() < 1e-9));
    }

    #[test]
    fn dropout_masks_zero_or_rescale_units() {
        let mut rng = StdRng::seed_from_u64(3);
        let net = Network::new(3, &tiny_cfg(0.5), &mut rng);
        let (xs, _) = batch();
        let cache = net.forward_train(xs, &mut rng, true);
        let mask = &cache.layers[0].mask;
        assert_eq!(mask.len(), 5);
        assert!(mask.iter().flatten().all(|m| *m == 0.0 || (*m - 2.0).abs() < 1e-12));
        assert!(cache.layers[2].mask.is_empty());
    }

    #[test]
    fn inference_is_deterministic_and_bounded() {
        let mut rng = StdRng::seed_from_u64(9);
        let net = Network::new(3, &tiny_cfg(0.3), &mut rng);
        let x = [0.2, -0.4, 1.0];
        let a = net.predict_one(&x);
        assert_eq!(a, net.predict_one(&x));
        assert!(a > 0.0 && a < 1.0);
        assert!(net.predict_one(&[f64::NAN, 0.0, 0.0]).is_finite());
    }

    fn toy_problem(n: usize) -> (Vec<Vec<f64>>, Vec<f64>) {
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for i in 0..n {
            let a = ((i * 37) % 101) as f64 / 50.0 - 1.0;
            let b = ((i * 53) % 97) as f64 / 48.0 - 1.0;
            xs.push(vec![a, b]);
            ys.push(if a + 0.5 * b > 0.0 { 1.0 } else { 0.0 });
        }
        (xs, ys)
    }

    #[test]
    fn committee_learns_a_linear_boundary() {
        let (xs, ys) = toy_problem(240);
        let cfg = AnnConfig {
            learning_rate: 0.1,
            patience: 10,
            max_epochs: 80,
            ..AnnConfig::quick()
        };
        let (committees, finished) = train_committees(&cfg, &xs, &ys, &[]);
        assert_eq!(finished, cfg.seeds);
        let members: usize = committees.iter().map(|c| c.members.len()).sum();
        assert_eq!(members, cfg.keep_top.min(cfg.seeds));
        for c in &committees {
            assert!(c.members.windows(2).all(|w| w[0].val_loss <= w[1].val_loss));
        }

        let mean = |x: &[f64]| committees.iter().map(|c| c.predict_one(x)).sum::<f64>() / committees.len() as f64;
        assert!(mean(&[0.9, 0.5]) > 0.7);
        assert!(mean(&[-0.9, -0.5]) < 0.3);
    }

    #[test]
    fn parallel_seeds_give_the_same_committees_every_run() {
        let (xs, ys) = toy_problem(60);
        let cfg = AnnConfig {
            seeds: 4,
            keep_top: 4,
            max_epochs: 15,
            ..AnnConfig::quick()
        };
        let first = train_committees(&cfg, &xs, &ys, &[]);
        let second = train_committees(&cfg, &xs, &ys, &[]);
        assert_eq!(first.1, 4);
        assert_eq!(first, second);
    }

    #[test]
    fn time_budget_still_finishes_one_seed() {
        let (xs, ys) = toy_problem(60);
        let cfg = AnnConfig {
            seeds: 5,
            time_limit_ms: Some(1),
            max_epochs: 20,
            ..AnnConfig::quick()
        };
        let (committees, finished) = train_committees(&cfg, &xs, &ys, &[]);
        assert!(finished >= 1 && finished <= 5);
        assert!(!committees.is_empty());
    }

    #[test]
    fn warm_start_reuses_matching_networks_only() {
        let (xs, ys) = toy_problem(40);
        let cfg = AnnConfig {
            max_epochs: 0,
            ..AnnConfig::quick()
        };
        let mut rng = StdRng::seed_from_u64(1);
        let warm = Network::new(2, &cfg, &mut rng);
        let member = train_seed(&cfg, (&xs, &ys), (&[], &[]), 5, Some(&warm));
        assert_eq!(member.network, warm);

        let other = Network::new(3, &cfg, &mut rng);
        let fresh = train_seed(&cfg, (&xs, &ys), (&[], &[]), 5, Some(&other));
        assert_eq!(fresh.network.input_dim, 2);
    }
}
