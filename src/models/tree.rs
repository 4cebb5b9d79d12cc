use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::features::{FeatureKey, FeatureLayout, TeamFeature, TeamGameRow, labeled_matrix, vectorize};
use crate::models::{BaseLearner, ModelKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeConfig {
    pub max_depth_cap: usize,
    pub min_leaf_floor: usize,
    /// Upper bound on split thresholds tried per feature.
    pub candidate_thresholds: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_depth_cap: 8,
            min_leaf_floor: 5,
            candidate_thresholds: 16,
        }
    }
}

/// Growth limits derived from the training size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeSizing {
    pub max_depth: usize,
    pub min_leaf: usize,
    pub alpha: f64,
}

impl TreeSizing {
    pub fn for_rows(n: usize, cfg: &TreeConfig) -> Self {
        let log2n = (n.max(2) as f64).log2();
        let max_depth = ((log2n / 2.0).ceil() as usize).clamp(2, cfg.max_depth_cap.max(2));
        let min_leaf = ((n as f64 / (log2n * log2n)).round() as usize).max(cfg.min_leaf_floor.max(1));
        let alpha = (log2n / 4.0).clamp(0.5, 4.0);
        Self {
            max_depth,
            min_leaf,
            alpha,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        leaf: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeafStats {
    pub wins: f64,
    pub count: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeArtifact {
    pub layout: FeatureLayout,
    pub sizing: TreeSizing,
    /// Node 0 is the root.
    pub nodes: Vec<TreeNode>,
    pub leaves: Vec<LeafStats>,
}

impl TreeArtifact {
    pub fn leaf_probability(&self, leaf: usize) -> f64 {
        let a = self.sizing.alpha;
        match self.leaves.get(leaf) {
            Some(s) => (s.wins + a) / (s.count + 2.0 * a),
            None => 0.5,
        }
    }

    pub fn leaf_for(&self, x: &[f64]) -> usize {
        let mut idx = 0;
        // Depth is bounded, but guard against a malformed node table anyway.
        for _ in 0..=self.nodes.len() {
            match self.nodes.get(idx) {
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let v = x.get(*feature).copied().unwrap_or(0.0);
                    idx = if v <= *threshold { *left } else { *right };
                }
                Some(TreeNode::Leaf { leaf }) => return *leaf,
                None => break,
            }
        }
        usize::MAX
    }

    pub fn score(&self, x: &[f64]) -> f64 {
        self.leaf_probability(self.leaf_for(x))
    }
}

struct Grower<'a> {
    xs: &'a [Vec<f64>],
    ys: &'a [f64],
    sizing: TreeSizing,
    candidates: usize,
    nodes: Vec<TreeNode>,
    leaves: Vec<LeafStats>,
}

impl Grower<'_> {
    fn grow(&mut self, idx: Vec<usize>, depth: usize) -> usize {
        let node = self.nodes.len();
        self.nodes.push(TreeNode::Leaf { leaf: 0 });

        let split = if depth < self.sizing.max_depth && idx.len() >= 2 * self.sizing.min_leaf {
            self.best_split(&idx)
        } else {
            None
        };

        match split {
            Some((feature, threshold)) => {
                let (l, r): (Vec<usize>, Vec<usize>) =
                    idx.into_iter().partition(|&i| self.xs[i][feature] <= threshold);
                let left = self.grow(l, depth + 1);
                let right = self.grow(r, depth + 1);
                self.nodes[node] = TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                };
            }
            None => {
                let wins = idx.iter().map(|&i| self.ys[i]).sum();
                self.leaves.push(LeafStats {
                    wins,
                    count: idx.len() as f64,
                });
                self.nodes[node] = TreeNode::Leaf {
                    leaf: self.leaves.len() - 1,
                };
            }
        }
        node
    }

    /// Gini-minimising (feature, threshold) with both children >= min_leaf.
    fn best_split(&self, idx: &[usize]) -> Option<(usize, f64)> {
        let n = idx.len() as f64;
        let total_wins: f64 = idx.iter().map(|&i| self.ys[i]).sum();
        let parent = gini(total_wins, n);
        let dims = self.xs.first().map(Vec::len).unwrap_or(0);
        let min_leaf = self.sizing.min_leaf;

        let mut best: Option<(usize, f64)> = None;
        let mut best_impurity = parent - 1e-12;
        let mut sorted: Vec<(f64, f64)> = Vec::with_capacity(idx.len());

        for f in 0..dims {
            sorted.clear();
            sorted.extend(idx.iter().map(|&i| (self.xs[i][f], self.ys[i])));
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

            // (left count, left wins) at every admissible value boundary.
            let mut boundaries = Vec::new();
            let mut left_wins = 0.0;
            for pos in 0..sorted.len().saturating_sub(1) {
                left_wins += sorted[pos].1;
                let left_n = pos + 1;
                let right_n = sorted.len() - left_n;
                if left_n >= min_leaf && right_n >= min_leaf && sorted[pos + 1].0 > sorted[pos].0 {
                    boundaries.push((left_n, left_wins));
                }
            }
            let keep = self.candidates.max(1);
            let picks: Vec<(usize, f64)> = if boundaries.len() > keep {
                (0..keep).map(|j| boundaries[j * boundaries.len() / keep]).collect()
            } else {
                boundaries
            };

            for (left_n, left_wins) in picks {
                let right_n = sorted.len() - left_n;
                let impurity = (left_n as f64 * gini(left_wins, left_n as f64)
                    + right_n as f64 * gini(total_wins - left_wins, right_n as f64))
                    / n;
                if impurity < best_impurity {
                    best_impurity = impurity;
                    let threshold = (sorted[left_n - 1].0 + sorted[left_n].0) / 2.0;
                    best = Some((f, threshold));
                }
            }
        }
        best
    }
}

fn gini(wins: f64, n: f64) -> f64 {
    if n <= 0.0 {
        return 0.0;
    }
    let p = wins / n;
    2.0 * p * (1.0 - p)
}

pub fn grow_tree(xs: &[Vec<f64>], ys: &[f64], layout: FeatureLayout, cfg: &TreeConfig) -> TreeArtifact {
    let sizing = TreeSizing::for_rows(xs.len(), cfg);
    let mut grower = Grower {
        xs,
        ys,
        sizing,
        candidates: cfg.candidate_thresholds,
        nodes: Vec::new(),
        leaves: Vec::new(),
    };
    grower.grow((0..xs.len()).collect(), 0);
    TreeArtifact {
        layout,
        sizing,
        nodes: grower.nodes,
        leaves: grower.leaves,
    }
}

/// CART classifier over team-game rows with a Laplace-smoothed leaf table.
#[derive(Debug, Clone, Default)]
pub struct TreeLearner {
    pub cfg: TreeConfig,
}

impl TreeLearner {
    pub fn new(cfg: TreeConfig) -> Self {
        Self { cfg }
    }
}

impl BaseLearner for TreeLearner {
    type Row = TeamGameRow;
    type Artifact = TreeArtifact;

    fn kind(&self) -> ModelKind {
        ModelKind::Tree
    }

    fn train_from(&self, rows: &[TeamGameRow], _warm: Option<&TreeArtifact>) -> TreeArtifact {
        let (xs, ys) = labeled_matrix(rows, TeamFeature::ALL);
        grow_tree(&xs, &ys, FeatureLayout::of::<TeamFeature>(), &self.cfg)
    }

    fn predict(&self, artifact: &TreeArtifact, rows: &[TeamGameRow]) -> Result<Vec<f64>> {
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

    fn layout(dims: usize) -> FeatureLayout {
        FeatureLayout {
            names: (0..dims).map(|i| format!("f{i}")).collect(),
        }
    }

    #[test]
    fn splits_on_the_informative_feature() {
        let mut xs = Vec::new();
        let mut ys = Vec::new();
        for i in 0..200 {
            let signal = (i % 20) as f64;
            let noise = ((i * 7) % 13) as f64;
            xs.push(vec![noise, signal]);
            ys.push(if signal >= 10.0 { 1.0 } else { 0.0 });
        }
        let tree = grow_tree(&xs, &ys, layout(2), &TreeConfig::default());
        match &tree.nodes[0] {
            TreeNode::Split { feature, threshold, .. } => {
                assert_eq!(*feature, 1);
                assert!((9.0..10.0).contains(threshold));
            }
            TreeNode::Leaf { .. } => panic!("root should split"),
        }
        assert!(tree.score(&[0.0, 15.0]) > 0.9);
        assert!(tree.score(&[0.0, 2.0]) < 0.1);
    }

    #[test]
    fn pure_leaves_never_emit_zero_or_one() {
        let xs: Vec<Vec<f64>> = (0..30).map(|i| vec![i as f64]).collect();
        let ys = vec![1.0; 30];
        let tree = grow_tree(&xs, &ys, layout(1), &TreeConfig::default());
        let p = tree.score(&[3.0]);
        assert!(p < 1.0 && p > 0.5);
    }

    #[test]
    fn sizing_grows_with_training_size() {
        let cfg = TreeConfig::default();
        let small = TreeSizing::for_rows(40, &cfg);
        let large = TreeSizing::for_rows(4000, &cfg);
        assert!(large.max_depth > small.max_depth);
        assert!(large.min_leaf >= small.min_leaf);
        assert!(large.alpha > small.alpha);
        assert!(large.max_depth <= cfg.max_depth_cap);
    }

    #[test]
    fn empty_training_set_is_a_single_even_leaf() {
        let tree = grow_tree(&[], &[], layout(3), &TreeConfig::default());
        assert_eq!(tree.nodes.len(), 1);
        assert!((tree.score(&[1.0, 2.0, 3.0]) - 0.5).abs() < 1e-12);
    }
}
