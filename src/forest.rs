use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::PredictError;

/// Regularization knobs for the bagged ensemble. The defaults are
/// deliberately biased toward underfitting: mortality-adjacent features
/// correlate tautologically with the mortality-derived label, so shallow
/// trees with large leaves are the point, not a tuning compromise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    /// Fraction of rows drawn (with replacement) per tree.
    pub max_samples: f64,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        ForestConfig {
            n_trees: 50,
            max_depth: 5,
            min_samples_split: 50,
            min_samples_leaf: 25,
            max_samples: 0.7,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        proba: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    /// Positive-class probability at the leaf this row lands in.
    fn proba(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { proba } => return *proba,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    idx = if row[*feature] <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    pub config: ForestConfig,
    pub n_features: usize,
    trees: Vec<DecisionTree>,
    /// Mean normalized impurity decrease per feature across trees.
    pub feature_importances: Vec<f64>,
}

impl RandomForest {
    /// Fit on pre-scaled rows with binary labels. Sample weights are
    /// class-balanced: each class contributes half the total weight.
    pub fn fit(rows: &[Vec<f64>], labels: &[bool], config: ForestConfig) -> Self {
        let n = rows.len();
        let n_features = rows.first().map_or(0, |r| r.len());
        let n_pos = labels.iter().filter(|l| **l).count();
        let n_neg = n - n_pos;
        let (w_pos, w_neg) = if n_pos == 0 || n_neg == 0 {
            (1.0, 1.0)
        } else {
            (n as f64 / (2.0 * n_pos as f64), n as f64 / (2.0 * n_neg as f64))
        };
        let weights: Vec<f64> = labels
            .iter()
            .map(|l| if *l { w_pos } else { w_neg })
            .collect();

        let mut rng = StdRng::seed_from_u64(config.seed);
        let draws = ((config.max_samples * n as f64).ceil() as usize).clamp(1, n.max(1));
        let mtry = ((n_features as f64).sqrt() as usize).max(1);

        let mut trees = Vec::with_capacity(config.n_trees);
        let mut importances = vec![0.0; n_features];

        for _ in 0..config.n_trees {
            let sample: Vec<usize> = (0..draws).map(|_| rng.gen_range(0..n)).collect();
            let mut builder = TreeBuilder {
                rows,
                labels,
                weights: &weights,
                config: &config,
                mtry,
                nodes: Vec::new(),
                importance: vec![0.0; n_features],
                root_weight: sample.iter().map(|&i| weights[i]).sum(),
            };
            builder.grow(sample, 0, &mut rng);

            let total: f64 = builder.importance.iter().sum();
            if total > 0.0 {
                for (acc, imp) in importances.iter_mut().zip(&builder.importance) {
                    *acc += imp / total;
                }
            }
            trees.push(DecisionTree {
                nodes: builder.nodes,
            });
        }

        for imp in &mut importances {
            *imp /= config.n_trees as f64;
        }

        RandomForest {
            config,
            n_features,
            trees,
            feature_importances: importances,
        }
    }

    /// Mean positive-class probability across trees. Rejects rows whose
    /// width differs from the trained schema instead of truncating or
    /// padding.
    pub fn predict_proba(&self, row: &[f64]) -> Result<f64, PredictError> {
        if row.len() != self.n_features {
            return Err(PredictError::SchemaMismatch {
                expected: self.n_features,
                actual: row.len(),
            });
        }
        let sum: f64 = self.trees.iter().map(|t| t.proba(row)).sum();
        Ok(sum / self.trees.len() as f64)
    }
}

struct TreeBuilder<'a> {
    rows: &'a [Vec<f64>],
    labels: &'a [bool],
    weights: &'a [f64],
    config: &'a ForestConfig,
    mtry: usize,
    nodes: Vec<Node>,
    importance: Vec<f64>,
    root_weight: f64,
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    decrease: f64,
    left: Vec<usize>,
    right: Vec<usize>,
}

impl TreeBuilder<'_> {
    /// Grow the subtree for `indices`, returning its node id.
    fn grow(&mut self, indices: Vec<usize>, depth: usize, rng: &mut StdRng) -> usize {
        let (node_weight, pos_weight) = self.weigh(&indices);
        let proba = if node_weight > 0.0 { pos_weight / node_weight } else { 0.0 };

        let stop = depth >= self.config.max_depth
            || indices.len() < self.config.min_samples_split
            || proba == 0.0
            || proba == 1.0;
        let split = if stop { None } else { self.best_split(&indices, rng) };

        match split {
            None => {
                self.nodes.push(Node::Leaf { proba });
                self.nodes.len() - 1
            }
            Some(best) => {
                self.importance[best.feature] +=
                    best.decrease * (node_weight / self.root_weight);
                // Reserve the split slot before growing children so ids are
                // stable.
                let id = self.nodes.len();
                self.nodes.push(Node::Leaf { proba });
                let left = self.grow(best.left, depth + 1, rng);
                let right = self.grow(best.right, depth + 1, rng);
                self.nodes[id] = Node::Split {
                    feature: best.feature,
                    threshold: best.threshold,
                    left,
                    right,
                };
                id
            }
        }
    }

    fn weigh(&self, indices: &[usize]) -> (f64, f64) {
        let mut total = 0.0;
        let mut pos = 0.0;
        for &i in indices {
            total += self.weights[i];
            if self.labels[i] {
                pos += self.weights[i];
            }
        }
        (total, pos)
    }

    fn best_split(&self, indices: &[usize], rng: &mut StdRng) -> Option<BestSplit> {
        let n_features = self.rows[indices[0]].len();
        let features = sample_distinct(rng, n_features, self.mtry);

        let (node_weight, pos_weight) = self.weigh(indices);
        let parent_gini = gini(pos_weight / node_weight);

        let mut best: Option<BestSplit> = None;

        for feature in features {
            let mut order: Vec<usize> = indices.to_vec();
            order.sort_by(|&a, &b| {
                self.rows[a][feature]
                    .partial_cmp(&self.rows[b][feature])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            let mut left_w = 0.0;
            let mut left_pos = 0.0;
            for k in 1..order.len() {
                let prev = order[k - 1];
                left_w += self.weights[prev];
                if self.labels[prev] {
                    left_pos += self.weights[prev];
                }

                let prev_v = self.rows[prev][feature];
                let next_v = self.rows[order[k]][feature];
                if prev_v == next_v {
                    continue;
                }
                if k < self.config.min_samples_leaf
                    || order.len() - k < self.config.min_samples_leaf
                {
                    continue;
                }

                let right_w = node_weight - left_w;
                let right_pos = pos_weight - left_pos;
                let child_gini = (left_w / node_weight) * gini(left_pos / left_w)
                    + (right_w / node_weight) * gini(right_pos / right_w);
                let decrease = parent_gini - child_gini;

                if decrease > 1e-12
                    && best.as_ref().map_or(true, |b| decrease > b.decrease)
                {
                    let threshold = (prev_v + next_v) / 2.0;
                    let (left, right) = indices
                        .iter()
                        .copied()
                        .partition(|&i| self.rows[i][feature] <= threshold);
                    best = Some(BestSplit {
                        feature,
                        threshold,
                        decrease,
                        left,
                        right,
                    });
                }
            }
        }

        best
    }
}

fn gini(p: f64) -> f64 {
    2.0 * p * (1.0 - p)
}

/// Draw `count` distinct values from 0..n by partial Fisher-Yates.
fn sample_distinct(rng: &mut StdRng, n: usize, count: usize) -> Vec<usize> {
    let mut pool: Vec<usize> = (0..n).collect();
    let take = count.min(n);
    for i in 0..take {
        let j = rng.gen_range(i..n);
        pool.swap(i, j);
    }
    pool.truncate(take);
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    fn separable_corpus() -> (Vec<Vec<f64>>, Vec<bool>) {
        // Label depends only on feature 0; feature 1 is noise with a fixed
        // pattern so the data stays deterministic.
        let mut rows = Vec::new();
        let mut labels = Vec::new();
        for i in 0..200 {
            let x = i as f64 / 10.0;
            rows.push(vec![x, (i % 7) as f64]);
            labels.push(x > 10.0);
        }
        (rows, labels)
    }

    fn test_config() -> ForestConfig {
        ForestConfig {
            n_trees: 15,
            max_depth: 4,
            min_samples_split: 8,
            min_samples_leaf: 4,
            max_samples: 0.8,
            seed: 7,
        }
    }

    #[test]
    fn learns_a_separable_boundary() {
        let (rows, labels) = separable_corpus();
        let forest = RandomForest::fit(&rows, &labels, test_config());
        let high = forest.predict_proba(&[18.0, 2.0]).unwrap();
        let low = forest.predict_proba(&[2.0, 2.0]).unwrap();
        assert!(high > 0.8, "high side scored {high}");
        assert!(low < 0.2, "low side scored {low}");
    }

    #[test]
    fn same_seed_reproduces_identical_scores() {
        let (rows, labels) = separable_corpus();
        let a = RandomForest::fit(&rows, &labels, test_config());
        let b = RandomForest::fit(&rows, &labels, test_config());
        let row = vec![13.0, 5.0];
        assert_eq!(a.predict_proba(&row).unwrap(), b.predict_proba(&row).unwrap());
    }

    #[test]
    fn rejects_rows_of_the_wrong_width() {
        let (rows, labels) = separable_corpus();
        let forest = RandomForest::fit(&rows, &labels, test_config());
        let err = forest.predict_proba(&[1.0, 2.0, 3.0]).unwrap_err();
        assert!(err.to_string().contains("feature schema mismatch"));
    }

    #[test]
    fn importances_favor_the_informative_feature() {
        let (rows, labels) = separable_corpus();
        let forest = RandomForest::fit(&rows, &labels, test_config());
        let total: f64 = forest.feature_importances.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!(forest.feature_importances[0] > forest.feature_importances[1]);
    }

    #[test]
    fn single_class_corpus_yields_constant_probability() {
        let rows = vec![vec![1.0], vec![2.0], vec![3.0], vec![4.0]];
        let labels = vec![false; 4];
        let forest = RandomForest::fit(&rows, &labels, test_config());
        assert_eq!(forest.predict_proba(&[2.5]).unwrap(), 0.0);
    }
}
