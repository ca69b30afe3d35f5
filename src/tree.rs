use rand::{rngs::StdRng, seq::index::sample};
use serde::{Deserialize, Serialize};

use crate::features::{FeatureRow, FEATURE_COUNT};

const MIN_GAIN: f64 = 1e-12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Node {
    Leaf {
        value: Vec<f64>,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct TreeParams {
    pub max_depth: usize,
    pub min_samples_split: usize,
    /// Candidate features per split, drawn without replacement.
    pub max_features: usize,
}

/// Binary tree stored as a flat arena; node 0 is the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<Node>,
}

impl DecisionTree {
    pub fn leaf_value(&self, row: &FeatureRow) -> &[f64] {
        let mut idx = 0;
        while let Some(node) = self.nodes.get(idx) {
            match node {
                Node::Leaf { value } => return value,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let v = row.get(*feature).copied().unwrap_or(0.0);
                    idx = if v <= *threshold { *left } else { *right };
                }
            }
        }
        &[]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize) -> usize {
            match nodes.get(idx) {
                Some(Node::Split { left, right, .. }) => 1 + walk(nodes, *left).max(walk(nodes, *right)),
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }

    /// Children must point forward so traversal always terminates, and
    /// every leaf must carry `width` values.
    pub fn is_well_formed(&self, width: usize) -> bool {
        !self.nodes.is_empty()
            && self.nodes.iter().enumerate().all(|(i, node)| match node {
                Node::Leaf { value } => value.len() == width && value.iter().all(|v| v.is_finite()),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    *feature < FEATURE_COUNT
                        && threshold.is_finite()
                        && *left > i
                        && *right > i
                        && *left < self.nodes.len()
                        && *right < self.nodes.len()
                }
            })
    }

    /// Gini-split classification tree. Leaves hold class frequencies.
    /// Impurity decrease per feature is added into `importances`.
    pub fn fit_classifier(
        rows: &[FeatureRow],
        labels: &[usize],
        n_classes: usize,
        indices: Vec<usize>,
        params: TreeParams,
        rng: &mut StdRng,
        importances: &mut [f64],
    ) -> Self {
        let mut builder = ClassifierBuilder {
            rows,
            labels,
            n_classes,
            params,
            total: indices.len().max(1) as f64,
            nodes: Vec::new(),
        };
        builder.grow(indices, 0, rng, importances);
        Self {
            nodes: builder.nodes,
        }
    }

    /// Least-squares regression tree on `targets`; each leaf's value comes
    /// from `leaf` applied to the rows that reach it.
    pub fn fit_regressor<F>(
        rows: &[FeatureRow],
        targets: &[f64],
        indices: Vec<usize>,
        params: TreeParams,
        leaf: F,
        importances: &mut [f64],
    ) -> Self
    where
        F: Fn(&[usize]) -> f64,
    {
        let mut builder = RegressorBuilder {
            rows,
            targets,
            params,
            leaf,
            nodes: Vec::new(),
        };
        builder.grow(indices, 0, importances);
        Self {
            nodes: builder.nodes,
        }
    }
}

struct ClassifierBuilder<'a> {
    rows: &'a [FeatureRow],
    labels: &'a [usize],
    n_classes: usize,
    params: TreeParams,
    total: f64,
    nodes: Vec<Node>,
}

impl ClassifierBuilder<'_> {
    fn grow(&mut self, indices: Vec<usize>, depth: usize, rng: &mut StdRng, importances: &mut [f64]) -> usize {
        let counts = self.class_counts(&indices);
        let n = indices.len();
        let impurity = gini(&counts, n);

        let can_split = depth < self.params.max_depth
            && n >= self.params.min_samples_split.max(2)
            && impurity > 0.0;

        let best = if can_split {
            let features = candidate_features(self.params.max_features, rng);
            self.best_split(&indices, &features, impurity)
        } else {
            None
        };

        let Some((feature, threshold, gain)) = best else {
            let value = counts.iter().map(|c| *c as f64 / n.max(1) as f64).collect();
            self.nodes.push(Node::Leaf { value });
            return self.nodes.len() - 1;
        };

        if let Some(slot) = importances.get_mut(feature) {
            *slot += gain * n as f64 / self.total;
        }

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| self.rows[i][feature] <= threshold);

        let id = self.nodes.len();
        self.nodes.push(Node::Split {
            feature,
            threshold,
            left: 0,
            right: 0,
        });
        let left = self.grow(left_idx, depth + 1, rng, importances);
        let right = self.grow(right_idx, depth + 1, rng, importances);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    fn class_counts(&self, indices: &[usize]) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_classes];
        for &i in indices {
            if let Some(c) = counts.get_mut(self.labels[i]) {
                *c += 1;
            }
        }
        counts
    }

    fn best_split(&self, indices: &[usize], features: &[usize], parent: f64) -> Option<(usize, f64, f64)> {
        let n = indices.len();
        let total = self.class_counts(indices);
        let mut best: Option<(usize, f64, f64)> = None;
        let mut sorted = indices.to_vec();

        for &f in features {
            sorted.sort_by(|a, b| self.rows[*a][f].total_cmp(&self.rows[*b][f]));
            let mut left = vec![0usize; self.n_classes];

            for pos in 0..n - 1 {
                let i = sorted[pos];
                if let Some(c) = left.get_mut(self.labels[i]) {
                    *c += 1;
                }
                let here = self.rows[i][f];
                let next = self.rows[sorted[pos + 1]][f];
                if here == next {
                    continue;
                }

                let nl = pos + 1;
                let nr = n - nl;
                let right: Vec<usize> = total.iter().zip(&left).map(|(t, l)| t - l).collect();
                let weighted = (nl as f64 * gini(&left, nl) + nr as f64 * gini(&right, nr)) / n as f64;
                let gain = parent - weighted;

                if gain > MIN_GAIN && best.map_or(true, |(_, _, g)| gain > g) {
                    best = Some((f, (here + next) / 2.0, gain));
                }
            }
        }
        best
    }
}

struct RegressorBuilder<'a, F> {
    rows: &'a [FeatureRow],
    targets: &'a [f64],
    params: TreeParams,
    leaf: F,
    nodes: Vec<Node>,
}

impl<F> RegressorBuilder<'_, F>
where
    F: Fn(&[usize]) -> f64,
{
    fn grow(&mut self, indices: Vec<usize>, depth: usize, importances: &mut [f64]) -> usize {
        let n = indices.len();
        let can_split = depth < self.params.max_depth && n >= self.params.min_samples_split.max(2);

        let best = if can_split {
            self.best_split(&indices)
        } else {
            None
        };

        let Some((feature, threshold, gain)) = best else {
            let value = (self.leaf)(&indices);
            self.nodes.push(Node::Leaf {
                value: vec![if value.is_finite() { value } else { 0.0 }],
            });
            return self.nodes.len() - 1;
        };

        if let Some(slot) = importances.get_mut(feature) {
            *slot += gain;
        }

        let (left_idx, right_idx): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| self.rows[i][feature] <= threshold);

        let id = self.nodes.len();
        self.nodes.push(Node::Split {
            feature,
            threshold,
            left: 0,
            right: 0,
        });
        let left = self.grow(left_idx, depth + 1, importances);
        let right = self.grow(right_idx, depth + 1, importances);
        self.nodes[id] = Node::Split {
            feature,
            threshold,
            left,
            right,
        };
        id
    }

    /// Maximizes the reduction in squared error.
    fn best_split(&self, indices: &[usize]) -> Option<(usize, f64, f64)> {
        let n = indices.len();
        let sum: f64 = indices.iter().map(|&i| self.targets[i]).sum();
        let base = sum * sum / n as f64;
        let mut best: Option<(usize, f64, f64)> = None;
        let mut sorted = indices.to_vec();

        for f in 0..FEATURE_COUNT {
            sorted.sort_by(|a, b| self.rows[*a][f].total_cmp(&self.rows[*b][f]));
            let mut left_sum = 0.0;

            for pos in 0..n - 1 {
                let i = sorted[pos];
                left_sum += self.targets[i];
                let here = self.rows[i][f];
                let next = self.rows[sorted[pos + 1]][f];
                if here == next {
                    continue;
                }

                let nl = (pos + 1) as f64;
                let nr = (n - pos - 1) as f64;
                let right_sum = sum - left_sum;
                let gain = left_sum * left_sum / nl + right_sum * right_sum / nr - base;

                if gain > MIN_GAIN && best.map_or(true, |(_, _, g)| gain > g) {
                    best = Some((f, (here + next) / 2.0, gain));
                }
            }
        }
        best
    }
}

fn gini(counts: &[usize], n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    1.0 - counts.iter().map(|c| (*c as f64 / n).powi(2)).sum::<f64>()
}

fn candidate_features(max_features: usize, rng: &mut StdRng) -> Vec<usize> {
    let m = max_features.clamp(1, FEATURE_COUNT);
    if m == FEATURE_COUNT {
        return (0..FEATURE_COUNT).collect();
    }
    let mut picked = sample(rng, FEATURE_COUNT, m).into_vec();
    picked.sort_unstable();
    picked
}
