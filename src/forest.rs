use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    config::ForestParams,
    features::{FeatureRow, FEATURE_COUNT},
    tree::{DecisionTree, TreeParams},
    types::CATEGORY_COUNT,
};

/// Bagged Gini trees with per-split feature subsampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    trees: Vec<DecisionTree>,
    importances: Vec<f64>,
}

impl RandomForest {
    pub fn fit(rows: &[FeatureRow], labels: &[usize], params: &ForestParams, seed: u64) -> Self {
        let n = rows.len();
        let max_features = params
            .max_features
            .unwrap_or_else(|| (FEATURE_COUNT as f64).sqrt().round() as usize)
            .clamp(1, FEATURE_COUNT);
        let tree_params = TreeParams {
            max_depth: params.max_depth,
            min_samples_split: params.min_samples_split,
            max_features,
        };

        // Each tree owns a seed derived from its position, so the parallel
        // fit gives the same forest as a sequential one.
        let grown: Vec<(DecisionTree, Vec<f64>)> = (0..params.n_trees.max(1))
            .into_par_iter()
            .map(|t| {
                let mut rng = StdRng::seed_from_u64(seed.wrapping_add(t as u64));
                let bootstrap: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
                let mut importances = vec![0.0; FEATURE_COUNT];
                let tree = DecisionTree::fit_classifier(
                    rows,
                    labels,
                    CATEGORY_COUNT,
                    bootstrap,
                    tree_params,
                    &mut rng,
                    &mut importances,
                );
                (tree, importances)
            })
            .collect();

        let mut importances = vec![0.0; FEATURE_COUNT];
        for (_, imp) in &grown {
            for (acc, v) in importances.iter_mut().zip(imp) {
                *acc += v;
            }
        }
        normalize(&mut importances);

        Self {
            trees: grown.into_iter().map(|(tree, _)| tree).collect(),
            importances,
        }
    }

    /// Mean of the per-tree leaf distributions.
    pub fn predict_proba(&self, row: &FeatureRow) -> [f64; CATEGORY_COUNT] {
        let mut acc = [0.0; CATEGORY_COUNT];
        for tree in &self.trees {
            for (a, v) in acc.iter_mut().zip(tree.leaf_value(row)) {
                *a += v;
            }
        }
        let count = self.trees.len().max(1) as f64;
        acc.map(|v| v / count)
    }

    pub fn importances(&self) -> &[f64] {
        &self.importances
    }

    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    pub fn is_well_formed(&self) -> bool {
        !self.trees.is_empty()
            && self.importances.len() == FEATURE_COUNT
            && self.trees.iter().all(|t| t.is_well_formed(CATEGORY_COUNT))
    }
}

pub(crate) fn normalize(values: &mut [f64]) {
    let total: f64 = values.iter().sum();
    if total > 0.0 {
        for v in values.iter_mut() {
            *v /= total;
        }
    }
}
