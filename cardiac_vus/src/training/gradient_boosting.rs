//! Fallback booster on the `gbdt` crate: log-likelihood gradient boosting,
//! converted to the shared tree-ensemble form once fitted.
//!
//! gbdt draws row and column subsamples from an unseeded thread RNG, so both
//! sampling ratios stay at 1.0 and a fit is a pure function of its data.

use gbdt::config::Config;
use gbdt::decision_tree::{Data, DataVec};
use gbdt::gradient_boost::GBDT;
use log::{debug, info};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::training::tree::{max_score_gap, sigmoid, Node, Tree, TreeEnsemble};

/// Converted probabilities may differ from gbdt's own by f32 rounding only.
const AGREEMENT_TOLERANCE: f64 = 1e-4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradientBoostingParams {
    pub n_rounds: usize,
    pub max_depth: u32,
    pub learning_rate: f64,
    pub min_leaf_size: usize,
}

impl Default for GradientBoostingParams {
    fn default() -> Self {
        GradientBoostingParams {
            n_rounds: 300,
            max_depth: 3,
            learning_rate: 0.05,
            min_leaf_size: 1,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// gbdt's serialized model, as far as prediction needs it
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SavedModel {
    trees: Vec<SavedTree>,
    bias: f32,
}

#[derive(Deserialize)]
struct SavedTree {
    tree: SavedNodes,
}

#[derive(Deserialize)]
struct SavedNodes {
    tree: Vec<SavedNode>,
}

#[derive(Deserialize)]
struct SavedNode {
    value: SavedSplit,
    left: usize,
    right: usize,
}

#[derive(Deserialize)]
struct SavedSplit {
    feature_index: usize,
    feature_value: f32,
    pred: f32,
    is_leaf: bool,
}

/// Rebuild one gbdt tree in preorder. gbdt's log-likelihood margin is half
/// the log-odds, so leaf values are doubled on top of the shrinkage.
fn convert_tree(saved: &[SavedNode], leaf_scale: f64) -> Result<Tree> {
    fn visit(saved: &[SavedNode], idx: usize, leaf_scale: f64, nodes: &mut Vec<Node>) -> Result<usize> {
        let node = saved
            .get(idx)
            .ok_or_else(|| PipelineError::Fit(format!("gbdt tree refers to missing node {idx}")))?;
        let at = nodes.len();
        // a left/right index of 0 means "no child"
        if node.value.is_leaf || node.left == 0 || node.right == 0 {
            nodes.push(Node::Leaf {
                value: leaf_scale * f64::from(node.value.pred),
                cover: 0.0,
            });
            return Ok(at);
        }
        nodes.push(Node::Leaf { value: 0.0, cover: 0.0 });
        let left = visit(saved, node.left, leaf_scale, nodes)?;
        let right = visit(saved, node.right, leaf_scale, nodes)?;
        nodes[at] = Node::Split {
            feature: node.value.feature_index,
            threshold: f64::from(node.value.feature_value),
            left,
            right,
            cover: 0.0,
        };
        Ok(at)
    }

    let mut nodes = Vec::with_capacity(saved.len());
    visit(saved, 0, leaf_scale, &mut nodes)?;
    Ok(Tree { nodes })
}

fn to_ensemble(model: &GBDT, learning_rate: f64, x: &Array2<f64>) -> Result<TreeEnsemble> {
    let saved: SavedModel = serde_json::from_value(serde_json::to_value(model)?)?;
    let leaf_scale = 2.0 * f64::from(learning_rate as f32);
    let mut trees = saved
        .trees
        .iter()
        .map(|t| convert_tree(&t.tree.tree, leaf_scale))
        .collect::<Result<Vec<_>>>()?;
    for tree in &mut trees {
        tree.count_covers(x);
    }
    Ok(TreeEnsemble {
        base_score: 2.0 * f64::from(saved.bias),
        trees,
    })
}

fn single_precision(x: &Array2<f64>) -> impl Iterator<Item = Vec<f32>> + '_ {
    x.rows().into_iter().map(|row| row.iter().map(|&v| v as f32).collect())
}

pub fn fit_gradient_boosting(x: &Array2<f64>, y: &[u8], params: &GradientBoostingParams) -> Result<TreeEnsemble> {
    info!(
        "Gradient boosting (gbdt): {} rounds, depth {}, learning rate {}",
        params.n_rounds, params.max_depth, params.learning_rate
    );
    let mut cfg = Config::new();
    cfg.set_feature_size(x.ncols());
    cfg.set_max_depth(params.max_depth);
    cfg.set_iterations(params.n_rounds);
    cfg.set_shrinkage(params.learning_rate as f32);
    cfg.set_min_leaf_size(params.min_leaf_size);
    cfg.set_loss("LogLikelyhood");
    cfg.set_data_sample_ratio(1.0);
    cfg.set_feature_sample_ratio(1.0);

    // labels are -1 / 1 for the log-likelihood loss
    let mut train: DataVec = single_precision(x)
        .zip(y)
        .map(|(features, &label)| Data::new_training_data(features, 1.0, if label == 1 { 1.0 } else { -1.0 }, None))
        .collect();
    let mut model = GBDT::new(&cfg);
    model.fit(&mut train);

    let ensemble = to_ensemble(&model, params.learning_rate, x)?;
    let test: DataVec = single_precision(x).map(|features| Data::new_test_data(features, None)).collect();
    let reported: Vec<f64> = model.predict(&test).into_iter().map(f64::from).collect();
    let gap = max_score_gap(&ensemble, x, &reported, sigmoid);
    debug!("gbdt conversion: largest probability gap {:.2e}", gap);
    if gap > AGREEMENT_TOLERANCE {
        return Err(PipelineError::Fit(format!(
            "converted gbdt model disagrees with gbdt by {gap:.2e} in probability"
        )));
    }
    Ok(ensemble)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn separable_feature_is_split_first() {
        let x = array![[0.0, 5.0], [1.0, 5.0], [2.0, 5.0], [3.0, 5.0], [0.5, 5.0], [2.5, 5.0]];
        let y = [0u8, 0, 1, 1, 0, 1];
        let params = GradientBoostingParams {
            n_rounds: 10,
            max_depth: 1,
            learning_rate: 0.3,
            min_leaf_size: 1,
        };
        let model = fit_gradient_boosting(&x, &y, &params).unwrap();
        assert_eq!(model.trees.len(), 10);
        match &model.trees[0].nodes[0] {
            Node::Split { feature, cover, .. } => {
                assert_eq!(*feature, 0);
                assert_eq!(*cover, 6.0);
            }
            other => panic!("expected a split, got {other:?}"),
        }
        assert!(model.raw_score(&[0.0, 5.0]) < model.base_score);
        assert!(model.raw_score(&[3.0, 5.0]) > model.base_score);
    }

    #[test]
    fn refitting_gives_the_same_ensemble() {
        let x = Array2::from_shape_fn((40, 4), |(i, j)| ((i * 7 + j * 13) % 11) as f64 / 10.0);
        let y: Vec<u8> = (0..40).map(|i| u8::from((i * 7) % 11 > 5)).collect();
        let params = GradientBoostingParams {
            n_rounds: 15,
            ..GradientBoostingParams::default()
        };
        let a = fit_gradient_boosting(&x, &y, &params).unwrap();
        let b = fit_gradient_boosting(&x, &y, &params).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.check(4), Ok(()));
    }

    #[test]
    fn balanced_labels_start_from_even_odds() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = [0u8, 1, 0, 1];
        let params = GradientBoostingParams {
            n_rounds: 2,
            ..GradientBoostingParams::default()
        };
        let model = fit_gradient_boosting(&x, &y, &params).unwrap();
        assert!(model.base_score.abs() < 1e-6);
    }
}
