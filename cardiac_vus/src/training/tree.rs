//! Tree-ensemble form shared by both boosting backends. Fitted models are
//! converted into it so prediction, persistence and Tree SHAP do not depend
//! on which library trained them.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

pub fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Split decision. Both backends store features and thresholds in single
/// precision, so the comparison happens there too.
pub fn goes_left(value: f64, threshold: f64) -> bool {
    (value as f32) < (threshold as f32)
}

/// Nodes live in one vector; the root is node 0 and children always sit
/// after their parent. `x < threshold` goes left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Node {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
        cover: f64,
    },
    Leaf {
        value: f64,
        cover: f64,
    },
}

impl Node {
    pub fn cover(&self) -> f64 {
        match self {
            Node::Split { cover, .. } | Node::Leaf { cover, .. } => *cover,
        }
    }

    fn set_cover(&mut self, c: f64) {
        match self {
            Node::Split { cover, .. } | Node::Leaf { cover, .. } => *cover = c,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    /// Leaf value reached by a row whose feature `j` reads `value(j)`.
    pub fn evaluate(&self, value: impl Fn(usize) -> f64) -> f64 {
        let mut idx = 0;
        loop {
            match &self.nodes[idx] {
                Node::Leaf { value: leaf, .. } => return *leaf,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    idx = if goes_left(value(*feature), *threshold) { *left } else { *right };
                }
            }
        }
    }

    pub fn predict_row(&self, row: &[f64]) -> f64 {
        self.evaluate(|j| row[j])
    }

    pub fn n_leaves(&self) -> usize {
        self.nodes.iter().filter(|n| matches!(n, Node::Leaf { .. })).count()
    }

    /// Structural check for trees read from disk: feature indices inside the
    /// schema, children in range and after their parent, every node but the
    /// root reached exactly once, finite numbers throughout.
    pub fn check(&self, n_features: usize) -> std::result::Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".to_string());
        }
        let mut parents = vec![0usize; self.nodes.len()];
        for (idx, node) in self.nodes.iter().enumerate() {
            let cover = node.cover();
            if !cover.is_finite() || cover < 0.0 {
                return Err(format!("node {idx} has cover {cover}"));
            }
            match node {
                Node::Leaf { value, .. } => {
                    if !value.is_finite() {
                        return Err(format!("leaf {idx} has value {value}"));
                    }
                }
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    if *feature >= n_features {
                        return Err(format!(
                            "node {idx} splits on feature {feature}, the schema has {n_features}"
                        ));
                    }
                    if threshold.is_nan() {
                        return Err(format!("node {idx} has a NaN threshold"));
                    }
                    for child in [*left, *right] {
                        if child <= idx || child >= self.nodes.len() {
                            return Err(format!(
                                "node {idx} points to child {child} outside {}..{}",
                                idx + 1,
                                self.nodes.len()
                            ));
                        }
                        parents[child] += 1;
                    }
                }
            }
        }
        match parents.iter().skip(1).position(|&p| p != 1) {
            Some(i) => Err(format!("node {} is reached {} times", i + 1, parents[i + 1])),
            None => Ok(()),
        }
    }

    /// Replace covers with the number of `x` rows passing through each node.
    pub fn count_covers(&mut self, x: &Array2<f64>) {
        let mut counts = vec![0.0; self.nodes.len()];
        for row in x.rows() {
            let mut idx = 0;
            loop {
                counts[idx] += 1.0;
                match &self.nodes[idx] {
                    Node::Leaf { .. } => break,
                    Node::Split {
                        feature,
                        threshold,
                        left,
                        right,
                        ..
                    } => {
                        idx = if goes_left(row[*feature], *threshold) { *left } else { *right };
                    }
                }
            }
        }
        for (node, c) in self.nodes.iter_mut().zip(counts) {
            node.set_cover(c);
        }
    }
}

/// Additive ensemble in log-odds space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsemble {
    pub base_score: f64,
    pub trees: Vec<Tree>,
}

impl TreeEnsemble {
    pub fn raw_score(&self, row: &[f64]) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.predict_row(row)).sum::<f64>()
    }

    pub fn check(&self, n_features: usize) -> std::result::Result<(), String> {
        if !self.base_score.is_finite() {
            return Err(format!("base score {}", self.base_score));
        }
        for (t, tree) in self.trees.iter().enumerate() {
            tree.check(n_features).map_err(|e| format!("tree {t}: {e}"))?;
        }
        Ok(())
    }
}

/// Largest gap between `link(raw score)` of the converted ensemble and the
/// scores the backend itself reports for the same rows.
pub fn max_score_gap(ensemble: &TreeEnsemble, x: &Array2<f64>, reported: &[f64], link: impl Fn(f64) -> f64) -> f64 {
    x.rows()
        .into_iter()
        .zip(reported)
        .map(|(row, r)| (link(ensemble.raw_score(&row.to_vec())) - r).abs())
        .fold(0.0, f64::max)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::array;

    pub(crate) fn stump_tree() -> Tree {
        Tree {
            nodes: vec![
                Node::Split {
                    feature: 1,
                    threshold: 0.5,
                    left: 1,
                    right: 2,
                    cover: 4.0,
                },
                Node::Leaf { value: -1.0, cover: 3.0 },
                Node::Leaf { value: 2.0, cover: 1.0 },
            ],
        }
    }

    #[test]
    fn evaluate_follows_thresholds() {
        let tree = stump_tree();
        assert_eq!(tree.predict_row(&[9.0, 0.4]), -1.0);
        assert_eq!(tree.predict_row(&[9.0, 0.5]), 2.0);
        assert_eq!(tree.n_leaves(), 2);
    }

    #[test]
    fn splits_compare_in_single_precision() {
        let threshold = f64::from(0.1f32);
        // 0.1 in f64 sits below its f32 rounding but reads as equal there
        assert!(0.1 < threshold);
        assert!(!goes_left(0.1, threshold));
        assert!(goes_left(0.09, threshold));
    }

    #[test]
    fn covers_count_routed_rows() {
        let mut tree = stump_tree();
        let x = array![[0.0, 0.1], [0.0, 0.2], [0.0, 0.9], [0.0, 0.3], [0.0, 0.7]];
        tree.count_covers(&x);
        let covers: Vec<f64> = tree.nodes.iter().map(Node::cover).collect();
        assert_eq!(covers, vec![5.0, 3.0, 2.0]);
    }

    #[test]
    fn well_formed_tree_passes_the_check() {
        assert_eq!(stump_tree().check(2), Ok(()));
    }

    #[test]
    fn out_of_schema_feature_is_rejected() {
        let mut tree = stump_tree();
        if let Node::Split { feature, .. } = &mut tree.nodes[0] {
            *feature = 99;
        }
        let err = tree.check(19).unwrap_err();
        assert!(err.contains("feature 99"), "{err}");
    }

    #[test]
    fn dangling_and_backward_children_are_rejected() {
        let mut tree = stump_tree();
        if let Node::Split { right, .. } = &mut tree.nodes[0] {
            *right = 7;
        }
        assert!(tree.check(2).unwrap_err().contains("child 7"));

        let mut cyclic = stump_tree();
        cyclic.nodes[1] = Node::Split {
            feature: 0,
            threshold: 1.0,
            left: 0,
            right: 2,
            cover: 1.0,
        };
        assert!(cyclic.check(2).unwrap_err().contains("child 0"));
    }

    #[test]
    fn shared_or_orphaned_nodes_are_rejected() {
        let mut tree = stump_tree();
        if let Node::Split { right, .. } = &mut tree.nodes[0] {
            *right = 1;
        }
        let err = tree.check(2).unwrap_err();
        assert!(err.contains("reached 2 times"), "{err}");
    }

    #[test]
    fn score_gap_is_zero_for_matching_scores() {
        let ensemble = TreeEnsemble {
            base_score: 0.5,
            trees: vec![stump_tree()],
        };
        let x = array![[0.0, 0.1], [0.0, 0.9]];
        assert_eq!(max_score_gap(&ensemble, &x, &[-0.5, 2.5], |m| m), 0.0);
        assert!((max_score_gap(&ensemble, &x, &[-0.5, 2.0], |m| m) - 0.5).abs() < 1e-12);
        assert!(max_score_gap(&ensemble, &x, &[sigmoid(-0.5), sigmoid(2.5)], sigmoid) < 1e-15);
    }
}
