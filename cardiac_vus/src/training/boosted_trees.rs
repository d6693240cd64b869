//! Primary booster: XGBoost through the `xgboost` crate, compiled in with the
//! `xgboost` cargo feature. The fitted booster is read back from its text
//! dump into the shared tree-ensemble form.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostedTreesParams {
    pub n_rounds: u32,
    pub max_depth: u32,
    pub learning_rate: f32,
    pub subsample: f32,
    pub colsample_bytree: f32,
    pub reg_lambda: u32,
    pub gamma: u32,
    pub min_child_weight: u32,
}

impl Default for BoostedTreesParams {
    fn default() -> Self {
        BoostedTreesParams {
            n_rounds: 300,
            max_depth: 4,
            learning_rate: 0.05,
            subsample: 0.8,
            colsample_bytree: 0.8,
            reg_lambda: 1,
            gamma: 0,
            min_child_weight: 1,
        }
    }
}

#[cfg(any(feature = "xgboost", test))]
mod dump {
    use std::collections::HashMap;
    use std::sync::LazyLock;

    use regex::Regex;

    use crate::error::{PipelineError, Result};
    use crate::training::tree::{Node, Tree, TreeEnsemble};

    static SPLIT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^(\d+):\[f(\d+)<([^\]]+)\] yes=(\d+),no=(\d+)(?:,missing=\d+)?(?:,gain=[^,]+)?,cover=(\S+)$")
            .expect("split line regex")
    });
    static LEAF_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(\d+):leaf=([^,]+),cover=(\S+)$").expect("leaf line regex"));

    enum DumpNode {
        Split {
            feature: usize,
            threshold: f64,
            yes: usize,
            no: usize,
            cover: f64,
        },
        Leaf {
            value: f64,
            cover: f64,
        },
    }

    fn number<T: std::str::FromStr>(text: &str, line: &str) -> Result<T> {
        text.parse()
            .map_err(|_| PipelineError::Fit(format!("unreadable number `{text}` in booster dump line `{line}`")))
    }

    fn parse_line(line: &str) -> Result<(usize, DumpNode)> {
        if let Some(c) = SPLIT_RE.captures(line) {
            let node = DumpNode::Split {
                feature: number(&c[2], line)?,
                threshold: number(&c[3], line)?,
                yes: number(&c[4], line)?,
                no: number(&c[5], line)?,
                cover: number(&c[6], line)?,
            };
            return Ok((number(&c[1], line)?, node));
        }
        if let Some(c) = LEAF_RE.captures(line) {
            let node = DumpNode::Leaf {
                value: number(&c[2], line)?,
                cover: number(&c[3], line)?,
            };
            return Ok((number(&c[1], line)?, node));
        }
        Err(PipelineError::Fit(format!("unexpected booster dump line `{line}`")))
    }

    /// Node ids in a dump may have gaps after pruning; nodes are renumbered
    /// in preorder.
    fn build(ids: &HashMap<usize, DumpNode>) -> Result<Tree> {
        fn visit(ids: &HashMap<usize, DumpNode>, id: usize, nodes: &mut Vec<Node>) -> Result<usize> {
            let at = nodes.len();
            match ids.get(&id) {
                None => Err(PipelineError::Fit(format!("booster dump refers to missing node {id}"))),
                Some(DumpNode::Leaf { value, cover }) => {
                    nodes.push(Node::Leaf {
                        value: *value,
                        cover: *cover,
                    });
                    Ok(at)
                }
                Some(DumpNode::Split {
                    feature,
                    threshold,
                    yes,
                    no,
                    cover,
                }) => {
                    nodes.push(Node::Leaf { value: 0.0, cover: 0.0 });
                    let left = visit(ids, *yes, nodes)?;
                    let right = visit(ids, *no, nodes)?;
                    nodes[at] = Node::Split {
                        feature: *feature,
                        threshold: *threshold,
                        left,
                        right,
                        cover: *cover,
                    };
                    Ok(at)
                }
            }
        }

        let mut nodes = Vec::with_capacity(ids.len());
        visit(ids, 0, &mut nodes)?;
        Ok(Tree { nodes })
    }

    /// Parse `Booster::dump_model(true, None)` output. A node with id 0
    /// starts the next tree.
    pub fn parse_dump(text: &str, base_score: f64) -> Result<TreeEnsemble> {
        let mut trees = Vec::new();
        let mut current: HashMap<usize, DumpNode> = HashMap::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if line.starts_with("booster[") {
                continue;
            }
            let (id, node) = parse_line(line)?;
            if id == 0 && !current.is_empty() {
                trees.push(build(&current)?);
                current.clear();
            }
            current.insert(id, node);
        }
        if !current.is_empty() {
            trees.push(build(&current)?);
        }
        Ok(TreeEnsemble { base_score, trees })
    }
}

#[cfg(feature = "xgboost")]
mod native {
    use log::{debug, info};
    use ndarray::Array2;
    use xgboost::parameters::learning::{LearningTaskParametersBuilder, Objective};
    use xgboost::parameters::tree::{TreeBoosterParametersBuilder, TreeMethod};
    use xgboost::parameters::{BoosterParameters, BoosterParametersBuilder, BoosterType, TrainingParametersBuilder};
    use xgboost::{Booster, DMatrix, XGBError};

    use super::dump::parse_dump;
    use super::BoostedTreesParams;
    use crate::error::{PipelineError, Result};
    use crate::training::tree::{max_score_gap, TreeEnsemble};

    /// Initial prediction on the probability scale; 0.5 is a zero margin.
    const BASE_SCORE: f32 = 0.5;
    /// The text dump prints thresholds and leaves with limited precision.
    const AGREEMENT_TOLERANCE: f64 = 1e-3;

    fn fit_error(e: impl std::fmt::Display) -> PipelineError {
        PipelineError::Fit(e.to_string())
    }

    /// Whether the native library initialises in this process.
    pub fn library_status() -> std::result::Result<(), String> {
        DMatrix::from_dense(&[0.0, 1.0], 2)
            .and_then(|_| Booster::new(&BoosterParameters::default()))
            .map(|_| ())
            .map_err(|e: XGBError| e.to_string())
    }

    /// Every cell stored explicitly; `DMatrix::from_dense` reads 0.0 as
    /// missing, which would route zeros along the default branch.
    fn matrix(x: &Array2<f64>) -> std::result::Result<DMatrix, XGBError> {
        let (n, m) = x.dim();
        let indptr: Vec<usize> = (0..=n).map(|i| i * m).collect();
        let indices: Vec<usize> = (0..n).flat_map(|_| 0..m).collect();
        let data: Vec<f32> = x.iter().map(|&v| v as f32).collect();
        DMatrix::from_csr(&indptr, &indices, &data, Some(m))
    }

    pub fn fit_boosted_trees(
        x: &Array2<f64>,
        y: &[u8],
        params: &BoostedTreesParams,
        seed: u64,
        threads: usize,
    ) -> Result<TreeEnsemble> {
        info!(
            "Boosted trees (xgboost): {} rounds, depth {}, eta {}, {} threads",
            params.n_rounds, params.max_depth, params.learning_rate, threads
        );
        let mut dtrain = matrix(x).map_err(fit_error)?;
        let labels: Vec<f32> = y.iter().map(|&v| f32::from(v)).collect();
        dtrain.set_labels(&labels).map_err(fit_error)?;

        let tree = TreeBoosterParametersBuilder::default()
            .eta(params.learning_rate)
            .max_depth(params.max_depth)
            .subsample(params.subsample)
            .colsample_bytree(params.colsample_bytree)
            .lambda(params.reg_lambda)
            .gamma(params.gamma)
            .min_child_weight(params.min_child_weight)
            .tree_method(TreeMethod::Exact)
            .build()
            .map_err(fit_error)?;
        let learning = LearningTaskParametersBuilder::default()
            .objective(Objective::BinaryLogistic)
            .base_score(BASE_SCORE)
            .seed(seed)
            .build()
            .map_err(fit_error)?;
        let booster_params = BoosterParametersBuilder::default()
            .booster_type(BoosterType::Tree(tree))
            .learning_params(learning)
            .threads(Some(threads as u32))
            .verbose(false)
            .build()
            .map_err(fit_error)?;
        let training = TrainingParametersBuilder::default()
            .dtrain(&dtrain)
            .boost_rounds(params.n_rounds)
            .booster_params(booster_params)
            .build()
            .map_err(fit_error)?;
        let booster = Booster::train(&training).map_err(fit_error)?;

        let base = f64::from(BASE_SCORE);
        let ensemble = parse_dump(&booster.dump_model(true, None).map_err(fit_error)?, (base / (1.0 - base)).ln())?;
        let margins: Vec<f64> = booster
            .predict_margin(&dtrain)
            .map_err(fit_error)?
            .into_iter()
            .map(f64::from)
            .collect();
        let gap = max_score_gap(&ensemble, x, &margins, |m| m);
        debug!("xgboost dump: {} trees, largest margin gap {:.2e}", ensemble.trees.len(), gap);
        if gap > AGREEMENT_TOLERANCE {
            return Err(PipelineError::Fit(format!(
                "booster dump does not reproduce xgboost margins (gap {gap:.2e})"
            )));
        }
        Ok(ensemble)
    }
}

#[cfg(feature = "xgboost")]
pub use native::{fit_boosted_trees, library_status};

#[cfg(test)]
mod tests {
    use super::dump::parse_dump;
    use crate::training::tree::Node;

    const DUMP: &str = "0:[f5<2.5] yes=1,no=2,missing=1,gain=12.5,cover=30\n\
                        \t1:leaf=-0.0857,cover=18\n\
                        \t2:[f9<0.005] yes=5,no=6,missing=5,gain=3.25,cover=12\n\
                        \t\t5:leaf=0.12,cover=7\n\
                        \t\t6:leaf=-0.01,cover=5\n\
                        \n\
                        0:leaf=0.031,cover=30\n";

    #[test]
    fn dump_is_read_into_preorder_trees() {
        let ensemble = parse_dump(DUMP, 0.0).unwrap();
        assert_eq!(ensemble.trees.len(), 2);
        let first = &ensemble.trees[0];
        assert_eq!(first.nodes.len(), 5);
        assert_eq!(first.check(19), Ok(()));
        match &first.nodes[2] {
            Node::Split {
                feature,
                threshold,
                left,
                right,
                cover,
            } => {
                assert_eq!((*feature, *left, *right), (9, 3, 4));
                assert!((threshold - 0.005).abs() < 1e-12);
                assert_eq!(*cover, 12.0);
            }
            other => panic!("expected a split, got {other:?}"),
        }
    }

    #[test]
    fn dump_scores_follow_the_branches() {
        let ensemble = parse_dump(DUMP, 0.0).unwrap();
        let mut row = vec![0.0; 19];
        row[5] = 1.0;
        assert!((ensemble.raw_score(&row) - (-0.0857 + 0.031)).abs() < 1e-12);
        row[5] = 3.0;
        row[9] = 0.001;
        assert!((ensemble.raw_score(&row) - (0.12 + 0.031)).abs() < 1e-12);
    }

    #[test]
    fn missing_child_is_an_error() {
        let broken = "0:[f1<0.5] yes=1,no=2,missing=1,gain=1,cover=4\n\t1:leaf=0.1,cover=2\n";
        assert!(parse_dump(broken, 0.0).is_err());
    }

    #[cfg(feature = "xgboost")]
    #[test]
    fn native_library_initialises() {
        assert_eq!(super::library_status(), Ok(()));
    }
}
