//! Per-variant, per-feature attributions in log-odds space.
//!
//! Tree ensembles use path-dependent Tree SHAP weighted by node covers, the
//! logistic baseline uses `β_j · z_j`. Both give `base_value + Σ φ_j =
//! raw_score` for every row.

use std::path::{Path, PathBuf};

use chrono::Utc;
use polars::prelude::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{PipelineError, Result};
use crate::features::{add_key_columns, FeatureTable};
use crate::helper_functions::{dataframe_to_csv, remove_if_exists, write_json};
use crate::models::{feature_names, FEATURE_COLUMNS};
use crate::training::classifier::{BinaryClassifier, Classifier, ModelArtifact};
use crate::training::logistic::LogisticModel;
use crate::training::tree::{goes_left, Node, Tree, TreeEnsemble};

pub const BASE_VALUE_COLUMN: &str = "base_value";
pub const RAW_SCORE_COLUMN: &str = "raw_score";

/// One row of the attribution table.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribution {
    pub base_value: f64,
    pub raw_score: f64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionState {
    Present,
    Absent,
}

/// Written next to the attribution table on every run, success or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributionStatus {
    pub status: AttributionState,
    pub algorithm: Option<String>,
    pub method: Option<String>,
    pub rows: Option<usize>,
    pub reason: Option<String>,
    pub generated_at: String,
}

impl AttributionStatus {
    fn present(algorithm: &str, method: &str, rows: usize) -> Self {
        AttributionStatus {
            status: AttributionState::Present,
            algorithm: Some(algorithm.to_string()),
            method: Some(method.to_string()),
            rows: Some(rows),
            reason: None,
            generated_at: Utc::now().to_rfc3339(),
        }
    }

    fn absent(reason: String) -> Self {
        AttributionStatus {
            status: AttributionState::Absent,
            algorithm: None,
            method: None,
            rows: None,
            reason: Some(reason),
            generated_at: Utc::now().to_rfc3339(),
        }
    }
}

/// `attributions.csv` → `attributions.status.json`.
pub fn status_path(attributions_path: &Path) -> PathBuf {
    let stem = attributions_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attributions".to_string());
    attributions_path.with_file_name(format!("{stem}.status.json"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tree SHAP
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct PathElement {
    feature: Option<usize>,
    zero_fraction: f64,
    one_fraction: f64,
    weight: f64,
}

fn extend_path(path: &mut Vec<PathElement>, zero_fraction: f64, one_fraction: f64, feature: Option<usize>) {
    let depth = path.len();
    path.push(PathElement {
        feature,
        zero_fraction,
        one_fraction,
        weight: if depth == 0 { 1.0 } else { 0.0 },
    });
    let d = depth as f64;
    for i in (0..depth).rev() {
        let w = path[i].weight;
        path[i + 1].weight += one_fraction * w * (i as f64 + 1.0) / (d + 1.0);
        path[i].weight = zero_fraction * w * (d - i as f64) / (d + 1.0);
    }
}

fn unwind_path(path: &mut Vec<PathElement>, index: usize) {
    let depth = path.len() - 1;
    let d = depth as f64;
    let PathElement {
        zero_fraction,
        one_fraction,
        ..
    } = path[index];
    let mut next = path[depth].weight;
    for j in (0..depth).rev() {
        if one_fraction != 0.0 {
            let previous = path[j].weight;
            path[j].weight = next * (d + 1.0) / ((j as f64 + 1.0) * one_fraction);
            next = previous - path[j].weight * zero_fraction * (d - j as f64) / (d + 1.0);
        } else {
            path[j].weight = path[j].weight * (d + 1.0) / (zero_fraction * (d - j as f64));
        }
    }
    for j in index..depth {
        path[j].feature = path[j + 1].feature;
        path[j].zero_fraction = path[j + 1].zero_fraction;
        path[j].one_fraction = path[j + 1].one_fraction;
    }
    path.pop();
}

/// Total path weight if element `index` were unwound, without unwinding it.
fn unwound_path_sum(path: &[PathElement], index: usize) -> f64 {
    let depth = path.len() - 1;
    let d = depth as f64;
    let PathElement {
        zero_fraction,
        one_fraction,
        ..
    } = path[index];
    let mut total = 0.0;
    let mut next = path[depth].weight;
    for j in (0..depth).rev() {
        if one_fraction != 0.0 {
            let tmp = next * (d + 1.0) / ((j as f64 + 1.0) * one_fraction);
            total += tmp;
            next = path[j].weight - tmp * zero_fraction * (d - j as f64) / (d + 1.0);
        } else {
            total += path[j].weight * (d + 1.0) / (zero_fraction * (d - j as f64));
        }
    }
    total
}

struct TreeShap<'a> {
    tree: &'a Tree,
    row: &'a [f64],
}

impl TreeShap<'_> {
    fn recurse(
        &self,
        node: usize,
        mut path: Vec<PathElement>,
        zero_fraction: f64,
        one_fraction: f64,
        feature: Option<usize>,
        phi: &mut [f64],
    ) {
        extend_path(&mut path, zero_fraction, one_fraction, feature);
        match &self.tree.nodes[node] {
            Node::Leaf { value, .. } => {
                for i in 1..path.len() {
                    let w = unwound_path_sum(&path, i);
                    let el = path[i];
                    if let Some(j) = el.feature {
                        phi[j] += w * (el.one_fraction - el.zero_fraction) * value;
                    }
                }
            }
            Node::Split {
                feature: split_feature,
                threshold,
                left,
                right,
                cover,
            } => {
                let (hot, cold) = if goes_left(self.row[*split_feature], *threshold) {
                    (*left, *right)
                } else {
                    (*right, *left)
                };

                let mut incoming_zero = 1.0;
                let mut incoming_one = 1.0;
                if let Some(k) = (1..path.len()).find(|&k| path[k].feature == Some(*split_feature)) {
                    incoming_zero = path[k].zero_fraction;
                    incoming_one = path[k].one_fraction;
                    unwind_path(&mut path, k);
                }

                let hot_fraction = self.tree.nodes[hot].cover() / cover;
                let cold_fraction = self.tree.nodes[cold].cover() / cover;
                self.recurse(
                    hot,
                    path.clone(),
                    incoming_zero * hot_fraction,
                    incoming_one,
                    Some(*split_feature),
                    phi,
                );
                self.recurse(
                    cold,
                    path,
                    incoming_zero * cold_fraction,
                    0.0,
                    Some(*split_feature),
                    phi,
                );
            }
        }
    }
}

/// Cover-weighted mean leaf value.
fn expected_value(tree: &Tree, node: usize) -> f64 {
    match &tree.nodes[node] {
        Node::Leaf { value, .. } => *value,
        Node::Split { left, right, cover, .. } => {
            let l = tree.nodes[*left].cover();
            let r = tree.nodes[*right].cover();
            (l * expected_value(tree, *left) + r * expected_value(tree, *right)) / cover
        }
    }
}

fn check_covers(ensemble: &TreeEnsemble) -> Result<()> {
    for (t, tree) in ensemble.trees.iter().enumerate() {
        for (n, node) in tree.nodes.iter().enumerate() {
            let cover = node.cover();
            if !(cover > 0.0 && cover.is_finite()) {
                return Err(PipelineError::Explainability(format!(
                    "tree {t} node {n} has cover {cover}; Tree SHAP needs positive covers"
                )));
            }
        }
    }
    Ok(())
}

pub fn tree_shap(ensemble: &TreeEnsemble, row: &[f64]) -> Attribution {
    let mut values = vec![0.0; row.len()];
    let mut base_value = ensemble.base_score;
    for tree in &ensemble.trees {
        base_value += expected_value(tree, 0);
        TreeShap { tree, row }.recurse(0, Vec::new(), 1.0, 1.0, None, &mut values);
    }
    Attribution {
        base_value,
        raw_score: ensemble.raw_score(row),
        values,
    }
}

pub fn linear_attribution(model: &LogisticModel, row: &[f64]) -> Attribution {
    Attribution {
        base_value: model.intercept,
        raw_score: model.raw_score(row),
        values: model.contributions(row),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stage
// ─────────────────────────────────────────────────────────────────────────────

fn attribution_method(model: &Classifier) -> &'static str {
    match model {
        Classifier::TreeEnsemble(_) => "tree_shap_path_dependent",
        Classifier::Logistic(_) => "linear",
    }
}

/// Attributions for every feature row, in feature-table order.
pub fn explain(artifact: &ModelArtifact, features: &FeatureTable) -> Result<Vec<Attribution>> {
    let expected = feature_names();
    if artifact.metadata.feature_names != expected {
        return Err(PipelineError::Explainability(format!(
            "model features [{}] do not match the feature table [{}]",
            artifact.metadata.feature_names.join(","),
            expected.join(",")
        )));
    }
    if let Classifier::TreeEnsemble(ensemble) = &artifact.model {
        check_covers(ensemble)?;
    }

    features
        .rows
        .par_iter()
        .map(|row| {
            let attribution = match &artifact.model {
                Classifier::TreeEnsemble(ensemble) => tree_shap(ensemble, &row.features),
                Classifier::Logistic(model) => linear_attribution(model, &row.features),
            };
            let total = attribution.base_value + attribution.values.iter().sum::<f64>();
            let tolerance = 1e-6 * attribution.raw_score.abs().max(1.0);
            if !total.is_finite() || (total - artifact.raw_score(&row.features)).abs() > tolerance {
                return Err(PipelineError::Explainability(format!(
                    "attributions for {} sum to {total}, model scores {}",
                    row.key, attribution.raw_score
                )));
            }
            Ok(attribution)
        })
        .collect()
}

fn write_attributions(features: &FeatureTable, attributions: &[Attribution], path: &Path) -> Result<()> {
    let mut df = DataFrame::default();
    add_key_columns(&mut df, features.rows.iter().map(|r| &r.key))?;
    let base: Vec<f64> = attributions.iter().map(|a| a.base_value).collect();
    df.with_column(Series::new(PlSmallStr::from(BASE_VALUE_COLUMN), base))?;
    let raw: Vec<f64> = attributions.iter().map(|a| a.raw_score).collect();
    df.with_column(Series::new(PlSmallStr::from(RAW_SCORE_COLUMN), raw))?;
    for (j, &name) in FEATURE_COLUMNS.iter().enumerate() {
        let col: Vec<f64> = attributions.iter().map(|a| a.values[j]).collect();
        df.with_column(Series::new(PlSmallStr::from(name), col))?;
    }
    dataframe_to_csv(&mut df, path)
}

fn explain_to(model_path: &Path, features_path: &Path, out: &Path) -> Result<AttributionStatus> {
    let artifact = ModelArtifact::load(model_path)?;
    let features = FeatureTable::read(features_path)?;
    let attributions = explain(&artifact, &features)?;
    write_attributions(&features, &attributions, out)?;
    Ok(AttributionStatus::present(
        &artifact.metadata.algorithm,
        attribution_method(&artifact.model),
        attributions.len(),
    ))
}

/// Write the attribution table and its status file. On failure the table is
/// removed, the status records `absent` with the reason, and the error is
/// returned.
pub fn run_explain(model_path: &Path, features_path: &Path, out: &Path) -> Result<AttributionStatus> {
    let status_file = status_path(out);
    match explain_to(model_path, features_path, out) {
        Ok(status) => {
            write_json(&status_file, &status)?;
            info!(
                "Wrote {} attribution rows to {}",
                status.rows.unwrap_or_default(),
                out.display()
            );
            Ok(status)
        }
        Err(e) => {
            error!("Attributions unavailable: {e}");
            remove_if_exists(out)?;
            write_json(&status_file, &AttributionStatus::absent(e.to_string()))?;
            Err(e)
        }
    }
}
