//! Model training: stratified split, backend selection, held-out evaluation.

pub mod boosted_trees;
pub mod classifier;
pub mod gradient_boosting;
pub mod logistic;
pub mod split;
pub mod tree;

use std::path::{Path, PathBuf};

use log::{info, warn};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::analysis::metrics::{evaluate, EvaluationContext, Metrics};
use crate::analysis::roc::{calculate_roc, curve_area, draw_roc_plot};
use crate::dataset::LabeledDataset;
use crate::error::{PipelineError, Result};
use crate::helper_functions::write_json;
use crate::models::feature_names;
use boosted_trees::BoostedTreesParams;
use classifier::{BinaryClassifier, Classifier, ModelArtifact, ModelMetadata};
use gradient_boosting::{fit_gradient_boosting, GradientBoostingParams};
use logistic::{fit_logistic, LogisticParams};
use split::{stratified_split, write_split, Split};
use tree::TreeEnsemble;

pub const MODEL_FILE: &str = "model.json";
pub const METRICS_FILE: &str = "metrics.json";
pub const SPLIT_FILE: &str = "split.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    /// Boosted trees, falling back to gradient boosting when the XGBoost
    /// library is not usable.
    Auto,
    BoostedTrees,
    GradientBoosting,
    Logistic,
}

impl Algorithm {
    pub fn model_type(&self) -> &'static str {
        match self {
            Algorithm::Auto | Algorithm::BoostedTrees => "boosted_trees",
            Algorithm::GradientBoosting => "gradient_boosting",
            Algorithm::Logistic => "logistic_regression",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub algorithm: Algorithm,
    pub test_fraction: f64,
    pub seed: u64,
    pub min_rows: usize,
    pub n_jobs: usize,
    pub threshold: f64,
    pub boosted_trees: BoostedTreesParams,
    pub gradient_boosting: GradientBoostingParams,
    pub logistic: LogisticParams,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            algorithm: Algorithm::Auto,
            test_fraction: 0.25,
            seed: 42,
            min_rows: 10,
            n_jobs: 4,
            threshold: 0.5,
            boosted_trees: BoostedTreesParams::default(),
            gradient_boosting: GradientBoostingParams::default(),
            logistic: LogisticParams::default(),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        let rates = [
            ("boosted_trees.learning_rate", self.boosted_trees.learning_rate),
            ("boosted_trees.subsample", self.boosted_trees.subsample),
            ("boosted_trees.colsample_bytree", self.boosted_trees.colsample_bytree),
            ("gradient_boosting.learning_rate", self.gradient_boosting.learning_rate as f32),
        ];
        for (name, rate) in rates {
            if !(rate > 0.0 && rate <= 1.0) {
                return Err(PipelineError::Config(format!("{name} must be in (0, 1], got {rate}")));
            }
        }
        if !(self.threshold > 0.0 && self.threshold < 1.0) {
            return Err(PipelineError::Config(format!(
                "decision threshold must be in (0, 1), got {}",
                self.threshold
            )));
        }
        if self.boosted_trees.n_rounds == 0 || self.gradient_boosting.n_rounds == 0 {
            return Err(PipelineError::Config("boosting needs at least one round".to_string()));
        }
        Ok(())
    }
}

/// Whether the primary booster's native library is usable in this process.
#[derive(Debug, Clone, PartialEq)]
pub enum Runtime {
    Native { threads: usize },
    Unavailable(String),
}

impl Runtime {
    #[cfg(feature = "xgboost")]
    pub fn detect(n_jobs: usize) -> Runtime {
        if n_jobs == 0 {
            return Runtime::Unavailable("n_jobs is 0".to_string());
        }
        match boosted_trees::library_status() {
            Ok(()) => Runtime::Native { threads: n_jobs },
            Err(e) => Runtime::Unavailable(format!("xgboost failed to initialise: {e}")),
        }
    }

    #[cfg(not(feature = "xgboost"))]
    pub fn detect(_n_jobs: usize) -> Runtime {
        Runtime::Unavailable("built without the `xgboost` feature".to_string())
    }
}

#[cfg(feature = "xgboost")]
fn fit_primary(x: &Array2<f64>, y: &[u8], config: &TrainConfig, threads: usize) -> Result<TreeEnsemble> {
    boosted_trees::fit_boosted_trees(x, y, &config.boosted_trees, config.seed, threads)
}

#[cfg(not(feature = "xgboost"))]
fn fit_primary(_x: &Array2<f64>, _y: &[u8], _config: &TrainConfig, _threads: usize) -> Result<TreeEnsemble> {
    Err(PipelineError::Fit("this build has no xgboost support".to_string()))
}

pub struct TrainingOutcome {
    pub artifact: ModelArtifact,
    pub metrics: Metrics,
    pub split: Split,
}

fn check_sufficiency(dataset: &LabeledDataset, min_rows: usize) -> Result<()> {
    let (pathogenic, benign) = dataset.class_counts();
    if dataset.len() < min_rows {
        return Err(PipelineError::InsufficientTrainingData(format!(
            "{} labelled rows, at least {} required",
            dataset.len(),
            min_rows
        )));
    }
    if pathogenic < 2 || benign < 2 {
        return Err(PipelineError::InsufficientTrainingData(format!(
            "{} pathogenic and {} benign rows; each class needs at least 2",
            pathogenic, benign
        )));
    }
    Ok(())
}

fn rows_of(x: &Array2<f64>, i: usize) -> Vec<f64> {
    x.row(i).to_vec()
}

/// Fit the configured backend on the training side of a stratified split and
/// evaluate it on the held-out side. Nothing is written here.
pub fn train(dataset: &LabeledDataset, config: &TrainConfig, runtime: Runtime) -> Result<TrainingOutcome> {
    config.validate()?;
    check_sufficiency(dataset, config.min_rows)?;

    let labels = dataset.labels();
    let split = stratified_split(&labels.to_vec(), config.test_fraction, config.seed)?;
    let x = dataset.feature_matrix();
    let x_train = x.select(Axis(0), &split.train);
    let y_train = labels.select(Axis(0), &split.train);
    let y_train_slice = y_train.to_vec();

    let mut fallback_reason = None;
    let (algorithm, model) = match (config.algorithm, runtime) {
        (Algorithm::Auto | Algorithm::BoostedTrees, Runtime::Native { threads }) => (
            Algorithm::BoostedTrees,
            Classifier::TreeEnsemble(fit_primary(&x_train, &y_train_slice, config, threads)?),
        ),
        (Algorithm::Auto, Runtime::Unavailable(reason)) => {
            warn!("Boosted-tree runtime unavailable ({reason}); falling back to gradient boosting");
            fallback_reason = Some(reason);
            (
                Algorithm::GradientBoosting,
                Classifier::TreeEnsemble(fit_gradient_boosting(&x_train, &y_train_slice, &config.gradient_boosting)?),
            )
        }
        (Algorithm::BoostedTrees, Runtime::Unavailable(reason)) => {
            return Err(PipelineError::Fit(format!(
                "boosted trees were requested but xgboost is unavailable: {reason}"
            )));
        }
        (Algorithm::GradientBoosting, _) => (
            Algorithm::GradientBoosting,
            Classifier::TreeEnsemble(fit_gradient_boosting(&x_train, &y_train_slice, &config.gradient_boosting)?),
        ),
        (Algorithm::Logistic, _) => (
            Algorithm::Logistic,
            Classifier::Logistic(fit_logistic(&x_train, &y_train, &config.logistic)?),
        ),
    };

    let mut metadata = ModelMetadata::new(
        algorithm.model_type(),
        feature_names(),
        split.train.len(),
        split.test.len(),
        config.seed,
    );
    metadata.fallback_reason = fallback_reason;
    let artifact = ModelArtifact { metadata, model };

    let y_test: Vec<u8> = split.test.iter().map(|&i| labels[i]).collect();
    let p_test: Vec<f64> = split
        .test
        .iter()
        .map(|&i| artifact.predict_proba(&rows_of(&x, i)))
        .collect();
    let metrics = evaluate(
        &y_test,
        &p_test,
        EvaluationContext {
            model_type: algorithm.model_type(),
            n_train: split.train.len(),
            features: feature_names(),
            fallback_used: artifact.metadata.fallback_reason.is_some(),
            threshold: config.threshold,
        },
    );
    info!(
        "{}: accuracy {:.3}, precision {:.3}, recall {:.3}, ROC-AUC {:?}, PR-AUC {:?}",
        metrics.model_type, metrics.accuracy, metrics.precision, metrics.recall, metrics.roc_auc, metrics.pr_auc
    );

    Ok(TrainingOutcome {
        artifact,
        metrics,
        split,
    })
}

/// Paths of the training artifacts inside an output directory.
#[derive(Debug, Clone)]
pub struct TrainingPaths {
    pub model: PathBuf,
    pub metrics: PathBuf,
    pub split: PathBuf,
}

impl TrainingPaths {
    pub fn in_dir(outdir: &Path) -> Self {
        TrainingPaths {
            model: outdir.join(MODEL_FILE),
            metrics: outdir.join(METRICS_FILE),
            split: outdir.join(SPLIT_FILE),
        }
    }
}

/// Train from a dataset file and persist model, metrics and split. An
/// optional ROC image of the held-out split is best-effort.
pub fn run_training(
    dataset_path: &Path,
    outdir: &Path,
    config: &TrainConfig,
    roc_plot: Option<&Path>,
) -> Result<TrainingOutcome> {
    let dataset = LabeledDataset::read(dataset_path)?;
    let runtime = Runtime::detect(config.n_jobs);
    let outcome = train(&dataset, config, runtime)?;

    let paths = TrainingPaths::in_dir(outdir);
    outcome.artifact.save(&paths.model)?;
    write_json(&paths.metrics, &outcome.metrics)?;
    write_split(&dataset, &outcome.split, &paths.split)?;
    info!("Saved model, metrics and split to {}", outdir.display());

    if let Some(plot_path) = roc_plot {
        let x = dataset.feature_matrix();
        let y_test: Vec<u8> = outcome.split.test.iter().map(|&i| dataset.rows[i].label).collect();
        let p_test: Vec<f64> = outcome
            .split
            .test
            .iter()
            .map(|&i| outcome.artifact.predict_proba(&rows_of(&x, i)))
            .collect();
        match calculate_roc(&y_test, &p_test) {
            Some((fpr, tpr)) => {
                let auc = curve_area(&fpr, &tpr);
                if let Err(e) = draw_roc_plot(plot_path, &fpr, &tpr, auc, &outcome.metrics.model_type) {
                    warn!("ROC plot not written: {e}");
                }
            }
            None => warn!("ROC plot skipped: held-out split has a single class"),
        }
    }
    Ok(outcome)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::features::tests::sample_row;
    use crate::models::LabeledRow;

    /// Two informative features (`impact`, `gnomad_af`) with some overlap.
    pub(crate) fn synthetic_dataset(n: usize) -> LabeledDataset {
        let rows = (0..n)
            .map(|i| {
                let label = u8::from(i % 5 < 2);
                let mut row = sample_row("2", 178_600_000 + i as u64, "A", "G", "TTN");
                let jitter = ((i * 37) % 11) as f64 / 10.0;
                row.features[5] = if label == 1 { 2.0 + jitter } else { 0.5 + jitter };
                row.features[9] = if label == 1 { 0.0001 * jitter } else { 0.01 + 0.01 * jitter };
                row.features[11] = ((i * 13) % 7) as f64;
                LabeledRow {
                    row,
                    label,
                    clinical_significance: if label == 1 { "Pathogenic" } else { "Benign" }.to_string(),
                }
            })
            .collect();
        LabeledDataset { rows }
    }

    fn quick_config(algorithm: Algorithm) -> TrainConfig {
        let mut config = TrainConfig {
            algorithm,
            ..TrainConfig::default()
        };
        config.boosted_trees.n_rounds = 30;
        config.gradient_boosting.n_rounds = 30;
        config
    }

    #[cfg(feature = "xgboost")]
    #[test]
    fn primary_training_is_deterministic() {
        let dataset = synthetic_dataset(40);
        let config = quick_config(Algorithm::Auto);
        let a = train(&dataset, &config, Runtime::detect(4)).unwrap();
        let b = train(&dataset, &config, Runtime::detect(4)).unwrap();
        assert_eq!(a.split, b.split);
        assert_eq!(a.artifact.model, b.artifact.model);
        assert_eq!(a.metrics, b.metrics);
        assert_eq!(a.artifact.metadata.algorithm, "boosted_trees");
        assert!(!a.metrics.fallback_used);
        assert!(a.metrics.roc_auc.unwrap() > 0.8);
    }

    #[cfg(not(feature = "xgboost"))]
    #[test]
    fn auto_falls_back_in_a_build_without_xgboost() {
        let runtime = Runtime::detect(4);
        assert!(matches!(&runtime, Runtime::Unavailable(reason) if reason.contains("xgboost")));
        let outcome = train(&synthetic_dataset(40), &quick_config(Algorithm::Auto), runtime).unwrap();
        assert_eq!(outcome.artifact.metadata.algorithm, "gradient_boosting");
        assert!(outcome.metrics.fallback_used);
        assert!(outcome.metrics.roc_auc.unwrap() > 0.8);
    }

    #[test]
    fn fallback_runs_when_runtime_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = synthetic_dataset(40);
        let config = quick_config(Algorithm::Auto);
        let simulated = || Runtime::Unavailable("simulated".to_string());

        let first = train(&dataset, &config, simulated()).unwrap();
        let second = train(&dataset, &config, simulated()).unwrap();
        assert_eq!(first.artifact.model, second.artifact.model);
        assert_eq!(first.metrics, second.metrics);
        assert_eq!(first.artifact.metadata.algorithm, "gradient_boosting");
        assert_eq!(first.artifact.metadata.fallback_reason.as_deref(), Some("simulated"));
        assert!(first.metrics.fallback_used);

        let baseline = train(&dataset, &quick_config(Algorithm::Logistic), simulated()).unwrap();
        assert_eq!(baseline.split, first.split);

        let path = dir.path().join("model.json");
        first.artifact.save(&path).unwrap();
        let loaded = ModelArtifact::load(&path).unwrap();
        let x = dataset.feature_matrix();
        for i in 0..dataset.len() {
            let row = rows_of(&x, i);
            assert_eq!(loaded.predict_proba(&row), first.artifact.predict_proba(&row));
            assert_eq!(loaded.predict_label(&row, 0.5), first.artifact.predict_label(&row, 0.5));
        }
    }

    #[test]
    fn explicit_primary_without_runtime_fails() {
        let dataset = synthetic_dataset(20);
        let config = quick_config(Algorithm::BoostedTrees);
        let err = train(&dataset, &config, Runtime::Unavailable("gone".to_string()))
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::Fit(_)));
    }

    #[test]
    fn logistic_baseline_separates_the_classes() {
        let dataset = synthetic_dataset(40);
        let outcome = train(&dataset, &quick_config(Algorithm::Logistic), Runtime::detect(1)).unwrap();
        assert_eq!(outcome.metrics.model_type, "logistic_regression");
        assert!(outcome.metrics.roc_auc.unwrap() > 0.8);
    }

    #[test]
    fn too_little_data_fails_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let dataset_path = dir.path().join("dataset.csv");
        synthetic_dataset(6).write(&dataset_path).unwrap();
        let outdir = dir.path().join("model");
        let err = run_training(&dataset_path, &outdir, &TrainConfig::default(), None)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::InsufficientTrainingData(_)));
        assert!(!outdir.join(MODEL_FILE).exists());
        assert!(!outdir.join(METRICS_FILE).exists());
    }

    #[test]
    fn single_class_is_insufficient() {
        let mut dataset = synthetic_dataset(20);
        dataset.rows.iter_mut().for_each(|r| r.label = 1);
        let err = train(&dataset, &TrainConfig::default(), Runtime::detect(1)).err().unwrap();
        assert!(matches!(err, PipelineError::InsufficientTrainingData(_)));
    }

    #[test]
    fn run_training_writes_all_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let dataset_path = dir.path().join("dataset.csv");
        synthetic_dataset(30).write(&dataset_path).unwrap();
        let outdir = dir.path().join("model");
        let outcome = run_training(&dataset_path, &outdir, &quick_config(Algorithm::GradientBoosting), None).unwrap();

        let split_text = std::fs::read_to_string(outdir.join(SPLIT_FILE)).unwrap();
        let mut lines = split_text.lines();
        assert_eq!(lines.next(), Some("chrom,pos,ref,alt,split"));
        assert_eq!(lines.filter(|l| l.ends_with(",test")).count(), outcome.split.test.len());

        let metrics: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(outdir.join(METRICS_FILE)).unwrap()).unwrap();
        assert_eq!(metrics["n_test"], outcome.split.test.len());
        assert!(ModelArtifact::load(&outdir.join(MODEL_FILE)).is_ok());
    }
}
