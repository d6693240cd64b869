//! End-to-end run over explicit inputs, and the artifact check for its
//! output directory.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::analysis::metrics::Metrics;
use crate::config::PipelineConfig;
use crate::dataset::{metadata_path, run_dataset_build, DatasetMetadata};
use crate::error::{PipelineError, Result};
use crate::explain::{run_explain, status_path, AttributionState, AttributionStatus};
use crate::features::run_feature_extraction;
use crate::helper_functions::read_json;
use crate::training::{run_training, TrainingPaths};

pub const FEATURES_FILE: &str = "features.csv";
pub const DATASET_FILE: &str = "dataset.csv";
pub const MODEL_DIR: &str = "model";
pub const ATTRIBUTIONS_FILE: &str = "attributions.csv";
pub const ROC_PLOT_FILE: &str = "roc.png";

/// Stages in run order; a run only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Extracted,
    Labeled,
    Trained,
    Explained,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Extracted => "extracted",
            Stage::Labeled => "joined+labeled",
            Stage::Trained => "split, trained, evaluated",
            Stage::Explained => "explained",
        };
        f.write_str(name)
    }
}

/// Where every artifact of a run lives under the output directory.
#[derive(Debug, Clone)]
pub struct Layout {
    pub features: PathBuf,
    pub dataset: PathBuf,
    pub dataset_meta: PathBuf,
    pub model_dir: PathBuf,
    pub training: TrainingPaths,
    pub attributions: PathBuf,
    pub attribution_status: PathBuf,
    pub roc_plot: PathBuf,
}

impl Layout {
    pub fn new(outdir: &Path) -> Self {
        let dataset = outdir.join(DATASET_FILE);
        let model_dir = outdir.join(MODEL_DIR);
        let attributions = model_dir.join(ATTRIBUTIONS_FILE);
        Layout {
            features: outdir.join(FEATURES_FILE),
            dataset_meta: metadata_path(&dataset),
            dataset,
            training: TrainingPaths::in_dir(&model_dir),
            attribution_status: status_path(&attributions),
            attributions,
            roc_plot: model_dir.join(ROC_PLOT_FILE),
            model_dir,
        }
    }
}

pub struct PipelineReport {
    pub dataset: DatasetMetadata,
    pub metrics: Metrics,
    pub attributions: AttributionStatus,
}

fn in_stage<T>(stage: &'static str, result: Result<T>) -> Result<T> {
    result.map_err(|source| PipelineError::Stage {
        stage,
        source: Box::new(source),
    })
}

/// Run every stage in order. Each stage reads the previous stage's artifact
/// from disk, so a failed run can be resumed stage by stage from the CLI.
pub fn run_pipeline(
    vcf: &Path,
    expression: &Path,
    clinvar: &Path,
    outdir: &Path,
    config: &PipelineConfig,
    roc_plot: bool,
) -> Result<PipelineReport> {
    let layout = Layout::new(outdir);

    let features = in_stage(
        "feature extraction",
        run_feature_extraction(vcf, expression, &layout.features),
    )?;
    info!("[{}] {} feature rows", Stage::Extracted, features.len());

    let dataset = in_stage(
        "dataset build",
        run_dataset_build(&layout.features, clinvar, &layout.dataset, Some(&layout.dataset_meta)),
    )?;
    info!(
        "[{}] {} rows, {} dropped without a label",
        Stage::Labeled,
        dataset.rows_out,
        dataset.dropped_no_label
    );

    let plot = roc_plot.then_some(layout.roc_plot.as_path());
    let outcome = in_stage(
        "training",
        run_training(&layout.dataset, &layout.model_dir, &config.training, plot),
    )?;
    info!(
        "[{}] {} on {} train / {} test rows",
        Stage::Trained,
        outcome.artifact.metadata.algorithm,
        outcome.split.train.len(),
        outcome.split.test.len()
    );

    match run_explain(&layout.training.model, &layout.features, &layout.attributions) {
        Ok(attributions) => {
            info!("[{}] {} rows", Stage::Explained, attributions.rows.unwrap_or_default());
            Ok(PipelineReport {
                dataset,
                metrics: outcome.metrics,
                attributions,
            })
        }
        Err(e) => {
            warn!(
                "Model and metrics in {} are valid but lack explanations",
                layout.model_dir.display()
            );
            in_stage("explanation", Err(e))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactCheck {
    pub name: &'static str,
    pub path: PathBuf,
    pub present: bool,
}

fn non_empty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false)
}

/// Attributions count as present either as a non-empty table with status
/// `present`, or as an explicit `absent` status.
fn attributions_accounted_for(layout: &Layout) -> bool {
    match read_json::<AttributionStatus>(&layout.attribution_status) {
        Ok(status) => match status.status {
            AttributionState::Present => non_empty(&layout.attributions),
            AttributionState::Absent => true,
        },
        Err(_) => false,
    }
}

pub fn verify(outdir: &Path) -> Vec<ArtifactCheck> {
    let layout = Layout::new(outdir);
    let files = [
        ("feature table", &layout.features),
        ("dataset", &layout.dataset),
        ("dataset metadata", &layout.dataset_meta),
        ("model", &layout.training.model),
        ("metrics", &layout.training.metrics),
        ("split", &layout.training.split),
    ];
    let mut checks: Vec<ArtifactCheck> = files
        .into_iter()
        .map(|(name, path)| ArtifactCheck {
            name,
            path: path.clone(),
            present: non_empty(path),
        })
        .collect();
    checks.push(ArtifactCheck {
        name: "attributions",
        path: layout.attribution_status.clone(),
        present: attributions_accounted_for(&layout),
    });

    for check in &checks {
        if check.present {
            info!("OK       {:<18} {}", check.name, check.path.display());
        } else {
            error!("MISSING  {:<18} {}", check.name, check.path.display());
        }
    }
    checks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_handling::vep_annotations::tests::write_vcf;
    use crate::training::Algorithm;

    fn write_inputs(dir: &Path) -> (PathBuf, PathBuf, PathBuf) {
        let mut vep = Vec::new();
        let mut clinvar = String::from("##fileformat=VCFv4.1\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n");
        for i in 0..24u64 {
            let pos = 23_885_000 + i * 10;
            let pathogenic = i % 2 == 0;
            let csq = if pathogenic {
                "A|stop_gained|HIGH|MYH7|YES||D|D|D|5.5|8.0"
            } else {
                "A|synonymous_variant|LOW|MYH7|YES|0.02|T|B|B|-1.0|-0.5"
            };
            vep.push(format!("14\t{pos}\trs{i}\tG\tA\t.\t.\tCSQ={csq}"));
            let clnsig = if pathogenic { "Pathogenic" } else { "Benign" };
            clinvar.push_str(&format!("14\t{pos}\t{i}\tG\tA\t.\t.\tCLNSIG={clnsig}\n"));
        }
        let records: Vec<&str> = vep.iter().map(String::as_str).collect();
        let vcf = write_vcf(dir, "vep.vcf", &records);

        let clinvar_path = dir.join("clinvar.vcf");
        std::fs::write(&clinvar_path, clinvar).unwrap();
        let expression = dir.join("expression.csv");
        std::fs::write(
            &expression,
            "gene,Heart - Left Ventricle,Heart - Atrial Appendage\nMYH7,1500.5,320.25\n",
        )
        .unwrap();
        (vcf, expression, clinvar_path)
    }

    #[test]
    fn full_run_passes_verification() {
        let dir = tempfile::tempdir().unwrap();
        let (vcf, expression, clinvar) = write_inputs(dir.path());
        let outdir = dir.path().join("out");
        let mut config = PipelineConfig::default();
        config.training.algorithm = Algorithm::GradientBoosting;
        config.training.gradient_boosting.n_rounds = 20;

        let report = run_pipeline(&vcf, &expression, &clinvar, &outdir, &config, false).unwrap();
        assert_eq!(report.dataset.rows_out, 24);
        assert_eq!(report.attributions.status, AttributionState::Present);
        assert_eq!(report.metrics.model_type, "gradient_boosting");

        let checks = verify(&outdir);
        assert!(checks.iter().all(|c| c.present), "{checks:?}");
    }

    #[test]
    fn failure_names_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let (_, expression, clinvar) = write_inputs(dir.path());
        let missing = dir.path().join("absent.vcf");
        let err = run_pipeline(&missing, &expression, &clinvar, &dir.path().join("out"), &PipelineConfig::default(), false)
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "feature extraction stage failed");
        match err {
            PipelineError::Stage { stage, source } => {
                assert_eq!(stage, "feature extraction");
                assert!(matches!(*source, PipelineError::Unreadable { .. }));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!dir.path().join("out").join(DATASET_FILE).exists());
    }

    #[test]
    fn empty_directory_reports_everything_missing() {
        let dir = tempfile::tempdir().unwrap();
        let checks = verify(dir.path());
        assert_eq!(checks.len(), 7);
        assert!(checks.iter().all(|c| !c.present));
    }

    #[test]
    fn stages_only_move_forward() {
        assert!(Stage::Extracted < Stage::Labeled);
        assert!(Stage::Trained < Stage::Explained);
    }
}
