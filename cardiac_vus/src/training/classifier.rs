use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::helper_functions::{read_json, write_json};
use crate::models::FEATURE_SCHEMA_VERSION;
use crate::training::logistic::LogisticModel;
use crate::training::tree::{sigmoid, TreeEnsemble};

/// What every trained model offers downstream, whichever backend fit it.
pub trait BinaryClassifier {
    /// Log-odds of the pathogenic class.
    fn raw_score(&self, row: &[f64]) -> f64;

    fn predict_proba(&self, row: &[f64]) -> f64 {
        sigmoid(self.raw_score(row))
    }

    fn predict_label(&self, row: &[f64], threshold: f64) -> u8 {
        u8::from(self.predict_proba(row) >= threshold)
    }
}

impl BinaryClassifier for TreeEnsemble {
    fn raw_score(&self, row: &[f64]) -> f64 {
        TreeEnsemble::raw_score(self, row)
    }
}

impl BinaryClassifier for LogisticModel {
    fn raw_score(&self, row: &[f64]) -> f64 {
        LogisticModel::raw_score(self, row)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Classifier {
    TreeEnsemble(TreeEnsemble),
    Logistic(LogisticModel),
}

impl BinaryClassifier for Classifier {
    fn raw_score(&self, row: &[f64]) -> f64 {
        match self {
            Classifier::TreeEnsemble(m) => m.raw_score(row),
            Classifier::Logistic(m) => m.raw_score(row),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// `boosted_trees`, `gradient_boosting` or `logistic_regression`.
    pub algorithm: String,
    pub feature_schema_version: u32,
    pub feature_names: Vec<String>,
    pub training_rows: usize,
    pub test_rows: usize,
    pub seed: u64,
    pub fallback_reason: Option<String>,
    pub trained_at: String,
}

impl ModelMetadata {
    pub fn new(algorithm: &str, feature_names: Vec<String>, training_rows: usize, test_rows: usize, seed: u64) -> Self {
        ModelMetadata {
            algorithm: algorithm.to_string(),
            feature_schema_version: FEATURE_SCHEMA_VERSION,
            feature_names,
            training_rows,
            test_rows,
            seed,
            fallback_reason: None,
            trained_at: Utc::now().to_rfc3339(),
        }
    }
}

/// The persisted model: metadata plus a tagged model body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub metadata: ModelMetadata,
    pub model: Classifier,
}

impl BinaryClassifier for ModelArtifact {
    fn raw_score(&self, row: &[f64]) -> f64 {
        self.model.raw_score(row)
    }
}

impl ModelArtifact {
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let artifact: ModelArtifact = read_json(path)?;
        if artifact.metadata.feature_schema_version != FEATURE_SCHEMA_VERSION {
            return Err(PipelineError::malformed(
                path,
                format!(
                    "model was trained on feature schema v{}, this build reads v{}",
                    artifact.metadata.feature_schema_version, FEATURE_SCHEMA_VERSION
                ),
            ));
        }
        let n_features = artifact.metadata.feature_names.len();
        match &artifact.model {
            Classifier::TreeEnsemble(ensemble) => {
                ensemble.check(n_features).map_err(|detail| PipelineError::malformed(path, detail))?;
            }
            Classifier::Logistic(m) => {
                if m.coefficients.len() != n_features {
                    return Err(PipelineError::malformed(
                        path,
                        format!("{} coefficients for {} features", m.coefficients.len(), n_features),
                    ));
                }
            }
        }
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::tree::{Node, Tree};

    fn stump() -> ModelArtifact {
        ModelArtifact {
            metadata: ModelMetadata::new("boosted_trees", vec!["a".into(), "b".into()], 8, 2, 42),
            model: Classifier::TreeEnsemble(TreeEnsemble {
                base_score: 0.0,
                trees: vec![Tree {
                    nodes: vec![
                        Node::Split {
                            feature: 0,
                            threshold: 1.0,
                            left: 1,
                            right: 2,
                            cover: 8.0,
                        },
                        Node::Leaf { value: -2.0, cover: 4.0 },
                        Node::Leaf { value: 2.0, cover: 4.0 },
                    ],
                }],
            }),
        }
    }

    #[test]
    fn artifact_roundtrip_predicts_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let artifact = stump();
        artifact.save(&path).unwrap();
        let back = ModelArtifact::load(&path).unwrap();
        assert_eq!(back, artifact);
        assert_eq!(back.predict_label(&[0.0, 0.0], 0.5), 0);
        assert_eq!(back.predict_label(&[2.0, 0.0], 0.5), 1);
        assert!((back.predict_proba(&[2.0, 0.0]) - sigmoid(2.0)).abs() < 1e-15);
    }

    fn save_edited(edit: impl FnOnce(&mut serde_json::Value)) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let mut json = serde_json::to_value(stump()).unwrap();
        edit(&mut json);
        std::fs::write(&path, serde_json::to_string(&json).unwrap()).unwrap();
        (dir, path)
    }

    #[test]
    fn tree_with_unknown_feature_is_rejected_on_load() {
        let (_dir, path) = save_edited(|json| json["model"]["trees"][0]["nodes"][0]["feature"] = serde_json::json!(99));
        let err = ModelArtifact::load(&path).unwrap_err();
        assert!(matches!(&err, PipelineError::Malformed { detail, .. } if detail.contains("feature 99")), "{err}");
    }

    #[test]
    fn tree_with_dangling_child_is_rejected_on_load() {
        let (_dir, path) = save_edited(|json| json["model"]["trees"][0]["nodes"][0]["right"] = serde_json::json!(7));
        let err = ModelArtifact::load(&path).unwrap_err();
        assert!(matches!(&err, PipelineError::Malformed { detail, .. } if detail.contains("child 7")), "{err}");
    }

    #[test]
    fn tree_pointing_back_at_its_root_is_rejected_on_load() {
        let (_dir, path) = save_edited(|json| json["model"]["trees"][0]["nodes"][0]["left"] = serde_json::json!(0));
        assert!(matches!(
            ModelArtifact::load(&path).unwrap_err(),
            PipelineError::Malformed { .. }
        ));
    }

    #[test]
    fn schema_version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let mut artifact = stump();
        artifact.metadata.feature_schema_version = FEATURE_SCHEMA_VERSION + 1;
        artifact.save(&path).unwrap();
        assert!(matches!(
            ModelArtifact::load(&path).unwrap_err(),
            PipelineError::Malformed { .. }
        ));
    }
}
