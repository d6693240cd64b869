use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::helper_functions::read_json;
use crate::training::TrainConfig;

/// Optional JSON configuration. Every field has a default, so `{}` is a
/// valid file and only the overridden values need to be written.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub training: TrainConfig,
}

impl PipelineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(PipelineConfig::default());
        };
        let config: PipelineConfig = read_json(path)?;
        config.training.validate()?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::training::Algorithm;

    #[test]
    fn partial_file_keeps_the_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"training": {"algorithm": "gradient-boosting", "seed": 7, "boosted_trees": {"max_depth": 6}}}"#,
        )
        .unwrap();
        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.training.algorithm, Algorithm::GradientBoosting);
        assert_eq!(config.training.seed, 7);
        assert_eq!(config.training.test_fraction, 0.25);
        assert_eq!(config.training.boosted_trees.max_depth, 6);
        assert_eq!(config.training.boosted_trees.n_rounds, 300);
    }

    #[test]
    fn no_file_means_defaults() {
        assert_eq!(PipelineConfig::load(None).unwrap(), PipelineConfig::default());
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"training": {"boosted_trees": {"subsample": 0.0}}}"#).unwrap();
        assert!(matches!(
            PipelineConfig::load(Some(&path)).unwrap_err(),
            PipelineError::Config(_)
        ));
    }
}
