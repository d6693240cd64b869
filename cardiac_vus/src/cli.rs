use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::training::{Algorithm, TrainConfig};

/// Cardiac variant-of-uncertain-significance classifier pipeline
#[derive(Parser, Debug)]
#[command(name = "cardiac-vus")]
#[command(version)]
pub struct Cli {
    /// Log at debug level (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write the six-gene panel as a BED file
    PanelBed {
        #[arg(long)]
        out: PathBuf,
    },

    /// Median heart-tissue TPM per panel gene from a GTEx GCT matrix
    ExtractExpression {
        /// Gene TPM matrix (.gct or .gct.gz)
        #[arg(long)]
        gct: PathBuf,
        /// Sample attributes with SAMPID and SMTSD
        #[arg(long)]
        attrs: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },

    /// Feature table from a VEP-annotated VCF and the expression subset
    Features {
        #[arg(long)]
        vcf: PathBuf,
        #[arg(long)]
        expression: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },

    /// Join the feature table to ClinVar labels
    Dataset {
        #[arg(long)]
        features: PathBuf,
        #[arg(long)]
        clinvar: PathBuf,
        #[arg(long)]
        out: PathBuf,
        /// Row-accounting JSON (default: <out stem>.meta.json)
        #[arg(long)]
        meta: Option<PathBuf>,
    },

    /// Train and evaluate a classifier
    Train {
        #[arg(long)]
        dataset: PathBuf,
        /// Directory for model.json, metrics.json and split.csv
        #[arg(long)]
        outdir: PathBuf,
        #[command(flatten)]
        training: TrainingArgs,
        /// Also draw the held-out ROC curve to this PNG
        #[arg(long)]
        roc_plot: Option<PathBuf>,
    },

    /// Per-feature attributions for every feature row
    Explain {
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        features: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },

    /// Run features, dataset, train and explain in order
    Pipeline {
        #[arg(long)]
        vcf: PathBuf,
        #[arg(long)]
        expression: PathBuf,
        #[arg(long)]
        clinvar: PathBuf,
        #[arg(long)]
        outdir: PathBuf,
        #[command(flatten)]
        training: TrainingArgs,
        #[arg(long)]
        roc_plot: bool,
    },

    /// Check a pipeline output directory for every expected artifact
    Verify {
        #[arg(long)]
        outdir: PathBuf,
    },
}

/// Training options; flags override the `--config` file.
#[derive(Args, Debug, Clone)]
pub struct TrainingArgs {
    /// JSON configuration (every field optional)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub algorithm: Option<Algorithm>,

    #[arg(long)]
    pub test_fraction: Option<f64>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Threads handed to XGBoost; 0 forces the gbdt fallback under `auto`
    #[arg(long)]
    pub n_jobs: Option<usize>,
}

impl TrainingArgs {
    pub fn apply(&self, config: &mut TrainConfig) {
        if let Some(algorithm) = self.algorithm {
            config.algorithm = algorithm;
        }
        if let Some(test_fraction) = self.test_fraction {
            config.test_fraction = test_fraction;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(n_jobs) = self.n_jobs {
            config.n_jobs = n_jobs;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config_values() {
        let cli = Cli::parse_from([
            "cardiac-vus",
            "train",
            "--dataset",
            "d.csv",
            "--outdir",
            "out",
            "--algorithm",
            "logistic",
            "--seed",
            "9",
        ]);
        let Commands::Train { training, .. } = cli.command else {
            panic!("expected train");
        };
        let mut config = TrainConfig::default();
        training.apply(&mut config);
        assert_eq!(config.algorithm, Algorithm::Logistic);
        assert_eq!(config.seed, 9);
        assert_eq!(config.test_fraction, 0.25);
    }
}
