use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, TrainingArgs};
use crate::config::PipelineConfig;
use crate::data_handling::gtex::{write_heart_medians, GtexMatrix};
use crate::data_handling::Source;

mod analysis;
mod cli;
mod config;
mod data_handling;
mod dataset;
mod error;
mod explain;
mod features;
mod helper_functions;
mod models;
mod pipeline;
mod training;

fn training_config(args: &TrainingArgs) -> anyhow::Result<PipelineConfig> {
    let mut config = PipelineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config.training);
    config.training.validate()?;
    Ok(config)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::PanelBed { out } => {
            let n = data_handling::gene_panel::write_bed(&out)
                .with_context(|| format!("panel-bed: writing {}", out.display()))?;
            info!("Wrote {} panel genes to {}", n, out.display());
        }
        Commands::ExtractExpression { gct, attrs, out } => {
            let medians = GtexMatrix {
                gct_path: gct,
                attributes_path: attrs,
            }
            .load()
            .context("extract-expression: reading GTEx inputs")?;
            write_heart_medians(&medians, &out).context("extract-expression: writing subset")?;
            info!("Wrote heart expression for {} genes to {}", medians.rows.len(), out.display());
        }
        Commands::Features { vcf, expression, out } => {
            features::run_feature_extraction(&vcf, &expression, &out)
                .with_context(|| format!("features: extracting from {}", vcf.display()))?;
        }
        Commands::Dataset {
            features,
            clinvar,
            out,
            meta,
        } => {
            let metadata = dataset::run_dataset_build(&features, &clinvar, &out, meta.as_deref())
                .with_context(|| format!("dataset: joining {} to {}", features.display(), clinvar.display()))?;
            info!(
                "{} of {} feature rows labelled, {} dropped without a label",
                metadata.rows_out, metadata.total_input_rows, metadata.dropped_no_label
            );
        }
        Commands::Train {
            dataset,
            outdir,
            training,
            roc_plot,
        } => {
            let config = training_config(&training)?;
            training::run_training(&dataset, &outdir, &config.training, roc_plot.as_deref())
                .with_context(|| format!("train: fitting on {}", dataset.display()))?;
        }
        Commands::Explain { model, features, out } => {
            explain::run_explain(&model, &features, &out)
                .with_context(|| format!("explain: attributing {} with {}", features.display(), model.display()))?;
        }
        Commands::Pipeline {
            vcf,
            expression,
            clinvar,
            outdir,
            training,
            roc_plot,
        } => {
            let config = training_config(&training)?;
            let report = pipeline::run_pipeline(&vcf, &expression, &clinvar, &outdir, &config, roc_plot)
                .with_context(|| format!("pipeline: run into {}", outdir.display()))?;
            info!(
                "Pipeline complete: {} rows, ROC-AUC {:?}, attributions {:?}",
                report.dataset.rows_out, report.metrics.roc_auc, report.attributions.status
            );
        }
        Commands::Verify { outdir } => {
            let missing = pipeline::verify(&outdir).iter().filter(|c| !c.present).count();
            if missing > 0 {
                bail!("{} artifact(s) missing under {}", missing, outdir.display());
            }
            info!("All artifacts present under {}", outdir.display());
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}
