//! Labelled training table: feature rows joined to ClinVar significance.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::data_handling::clinvar::{ClinvarLabels, ClinvarRecord};
use crate::data_handling::Source;
use crate::error::{PipelineError, Result};
use crate::features::FeatureTable;
use crate::helper_functions::{dataframe_to_csv, read_csv, require_columns, string_column, write_json};
use crate::models::{LabeledRow, VariantKey, CLNSIG_COLUMN, LABEL_COLUMN, N_FEATURES};

/// Row accounting for one dataset build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub total_input_rows: usize,
    pub dropped_no_label: usize,
    pub dropped_unmatched: usize,
    pub dropped_excluded: usize,
    pub rows_out: usize,
    pub pathogenic: usize,
    pub benign: usize,
    pub pathogenic_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LabeledDataset {
    pub rows: Vec<LabeledRow>,
}

impl LabeledDataset {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> Vec<&VariantKey> {
        self.rows.iter().map(|r| &r.row.key).collect()
    }

    pub fn feature_matrix(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.rows.len(), N_FEATURES), |(i, j)| self.rows[i].row.features[j])
    }

    pub fn labels(&self) -> Array1<u8> {
        self.rows.iter().map(|r| r.label).collect()
    }

    pub fn class_counts(&self) -> (usize, usize) {
        let pathogenic = self.rows.iter().filter(|r| r.label == 1).count();
        (pathogenic, self.rows.len() - pathogenic)
    }

    pub fn read(path: &Path) -> Result<Self> {
        let df = read_csv(path)?;
        require_columns(
            &df,
            path,
            &[LABEL_COLUMN, CLNSIG_COLUMN],
            "<feature table columns>,label,clinical_significance",
        )?;
        let features = FeatureTable::from_dataframe(&df, path)?;
        let labels = string_column(&df, LABEL_COLUMN)?;
        let clnsig = string_column(&df, CLNSIG_COLUMN)?;

        let rows = features
            .rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                let label = match labels[i].as_deref() {
                    Some("0") => 0,
                    Some("1") => 1,
                    other => {
                        return Err(PipelineError::malformed(
                            path,
                            format!("row {}: label `{}` is not 0 or 1", i + 1, other.unwrap_or("")),
                        ))
                    }
                };
                Ok(LabeledRow {
                    row,
                    label,
                    clinical_significance: clnsig[i].clone().unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        info!("Loaded {} labelled rows from {}", rows.len(), path.display());
        Ok(LabeledDataset { rows })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let features = FeatureTable {
            rows: self.rows.iter().map(|r| r.row.clone()).collect(),
        };
        let mut df = features.to_dataframe()?;
        let labels: Vec<i64> = self.rows.iter().map(|r| i64::from(r.label)).collect();
        df.with_column(Series::new(PlSmallStr::from(LABEL_COLUMN), labels))?;
        let clnsig: Vec<&str> = self.rows.iter().map(|r| r.clinical_significance.as_str()).collect();
        df.with_column(Series::new(PlSmallStr::from(CLNSIG_COLUMN), clnsig))?;
        dataframe_to_csv(&mut df, path)?;
        info!("Wrote {} labelled rows to {}", self.len(), path.display());
        Ok(())
    }
}

/// Left join by key. Rows without a ClinVar record and rows whose label is
/// excluded by policy are dropped and counted; nothing is zero-filled. Of
/// feature rows sharing a key only the first is joined.
pub fn build_dataset(
    features: &FeatureTable,
    clinvar: &HashMap<VariantKey, ClinvarRecord>,
) -> Result<(LabeledDataset, DatasetMetadata)> {
    let mut rows = Vec::new();
    let mut seen: HashSet<&VariantKey> = HashSet::with_capacity(features.len());
    let mut repeated = 0usize;
    let mut unmatched = 0usize;
    let mut excluded = 0usize;

    for row in &features.rows {
        if !seen.insert(&row.key) {
            repeated += 1;
            continue;
        }
        let Some(record) = clinvar.get(&row.key) else {
            unmatched += 1;
            continue;
        };
        let Some(label) = record.class.as_label() else {
            excluded += 1;
            continue;
        };
        rows.push(LabeledRow {
            row: row.clone(),
            label,
            clinical_significance: record.clinical_significance.clone(),
        });
    }
    if repeated > 0 {
        warn!("{} feature rows repeat an earlier variant key and were not joined", repeated);
    }
    info!("{} feature rows had no ClinVar record", unmatched);
    info!("{} feature rows excluded by the label policy", excluded);

    if rows.is_empty() {
        return Err(PipelineError::DataQuality(format!(
            "no labelled rows among {} feature rows ({} unmatched, {} excluded)",
            features.len(),
            unmatched,
            excluded
        )));
    }

    rows.sort_by(|a, b| a.row.key.cmp(&b.row.key));
    let dataset = LabeledDataset { rows };
    let (pathogenic, benign) = dataset.class_counts();
    let metadata = DatasetMetadata {
        total_input_rows: features.len() - repeated,
        dropped_no_label: unmatched + excluded,
        dropped_unmatched: unmatched,
        dropped_excluded: excluded,
        rows_out: dataset.len(),
        pathogenic,
        benign,
        pathogenic_fraction: pathogenic as f64 / dataset.len() as f64,
    };
    info!(
        "Dataset: {} rows ({} pathogenic, {} benign)",
        metadata.rows_out, metadata.pathogenic, metadata.benign
    );
    Ok((dataset, metadata))
}

/// `dataset.csv` → `dataset.meta.json`.
pub fn metadata_path(dataset_path: &Path) -> PathBuf {
    let stem = dataset_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dataset".to_string());
    dataset_path.with_file_name(format!("{stem}.meta.json"))
}

pub fn run_dataset_build(
    features_path: &Path,
    clinvar_path: &Path,
    out: &Path,
    meta_out: Option<&Path>,
) -> Result<DatasetMetadata> {
    let features = FeatureTable::read(features_path)?;
    let clinvar = ClinvarLabels {
        path: clinvar_path.to_path_buf(),
    }
    .load()?;

    let (dataset, metadata) = build_dataset(&features, &clinvar)?;
    dataset.write(out)?;
    let meta_path = meta_out.map_or_else(|| metadata_path(out), Path::to_path_buf);
    write_json(&meta_path, &metadata)?;
    info!("Wrote dataset metadata to {}", meta_path.display());
    Ok(metadata)
}
