//! Heart-tissue expression subset, wide (one column per tissue) or long
//! (`gene,tissue,<value>`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use polars::prelude::*;
use statrs::statistics::{Data, Median};
use tracing::{info, warn};

use crate::data_handling::Source;
use crate::error::{PipelineError, Result};
use crate::helper_functions::{has_column, read_csv, string_column};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tissue {
    LeftVentricle,
    AtrialAppendage,
}

impl Tissue {
    pub const ALL: [Tissue; 2] = [Tissue::LeftVentricle, Tissue::AtrialAppendage];

    /// GTEx `SMTSD` spelling.
    pub fn gtex_name(&self) -> &'static str {
        match self {
            Tissue::LeftVentricle => "Heart - Left Ventricle",
            Tissue::AtrialAppendage => "Heart - Atrial Appendage",
        }
    }

    /// Feature column carrying this tissue's TPM.
    pub fn feature_column(&self) -> &'static str {
        match self {
            Tissue::LeftVentricle => "heart_lv_tpm",
            Tissue::AtrialAppendage => "heart_aa_tpm",
        }
    }

    /// Accepts the GTEx name (case-insensitive, trailing text allowed) or the
    /// feature column name.
    pub fn from_label(label: &str) -> Option<Tissue> {
        let lowered = label.trim().to_ascii_lowercase();
        Tissue::ALL.into_iter().find(|t| {
            lowered.starts_with(&t.gtex_name().to_ascii_lowercase()) || lowered == t.feature_column()
        })
    }

    pub(crate) fn slot(&self) -> usize {
        match self {
            Tissue::LeftVentricle => 0,
            Tissue::AtrialAppendage => 1,
        }
    }
}

const GENE_COLUMNS: [&str; 3] = ["gene", "Description", "Name"];
const TISSUE_COLUMN: &str = "tissue";
const VALUE_COLUMNS: [&str; 4] = ["tpm", "median_tpm", "value", "expression"];
const MISSING_TOKENS: [&str; 5] = ["", "NA", "NaN", "nan", "."];
const EXPECTED_SCHEMA: &str =
    "wide: gene|Description|Name + `Heart - Left Ventricle` and/or `Heart - Atrial Appendage`; long: gene,tissue,tpm";

/// At most one value per (gene, tissue).
#[derive(Debug, Clone, Default)]
pub struct ExpressionTable {
    values: HashMap<String, [Option<f64>; 2]>,
}

impl ExpressionTable {
    pub fn lookup(&self, gene: &str, tissue: Tissue) -> Option<f64> {
        self.values.get(gene).and_then(|v| v[tissue.slot()])
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains_gene(&self, gene: &str) -> bool {
        self.values.contains_key(gene)
    }
}

pub struct ExpressionSubset {
    pub path: PathBuf,
}

impl Source for ExpressionSubset {
    type Output = ExpressionTable;

    fn load(&self) -> Result<ExpressionTable> {
        info!("Reading expression subset from {}", self.path.display());
        let df = read_csv(&self.path)?;

        let table = if has_column(&df, TISSUE_COLUMN) {
            self.load_long(&df)?
        } else {
            self.load_wide(&df)?
        };
        info!("Expression available for {} genes", table.len());
        Ok(table)
    }
}

impl ExpressionSubset {
    fn gene_column(&self, df: &DataFrame) -> Result<&'static str> {
        GENE_COLUMNS
            .iter()
            .copied()
            .find(|c| has_column(df, c))
            .ok_or_else(|| PipelineError::MissingColumns {
                path: self.path.clone(),
                missing: vec!["gene".to_string()],
                expected: EXPECTED_SCHEMA.to_string(),
            })
    }

    fn load_wide(&self, df: &DataFrame) -> Result<ExpressionTable> {
        let gene_col = self.gene_column(df)?;

        // first matching column per tissue
        let mut tissue_cols: Vec<(Tissue, String)> = Vec::new();
        for name in df.get_column_names() {
            if let Some(t) = Tissue::from_label(name.as_str()) {
                if !tissue_cols.iter().any(|(seen, _)| *seen == t) {
                    tissue_cols.push((t, name.as_str().to_string()));
                }
            }
        }
        if tissue_cols.is_empty() {
            return Err(PipelineError::MissingColumns {
                path: self.path.clone(),
                missing: Tissue::ALL.iter().map(|t| t.gtex_name().to_string()).collect(),
                expected: EXPECTED_SCHEMA.to_string(),
            });
        }

        let genes = string_column(df, gene_col)?;
        let mut columns = Vec::with_capacity(tissue_cols.len());
        for (tissue, name) in &tissue_cols {
            columns.push((*tissue, name.as_str(), string_column(df, name)?));
        }

        let mut table = ExpressionTable::default();
        let mut duplicates = 0usize;
        for (row, gene) in genes.iter().enumerate() {
            let Some(gene) = gene else { continue };
            if table.values.contains_key(gene) {
                duplicates += 1;
                continue;
            }
            let mut slots = [None; 2];
            for (tissue, name, cells) in &columns {
                slots[tissue.slot()] = parse_tpm(&self.path, row, name, cells[row].as_deref())?;
            }
            table.values.insert(gene.clone(), slots);
        }
        if duplicates > 0 {
            warn!("{} duplicated gene rows ignored (first occurrence kept)", duplicates);
        }
        Ok(table)
    }

    fn load_long(&self, df: &DataFrame) -> Result<ExpressionTable> {
        let gene_col = self.gene_column(df)?;
        let value_col = VALUE_COLUMNS
            .iter()
            .copied()
            .find(|c| has_column(df, c))
            .ok_or_else(|| PipelineError::MissingColumns {
                path: self.path.clone(),
                missing: vec!["tpm".to_string()],
                expected: EXPECTED_SCHEMA.to_string(),
            })?;

        let genes = string_column(df, gene_col)?;
        let tissues = string_column(df, TISSUE_COLUMN)?;
        let values = string_column(df, value_col)?;

        let mut grouped: HashMap<(String, Tissue), Vec<f64>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for row in 0..genes.len() {
            let (Some(gene), Some(tissue)) = (&genes[row], &tissues[row]) else {
                continue;
            };
            let Some(tissue) = Tissue::from_label(tissue) else {
                continue;
            };
            if !order.contains(gene) {
                order.push(gene.clone());
            }
            if let Some(v) = parse_tpm(&self.path, row, value_col, values[row].as_deref())? {
                grouped.entry((gene.clone(), tissue)).or_default().push(v);
            }
        }

        let mut table = ExpressionTable::default();
        for gene in order {
            let mut slots = [None; 2];
            for tissue in Tissue::ALL {
                if let Some(v) = grouped.remove(&(gene.clone(), tissue)) {
                    slots[tissue.slot()] = Some(Data::new(v).median());
                }
            }
            table.values.insert(gene, slots);
        }
        Ok(table)
    }
}

/// Missing tokens read as absent; anything else must be a non-negative number.
fn parse_tpm(path: &Path, row: usize, column: &str, cell: Option<&str>) -> Result<Option<f64>> {
    let Some(cell) = cell.map(str::trim) else {
        return Ok(None);
    };
    if MISSING_TOKENS.contains(&cell) {
        return Ok(None);
    }
    match cell.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Ok(Some(v)),
        _ => Err(PipelineError::malformed(
            path,
            format!("row {}: `{}` value `{}` is not a non-negative expression level", row + 1, column, cell),
        )),
    }
}
