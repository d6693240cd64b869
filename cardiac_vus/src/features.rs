//! Feature extraction: VEP-annotated panel variants plus heart expression
//! become one fixed-width numeric row per variant key.

use std::collections::HashSet;
use std::path::Path;

use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::data_handling::expression::{ExpressionSubset, ExpressionTable, Tissue};
use crate::data_handling::gene_panel::{gene_at, is_panel_gene};
use crate::data_handling::vep_annotations::{AnnotatedVariant, AnnotatedVcf, VepAnnotations};
use crate::data_handling::Source;
use crate::error::{PipelineError, Result};
use crate::helper_functions::{dataframe_to_csv, read_csv, require_columns, required_float_column, string_column};
use crate::models::{
    Consequence, FeatureRow, Impact, PredictorCall, VariantKey, CONSEQUENCE_COLUMN, FEATURE_COLUMNS, GENE_COLUMN,
    KEY_COLUMNS, MISSING_VALUE, N_FEATURES,
};

// CSQ field names, with the aliases different VEP plugin versions use.
const SIFT_FIELDS: &[&str] = &["SIFT_pred"];
const HVAR_FIELDS: &[&str] = &["Polyphen2_HVAR_pred"];
const HDIV_FIELDS: &[&str] = &["Polyphen2_HDIV_pred"];
const GNOMAD_FIELDS: &[&str] = &["gnomADg_AF", "gnomAD_genomes_AF", "gnomAD_AF"];
const GERP_FIELDS: &[&str] = &["GERP++_RS", "GERP_RS"];
const PHYLOP_FIELDS: &[&str] = &["phyloP100way_vertebrate"];

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeatureTable {
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn keys(&self) -> Vec<VariantKey> {
        self.rows.iter().map(|r| r.key.clone()).collect()
    }

    /// Descriptive columns first, then the feature vector in schema order.
    pub fn to_dataframe(&self) -> Result<DataFrame> {
        let mut df = DataFrame::default();
        add_key_columns(&mut df, self.rows.iter().map(|r| &r.key))?;

        let genes: Vec<&str> = self.rows.iter().map(|r| r.gene.as_str()).collect();
        df.with_column(Series::new(PlSmallStr::from(GENE_COLUMN), genes))?;
        let consequences: Vec<&str> = self.rows.iter().map(|r| r.consequence.as_str()).collect();
        df.with_column(Series::new(PlSmallStr::from(CONSEQUENCE_COLUMN), consequences))?;

        for (j, &name) in FEATURE_COLUMNS.iter().enumerate() {
            let col: Vec<f64> = self.rows.iter().map(|r| r.features[j]).collect();
            df.with_column(Series::new(PlSmallStr::from(name), col))?;
        }
        Ok(df)
    }

    /// Validate the schema by column name and rebuild the rows. Extra
    /// columns (labels, for instance) are ignored. A repeated variant key
    /// keeps its first row.
    pub fn from_dataframe(df: &DataFrame, path: &Path) -> Result<Self> {
        let mut required: Vec<&str> = KEY_COLUMNS.to_vec();
        required.extend([GENE_COLUMN, CONSEQUENCE_COLUMN]);
        required.extend(FEATURE_COLUMNS);
        require_columns(df, path, &required, &required.join(","))?;

        let keys = read_keys(df, path)?;
        let genes = string_column(df, GENE_COLUMN)?;
        let consequences = string_column(df, CONSEQUENCE_COLUMN)?;
        let mut columns = Vec::with_capacity(N_FEATURES);
        for name in FEATURE_COLUMNS {
            columns.push(required_float_column(df, path, name)?);
        }

        let mut rows = Vec::with_capacity(keys.len());
        let mut seen = HashSet::with_capacity(keys.len());
        let mut duplicates = 0usize;
        for (i, key) in keys.into_iter().enumerate() {
            if !seen.insert(key.clone()) {
                debug!("row {}: repeated key {} dropped", i + 1, key);
                duplicates += 1;
                continue;
            }
            let label = consequences[i].as_deref().unwrap_or("");
            let consequence = Consequence::parse(label).ok_or_else(|| {
                PipelineError::malformed(path, format!("row {}: unknown consequence label `{}`", i + 1, label))
            })?;
            rows.push(FeatureRow {
                key,
                gene: genes[i].clone().unwrap_or_default(),
                consequence,
                features: columns.iter().map(|c| c[i]).collect(),
            });
        }
        if duplicates > 0 {
            warn!(
                "{} rows of {} repeat an earlier variant key and were dropped",
                duplicates,
                path.display()
            );
        }
        Ok(FeatureTable { rows })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let df = read_csv(path)?;
        let table = Self::from_dataframe(&df, path)?;
        info!("Loaded {} feature rows from {}", table.len(), path.display());
        Ok(table)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut df = self.to_dataframe()?;
        dataframe_to_csv(&mut df, path)?;
        info!("Wrote {} feature rows to {}", self.len(), path.display());
        Ok(())
    }
}

/// `chrom,pos,ref,alt` columns, `pos` as a 64-bit integer.
pub fn add_key_columns<'a>(df: &mut DataFrame, keys: impl Iterator<Item = &'a VariantKey> + Clone) -> Result<()> {
    let chrom: Vec<&str> = keys.clone().map(|k| k.chrom.as_str()).collect();
    let pos: Vec<i64> = keys.clone().map(|k| k.pos as i64).collect();
    let reference: Vec<&str> = keys.clone().map(|k| k.reference.as_str()).collect();
    let alternate: Vec<&str> = keys.map(|k| k.alternate.as_str()).collect();
    df.with_column(Series::new(PlSmallStr::from(KEY_COLUMNS[0]), chrom))?;
    df.with_column(Series::new(PlSmallStr::from(KEY_COLUMNS[1]), pos))?;
    df.with_column(Series::new(PlSmallStr::from(KEY_COLUMNS[2]), reference))?;
    df.with_column(Series::new(PlSmallStr::from(KEY_COLUMNS[3]), alternate))?;
    Ok(())
}

pub fn read_keys(df: &DataFrame, path: &Path) -> Result<Vec<VariantKey>> {
    require_columns(df, path, &KEY_COLUMNS, &KEY_COLUMNS.join(","))?;
    let chrom = string_column(df, KEY_COLUMNS[0])?;
    let pos = string_column(df, KEY_COLUMNS[1])?;
    let reference = string_column(df, KEY_COLUMNS[2])?;
    let alternate = string_column(df, KEY_COLUMNS[3])?;

    (0..df.height())
        .map(|i| {
            let (Some(c), Some(p), Some(r), Some(a)) = (&chrom[i], &pos[i], &reference[i], &alternate[i]) else {
                return Err(PipelineError::malformed(path, format!("row {}: incomplete variant key", i + 1)));
            };
            let p: u64 = p
                .parse()
                .map_err(|_| PipelineError::malformed(path, format!("row {}: position `{}` is not an integer", i + 1, p)))?;
            Ok(VariantKey::new(c, p, r, a))
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

/// `[value, 0]` or `[MISSING_VALUE, 1]`.
fn encode_score(value: Option<f64>) -> [f64; 2] {
    match value {
        Some(v) => [v, 0.0],
        None => [MISSING_VALUE, 1.0],
    }
}

/// First `&`-separated entry that parses as a finite number.
fn first_parseable(field: Option<&str>) -> Option<f64> {
    field?
        .split('&')
        .filter_map(|v| v.trim().parse::<f64>().ok())
        .find(|v| v.is_finite())
}

fn predictor(vcf: &AnnotatedVcf, variant: &AnnotatedVariant, names: &[&str]) -> f64 {
    vcf.first_field(variant, names)
        .map_or(PredictorCall::Unknown, PredictorCall::most_damaging)
        .code()
}

/// Panel gene for the variant: VEP SYMBOL when present, else the panel
/// interval containing the position.
fn panel_gene(vcf: &AnnotatedVcf, variant: &AnnotatedVariant) -> Option<String> {
    match vcf.field(variant, "SYMBOL") {
        Some(symbol) if is_panel_gene(symbol) => Some(symbol.to_string()),
        Some(_) => None,
        None => gene_at(&variant.key.chrom, variant.key.pos).map(|g| g.symbol.to_string()),
    }
}

pub fn encode_variant(
    vcf: &AnnotatedVcf,
    variant: &AnnotatedVariant,
    gene: String,
    expression: &ExpressionTable,
) -> FeatureRow {
    let consequence = vcf
        .field(variant, "Consequence")
        .map_or(Consequence::Unknown, Consequence::worst_of);
    let impact = vcf.field(variant, "IMPACT").map_or(Impact::Unknown, Impact::parse);

    let mut features = Vec::with_capacity(N_FEATURES);
    features.extend(consequence.one_hot());
    features.push(impact.code());
    features.push(predictor(vcf, variant, SIFT_FIELDS));
    features.push(predictor(vcf, variant, HVAR_FIELDS));
    features.push(predictor(vcf, variant, HDIV_FIELDS));
    features.extend(encode_score(first_parseable(vcf.first_field(variant, GNOMAD_FIELDS))));
    features.extend(encode_score(first_parseable(vcf.first_field(variant, GERP_FIELDS))));
    features.extend(encode_score(first_parseable(vcf.first_field(variant, PHYLOP_FIELDS))));
    for tissue in Tissue::ALL {
        features.extend(encode_score(expression.lookup(&gene, tissue)));
    }

    FeatureRow {
        key: variant.key.clone(),
        gene,
        consequence,
        features,
    }
}

/// One row per unique panel variant key, sorted by key. Duplicate keys keep
/// their first occurrence.
pub fn extract_features(vcf: &AnnotatedVcf, expression: &ExpressionTable) -> Result<FeatureTable> {
    let mut seen: HashSet<VariantKey> = HashSet::new();
    let mut rows = Vec::new();
    let mut off_panel = 0usize;
    let mut duplicates = 0usize;

    for variant in &vcf.variants {
        let Some(gene) = panel_gene(vcf, variant) else {
            off_panel += 1;
            continue;
        };
        if !seen.insert(variant.key.clone()) {
            duplicates += 1;
            debug!("duplicate variant {} ignored", variant.key);
            continue;
        }
        rows.push(encode_variant(vcf, variant, gene, expression));
    }

    if duplicates > 0 {
        warn!("{} duplicate variant keys removed (first occurrence kept)", duplicates);
    }
    info!("{} variants outside the gene panel skipped", off_panel);

    if rows.is_empty() {
        return Err(PipelineError::DataQuality(format!(
            "none of the {} annotated variants belongs to the gene panel",
            vcf.variants.len()
        )));
    }

    let without_expression = rows.iter().filter(|r| !expression.contains_gene(&r.gene)).count();
    if without_expression > 0 {
        warn!("{} variants have no expression record for their gene", without_expression);
    }

    rows.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(FeatureTable { rows })
}

pub fn run_feature_extraction(vcf_path: &Path, expression_path: &Path, out: &Path) -> Result<FeatureTable> {
    let vcf = VepAnnotations {
        path: vcf_path.to_path_buf(),
    }
    .load()?;
    let expression = ExpressionSubset {
        path: expression_path.to_path_buf(),
    }
    .load()?;

    let table = extract_features(&vcf, &expression)?;
    table.write(out)?;
    Ok(table)
}
