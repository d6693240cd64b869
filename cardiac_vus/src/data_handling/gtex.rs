use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};

use statrs::statistics::{Data, Median};
use tracing::{info, warn};

use crate::data_handling::expression::Tissue;
use crate::data_handling::gene_panel::{is_panel_gene, panel_symbols};
use crate::data_handling::Source;
use crate::error::{PipelineError, Result};
use crate::helper_functions::{open_text, write_atomic};

/// Median heart expression per panel gene, in panel order.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartMedians {
    pub rows: Vec<(String, [Option<f64>; 2])>,
}

/// A GTEx gene-TPM matrix (GCT v1.2, plain or gzipped) with its
/// sample-attributes table.
pub struct GtexMatrix {
    pub gct_path: PathBuf,
    pub attributes_path: PathBuf,
}

impl Source for GtexMatrix {
    type Output = HeartMedians;

    fn load(&self) -> Result<HeartMedians> {
        let sample_tissue = self.heart_samples()?;
        info!("{} heart samples in {}", sample_tissue.len(), self.attributes_path.display());

        info!("Reading GCT matrix {}", self.gct_path.display());
        let mut reader = open_text(&self.gct_path)?;
        // `#1.2` and the dimensions line
        for _ in 0..2 {
            let mut skipped = String::new();
            let n = reader.read_line(&mut skipped).map_err(|source| PipelineError::Unreadable {
                path: self.gct_path.clone(),
                source,
            })?;
            if n == 0 {
                return Err(PipelineError::malformed(&self.gct_path, "truncated GCT header"));
            }
        }

        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_reader(reader);
        let headers = rdr.headers()?.clone();
        let desc_idx = headers.iter().position(|h| h == "Description").ok_or_else(|| {
            PipelineError::MissingColumns {
                path: self.gct_path.clone(),
                missing: vec!["Description".to_string()],
                expected: "Name, Description, <sample ids>".to_string(),
            }
        })?;
        let sample_cols: Vec<(usize, Tissue)> = headers
            .iter()
            .enumerate()
            .filter_map(|(i, h)| sample_tissue.get(h).map(|t| (i, *t)))
            .collect();
        if sample_cols.is_empty() {
            warn!("no heart samples found among the GCT columns");
        }

        let mut per_gene: HashMap<String, [Vec<f64>; 2]> = HashMap::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record?;
            let Some(gene) = record.get(desc_idx) else { continue };
            if !is_panel_gene(gene) || per_gene.contains_key(gene) {
                continue;
            }
            let mut values: [Vec<f64>; 2] = [Vec::new(), Vec::new()];
            for (idx, tissue) in &sample_cols {
                let raw = record.get(*idx).unwrap_or("").trim();
                let v: f64 = raw.parse().map_err(|_| {
                    PipelineError::malformed(
                        &self.gct_path,
                        format!("data row {}: `{}` is not a TPM value", line + 1, raw),
                    )
                })?;
                values[tissue.slot()].push(v);
            }
            per_gene.insert(gene.to_string(), values);
        }

        let rows = panel_symbols()
            .into_iter()
            .map(|gene| {
                let mut medians = [None; 2];
                if let Some(values) = per_gene.remove(gene) {
                    for (slot, v) in values.into_iter().enumerate() {
                        if !v.is_empty() {
                            medians[slot] = Some(Data::new(v).median());
                        }
                    }
                } else {
                    warn!("{} not present in the GCT matrix", gene);
                }
                (gene.to_string(), medians)
            })
            .collect();
        Ok(HeartMedians { rows })
    }
}

impl GtexMatrix {
    /// `SAMPID` → heart tissue, from the `SMTSD` column.
    fn heart_samples(&self) -> Result<HashMap<String, Tissue>> {
        let reader = open_text(&self.attributes_path)?;
        let mut rdr = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .from_reader(reader);
        let headers = rdr.headers()?.clone();
        let sampid = headers.iter().position(|h| h == "SAMPID");
        let smtsd = headers.iter().position(|h| h == "SMTSD");
        let (Some(sampid), Some(smtsd)) = (sampid, smtsd) else {
            let missing = ["SAMPID", "SMTSD"]
                .iter()
                .filter(|c| !headers.iter().any(|h| h == **c))
                .map(|c| c.to_string())
                .collect();
            return Err(PipelineError::MissingColumns {
                path: self.attributes_path.clone(),
                missing,
                expected: "SAMPID, SMTSD (tab-separated)".to_string(),
            });
        };

        let mut map = HashMap::new();
        for record in rdr.records() {
            let record = record?;
            let (Some(id), Some(tissue)) = (record.get(sampid), record.get(smtsd)) else {
                continue;
            };
            if let Some(t) = Tissue::ALL.into_iter().find(|t| t.gtex_name() == tissue.trim()) {
                map.insert(id.to_string(), t);
            }
        }
        Ok(map)
    }
}

/// Write `gene,<tissue>,<tissue>`; an empty cell means no samples.
pub fn write_heart_medians(medians: &HeartMedians, path: &Path) -> Result<()> {
    write_atomic(path, |file| {
        let mut wtr = csv::Writer::from_writer(file);
        let mut header = vec!["gene"];
        header.extend(Tissue::ALL.iter().map(|t| t.gtex_name()));
        wtr.write_record(&header)?;
        for (gene, values) in &medians.rows {
            let mut record = vec![gene.clone()];
            record.extend(values.iter().map(|v| v.map(|x| x.to_string()).unwrap_or_default()));
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    })?;
    info!("Wrote expression subset for {} genes to {}", medians.rows.len(), path.display());
    Ok(())
}
