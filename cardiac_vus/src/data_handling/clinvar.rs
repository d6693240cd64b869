//! ClinVar clinical-significance labels, keyed by variant.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::info;

use crate::data_handling::vcf::VcfReader;
use crate::data_handling::Source;
use crate::error::Result;
use crate::models::{LabelClass, VariantKey};

#[derive(Debug, Clone, PartialEq)]
pub struct ClinvarRecord {
    pub clinical_significance: String,
    pub class: LabelClass,
}

const PATHOGENIC_TERMS: [&str; 2] = ["pathogenic", "likely_pathogenic"];
const BENIGN_TERMS: [&str; 2] = ["benign", "likely_benign"];
const DISQUALIFYING_TERMS: [&str; 3] = ["low_penetrance", "uncertain_significance", "uncertain_risk_allele"];

/// Map a CLNSIG value to a training bucket.
///
/// The value is split into terms on `,` `|` and `/`, trimmed of `_` and
/// whitespace and lower-cased. `pathogenic` / `likely_pathogenic` mark the
/// pathogenic class, `benign` / `likely_benign` the benign class. Any
/// disqualifying term (low penetrance, uncertain significance, uncertain risk
/// allele, any `conflicting_*`) excludes the variant. Other terms
/// (`risk_factor`, `drug_response`, `association`, ...) are secondary
/// annotations and ignored. A variant is labelled only when exactly one class
/// is present and nothing disqualifies it.
pub fn derive_label(clnsig: &str) -> LabelClass {
    let terms: Vec<String> = clnsig
        .split([',', '|', '/'])
        .map(|t| t.trim().trim_matches('_').to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    let disqualified = terms
        .iter()
        .any(|t| DISQUALIFYING_TERMS.contains(&t.as_str()) || t.starts_with("conflicting"));
    let pathogenic = terms.iter().any(|t| PATHOGENIC_TERMS.contains(&t.as_str()));
    let benign = terms.iter().any(|t| BENIGN_TERMS.contains(&t.as_str()));

    match (disqualified, pathogenic, benign) {
        (false, true, false) => LabelClass::Pathogenic,
        (false, false, true) => LabelClass::Benign,
        _ => LabelClass::Excluded,
    }
}

pub struct ClinvarLabels {
    pub path: PathBuf,
}

impl Source for ClinvarLabels {
    type Output = HashMap<VariantKey, ClinvarRecord>;

    fn load(&self) -> Result<Self::Output> {
        info!("Reading ClinVar labels from {}", self.path.display());
        let mut labels: HashMap<VariantKey, ClinvarRecord> = HashMap::new();
        let mut data_lines = 0usize;
        let mut without_clnsig = 0usize;
        let mut duplicates = 0usize;

        for site in VcfReader::open(&self.path, "CLNSIG")? {
            data_lines += 1;
            // unusable lines are logged by the reader
            let Some(site) = site? else { continue };
            let Some(clnsig) = site.info.filter(|v| !v.is_empty()).map(|v| v.join(",")) else {
                without_clnsig += 1;
                continue;
            };

            let class = derive_label(&clnsig);
            for alt in &site.alternates {
                let key = VariantKey::new(&site.chrom, site.pos, &site.reference, alt);
                if labels.contains_key(&key) {
                    duplicates += 1;
                    continue;
                }
                labels.insert(
                    key,
                    ClinvarRecord {
                        clinical_significance: clnsig.clone(),
                        class,
                    },
                );
            }
        }

        info!(
            "Read {} ClinVar records: {} keyed labels, {} without CLNSIG, {} duplicate keys ignored",
            data_lines,
            labels.len(),
            without_clnsig,
            duplicates
        );
        Ok(labels)
    }
}
