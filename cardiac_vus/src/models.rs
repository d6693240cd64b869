use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Bumped whenever `FEATURE_COLUMNS` changes meaning or order.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Sentinel written for a missing numeric score. Chosen outside the range of
/// every score we encode (GERP and phyloP go negative, but not this far).
pub const MISSING_VALUE: f64 = -999.0;

/// Descriptive columns written in front of the feature vector.
pub const KEY_COLUMNS: [&str; 4] = ["chrom", "pos", "ref", "alt"];
pub const GENE_COLUMN: &str = "gene";
pub const CONSEQUENCE_COLUMN: &str = "consequence";
pub const LABEL_COLUMN: &str = "label";
pub const CLNSIG_COLUMN: &str = "clinical_significance";

/// Model input columns, in vector order.
pub const FEATURE_COLUMNS: [&str; 19] = [
    "csq_missense",
    "csq_nonsense",
    "csq_frameshift",
    "csq_other",
    "csq_unknown",
    "impact",
    "sift_pred",
    "polyphen2_hvar_pred",
    "polyphen2_hdiv_pred",
    "gnomad_af",
    "gnomad_af_missing",
    "gerp_rs",
    "gerp_rs_missing",
    "phylop100way",
    "phylop100way_missing",
    "heart_lv_tpm",
    "heart_lv_tpm_missing",
    "heart_aa_tpm",
    "heart_aa_tpm_missing",
];

pub const N_FEATURES: usize = FEATURE_COLUMNS.len();

pub fn feature_names() -> Vec<String> {
    FEATURE_COLUMNS.iter().map(|s| s.to_string()).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Variant key
// ─────────────────────────────────────────────────────────────────────────────

/// (chromosome, position, ref, alt). Chromosome is stored without the `chr`
/// prefix and with `M` spelled `MT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariantKey {
    pub chrom: String,
    pub pos: u64,
    pub reference: String,
    pub alternate: String,
}

impl VariantKey {
    pub fn new(chrom: &str, pos: u64, reference: &str, alternate: &str) -> Self {
        VariantKey {
            chrom: normalize_chrom(chrom),
            pos,
            reference: reference.to_string(),
            alternate: alternate.to_string(),
        }
    }
}

pub fn normalize_chrom(raw: &str) -> String {
    let trimmed = raw.trim();
    let bare = trimmed.strip_prefix("chr").unwrap_or(trimmed);
    match bare {
        "M" | "m" | "Mt" | "mt" => "MT".to_string(),
        other => other.to_string(),
    }
}

/// Autosomes numerically, then X, Y, MT, then anything else by name.
fn chrom_rank(chrom: &str) -> (u8, u32) {
    if let Ok(n) = chrom.parse::<u32>() {
        return (0, n);
    }
    match chrom {
        "X" => (1, 0),
        "Y" => (2, 0),
        "MT" => (3, 0),
        _ => (4, 0),
    }
}

impl Ord for VariantKey {
    fn cmp(&self, other: &Self) -> Ordering {
        chrom_rank(&self.chrom)
            .cmp(&chrom_rank(&other.chrom))
            .then_with(|| self.chrom.cmp(&other.chrom))
            .then_with(|| self.pos.cmp(&other.pos))
            .then_with(|| self.reference.cmp(&other.reference))
            .then_with(|| self.alternate.cmp(&other.alternate))
    }
}

impl PartialOrd for VariantKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.chrom, self.pos, self.reference, self.alternate)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Categorical vocabularies
// ─────────────────────────────────────────────────────────────────────────────

/// Molecular consequence bucket. Variants are ordered by severity so that
/// `max` implements worst-consequence-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Consequence {
    Unknown,
    Other,
    Missense,
    Frameshift,
    Nonsense,
}

/// Sequence Ontology terms VEP emits that we recognise but do not single out.
const OTHER_SO_TERMS: &[&str] = &[
    "transcript_ablation",
    "splice_acceptor_variant",
    "splice_donor_variant",
    "stop_lost",
    "start_lost",
    "transcript_amplification",
    "feature_elongation",
    "feature_truncation",
    "inframe_insertion",
    "inframe_deletion",
    "protein_altering_variant",
    "splice_donor_5th_base_variant",
    "splice_region_variant",
    "splice_donor_region_variant",
    "splice_polypyrimidine_tract_variant",
    "incomplete_terminal_codon_variant",
    "start_retained_variant",
    "stop_retained_variant",
    "synonymous_variant",
    "coding_sequence_variant",
    "mature_miRNA_variant",
    "5_prime_UTR_variant",
    "3_prime_UTR_variant",
    "non_coding_transcript_exon_variant",
    "intron_variant",
    "NMD_transcript_variant",
    "non_coding_transcript_variant",
    "coding_transcript_variant",
    "upstream_gene_variant",
    "downstream_gene_variant",
    "TFBS_ablation",
    "TFBS_amplification",
    "TF_binding_site_variant",
    "regulatory_region_ablation",
    "regulatory_region_amplification",
    "regulatory_region_variant",
    "intergenic_variant",
    "sequence_variant",
];

impl Consequence {
    pub fn from_term(term: &str) -> Self {
        match term.trim() {
            "stop_gained" => Consequence::Nonsense,
            "frameshift_variant" => Consequence::Frameshift,
            "missense_variant" => Consequence::Missense,
            t if OTHER_SO_TERMS.contains(&t) => Consequence::Other,
            _ => Consequence::Unknown,
        }
    }

    /// Reduce a VEP `&`-joined consequence list to its most severe term.
    pub fn worst_of(field: &str) -> Self {
        field
            .split('&')
            .map(Consequence::from_term)
            .max()
            .unwrap_or(Consequence::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Consequence::Unknown => "unknown",
            Consequence::Other => "other",
            Consequence::Missense => "missense",
            Consequence::Frameshift => "frameshift",
            Consequence::Nonsense => "nonsense",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "unknown" => Some(Consequence::Unknown),
            "other" => Some(Consequence::Other),
            "missense" => Some(Consequence::Missense),
            "frameshift" => Some(Consequence::Frameshift),
            "nonsense" => Some(Consequence::Nonsense),
            _ => None,
        }
    }

    /// One-hot block in `csq_missense .. csq_unknown` order.
    pub fn one_hot(&self) -> [f64; 5] {
        let mut out = [0.0; 5];
        let slot = match self {
            Consequence::Missense => 0,
            Consequence::Nonsense => 1,
            Consequence::Frameshift => 2,
            Consequence::Other => 3,
            Consequence::Unknown => 4,
        };
        out[slot] = 1.0;
        out
    }
}

impl fmt::Display for Consequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// VEP IMPACT class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Impact {
    High,
    Moderate,
    Low,
    Modifier,
    Unknown,
}

impl Impact {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Impact::High,
            "MODERATE" => Impact::Moderate,
            "LOW" => Impact::Low,
            "MODIFIER" => Impact::Modifier,
            _ => Impact::Unknown,
        }
    }

    pub fn code(&self) -> f64 {
        match self {
            Impact::High => 3.0,
            Impact::Moderate => 2.0,
            Impact::Low => 1.0,
            Impact::Modifier => 0.0,
            Impact::Unknown => -1.0,
        }
    }
}

/// One functional-impact predictor call (dbNSFP letter codes).
/// Ordered so that `max` is the most damaging call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PredictorCall {
    Unknown,
    Tolerated,
    PossiblyDamaging,
    Damaging,
}

impl PredictorCall {
    pub fn from_code(code: &str) -> Self {
        match code.trim() {
            // SIFT deleterious, PolyPhen probably damaging, MutationTaster disease causing (automatic)
            "D" | "A" => PredictorCall::Damaging,
            "P" => PredictorCall::PossiblyDamaging,
            "T" | "B" | "N" => PredictorCall::Tolerated,
            _ => PredictorCall::Unknown,
        }
    }

    /// dbNSFP fields carry one call per transcript, `&`- or `;`-joined.
    pub fn most_damaging(field: &str) -> Self {
        field
            .split(['&', ';', ','])
            .map(PredictorCall::from_code)
            .max()
            .unwrap_or(PredictorCall::Unknown)
    }

    pub fn code(&self) -> f64 {
        match self {
            PredictorCall::Damaging => 2.0,
            PredictorCall::PossiblyDamaging => 1.0,
            PredictorCall::Tolerated => 0.0,
            PredictorCall::Unknown => -1.0,
        }
    }
}

/// Training label bucket derived from a ClinVar CLNSIG string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelClass {
    Pathogenic,
    Benign,
    Excluded,
}

impl LabelClass {
    pub fn as_label(&self) -> Option<u8> {
        match self {
            LabelClass::Pathogenic => Some(1),
            LabelClass::Benign => Some(0),
            LabelClass::Excluded => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Rows
// ─────────────────────────────────────────────────────────────────────────────

/// One variant's encoded features; `features` follows `FEATURE_COLUMNS`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub key: VariantKey,
    pub gene: String,
    pub consequence: Consequence,
    pub features: Vec<f64>,
}

impl FeatureRow {
    pub fn feature(&self, name: &str) -> Option<f64> {
        FEATURE_COLUMNS
            .iter()
            .position(|c| *c == name)
            .and_then(|i| self.features.get(i).copied())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledRow {
    pub row: FeatureRow,
    pub label: u8,
    pub clinical_significance: String,
}
