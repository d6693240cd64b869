//! VEP-annotated VCF reader.
//!
//! Only the fixed VCF columns and the `CSQ` INFO field are interpreted, the
//! CSQ layout coming from the header's `Format:` description. For
//! every alternate allele one CSQ block is retained: the first block flagged
//! `CANONICAL=YES`, otherwise the first block for that allele.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{info, warn};

use crate::data_handling::vcf::{VcfReader, VcfSite};
use crate::data_handling::Source;
use crate::error::{PipelineError, Result};
use crate::models::VariantKey;

const CSQ_FORMAT_EXAMPLE: &str =
    "##INFO=<ID=CSQ,...,Description=\"... Format: Allele|Consequence|IMPACT|SYMBOL|...\">";

static CSQ_FORMAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"Format:\s*([^"]*)"#).expect("csq format regex"));

/// Field layout of the CSQ blocks, from the VCF header.
#[derive(Debug, Clone, PartialEq)]
pub struct CsqHeader {
    fields: Vec<String>,
}

impl CsqHeader {
    pub fn parse(line: &str) -> Option<Self> {
        let format = CSQ_FORMAT_RE.captures(line)?.get(1)?.as_str();
        let fields: Vec<String> = format
            .trim()
            .split('|')
            .map(|f| f.trim().to_string())
            .collect();
        if fields.iter().all(|f| f.is_empty()) {
            return None;
        }
        Some(CsqHeader { fields })
    }

    pub fn index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }
}

/// One (variant, allele) with its selected CSQ block.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedVariant {
    pub key: VariantKey,
    pub id: String,
    pub block: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AnnotatedVcf {
    pub header: CsqHeader,
    pub variants: Vec<AnnotatedVariant>,
    /// Data lines without a usable CSQ annotation.
    pub skipped_records: usize,
}

impl AnnotatedVcf {
    /// Value of a CSQ field for a variant; empty and `.` read as absent.
    pub fn field<'a>(&self, variant: &'a AnnotatedVariant, name: &str) -> Option<&'a str> {
        let idx = self.header.index(name)?;
        variant
            .block
            .get(idx)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty() && *s != ".")
    }

    /// First of several alias field names that carries a value.
    pub fn first_field<'a>(&self, variant: &'a AnnotatedVariant, names: &[&str]) -> Option<&'a str> {
        names.iter().find_map(|n| self.field(variant, n))
    }
}

pub struct VepAnnotations {
    pub path: PathBuf,
}

impl Source for VepAnnotations {
    type Output = AnnotatedVcf;

    fn load(&self) -> Result<AnnotatedVcf> {
        info!("Reading VEP annotations from {}", self.path.display());
        let sites = VcfReader::open(&self.path, "CSQ")?;
        let header = sites
            .header()
            .infos()
            .get("CSQ")
            .and_then(|csq| CsqHeader::parse(csq.description()));
        let header = self.check_header(header)?;

        let mut variants = Vec::new();
        let mut skipped = 0usize;
        for site in sites {
            match site?.and_then(|s| annotate(&s, &header)) {
                Some(parsed) if !parsed.is_empty() => variants.extend(parsed),
                _ => skipped += 1,
            }
        }

        if skipped > 0 {
            warn!("{} VCF records had no usable CSQ annotation and were skipped", skipped);
        }
        info!("Parsed {} annotated alleles", variants.len());

        Ok(AnnotatedVcf {
            header,
            variants,
            skipped_records: skipped,
        })
    }
}

impl VepAnnotations {
    fn missing_csq(&self) -> PipelineError {
        PipelineError::MissingColumns {
            path: self.path.clone(),
            missing: vec!["CSQ".to_string()],
            expected: CSQ_FORMAT_EXAMPLE.to_string(),
        }
    }

    fn check_header(&self, header: Option<CsqHeader>) -> Result<CsqHeader> {
        let header = header.ok_or_else(|| self.missing_csq())?;
        if header.index("Consequence").is_none() {
            return Err(PipelineError::MissingColumns {
                path: self.path.clone(),
                missing: vec!["CSQ:Consequence".to_string()],
                expected: CSQ_FORMAT_EXAMPLE.to_string(),
            });
        }
        Ok(header)
    }
}

/// VEP writes indel alleles without the shared leading base (`-` when
/// nothing is left).
fn vep_allele(alt: &str, trim: bool) -> String {
    if !trim {
        return alt.to_string();
    }
    let rest = &alt[1.min(alt.len())..];
    if rest.is_empty() {
        "-".to_string()
    } else {
        rest.to_string()
    }
}

fn shares_first_base(reference: &str, alts: &[&str]) -> bool {
    let Some(first) = reference.chars().next() else {
        return false;
    };
    let any_indel = alts.iter().any(|a| a.len() != reference.len());
    any_indel && alts.iter().all(|a| a.starts_with(first))
}

/// One annotated variant per ALT allele of a site. `None` means the site
/// has no CSQ block matching the header layout.
fn annotate(site: &VcfSite, header: &CsqHeader) -> Option<Vec<AnnotatedVariant>> {
    // CSQ entries may still hold several comma-joined blocks when the header
    // declares the field with Number=1
    let blocks: Vec<Vec<String>> = site
        .info
        .as_ref()?
        .iter()
        .flat_map(|entry| entry.split(','))
        .map(|b| b.split('|').map(|v| v.to_string()).collect::<Vec<_>>())
        .filter(|b: &Vec<String>| b.len() == header.len())
        .collect();
    if blocks.is_empty() {
        return None;
    }

    let reference = site.reference.as_str();
    let alts: Vec<&str> = site.alternates.iter().map(String::as_str).collect();
    let trim = shares_first_base(reference, &alts);
    let allele_idx = header.index("Allele");
    let canonical_idx = header.index("CANONICAL");

    let variants = alts
        .iter()
        .filter_map(|a| {
            let repr = vep_allele(a, trim);
            let for_allele: Vec<&Vec<String>> = match allele_idx {
                Some(i) => blocks.iter().filter(|b| b[i] == repr || b[i] == *a).collect(),
                None => blocks.iter().collect(),
            };
            // No allele match (unusual normalisation): fall back to all blocks.
            let candidates = if for_allele.is_empty() {
                blocks.iter().collect()
            } else {
                for_allele
            };
            let chosen = canonical_idx
                .and_then(|c| candidates.iter().find(|b| b[c] == "YES"))
                .or_else(|| candidates.first())?;
            Some(AnnotatedVariant {
                key: VariantKey::new(&site.chrom, site.pos, reference, a),
                id: site.id.clone(),
                block: (*chosen).clone(),
            })
        })
        .collect();
    Some(variants)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    pub(crate) const CSQ_FORMAT: &str = "Allele|Consequence|IMPACT|SYMBOL|CANONICAL|gnomADg_AF|SIFT_pred|Polyphen2_HVAR_pred|Polyphen2_HDIV_pred|GERP++_RS|phyloP100way_vertebrate";

    pub(crate) fn write_vcf(dir: &Path, name: &str, records: &[&str]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "##fileformat=VCFv4.2").unwrap();
        writeln!(
            f,
            "##INFO=<ID=CSQ,Number=.,Type=String,Description=\"Consequence annotations from Ensembl VEP. Format: {}\">",
            CSQ_FORMAT
        )
        .unwrap();
        writeln!(f, "#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO").unwrap();
        for r in records {
            writeln!(f, "{}", r).unwrap();
        }
        path
    }

    #[test]
    fn header_fields_are_parsed() {
        let line = format!("##INFO=<ID=CSQ,Number=.,Description=\"x. Format: {}\">", CSQ_FORMAT);
        let header = CsqHeader::parse(&line).unwrap();
        assert_eq!(header.len(), 11);
        assert_eq!(header.index("SYMBOL"), Some(3));
        assert_eq!(header.index("nope"), None);
    }

    #[test]
    fn canonical_block_wins_over_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vcf(
            dir.path(),
            "a.vcf",
            &["chr14\t23885000\trs1\tG\tA\t.\t.\tDP=3;CSQ=A|intron_variant|MODIFIER|MYH7|||||||,A|missense_variant|MODERATE|MYH7|YES|0.001|D|D|P|5.1|7.2"],
        );
        let vcf = VepAnnotations { path }.load().unwrap();
        assert_eq!(vcf.variants.len(), 1);
        let v = &vcf.variants[0];
        assert_eq!(v.key, VariantKey::new("14", 23885000, "G", "A"));
        assert_eq!(vcf.field(v, "Consequence"), Some("missense_variant"));
        assert_eq!(vcf.field(v, "SIFT_pred"), Some("D"));
    }

    #[test]
    fn multiallelic_records_split_per_allele() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vcf(
            dir.path(),
            "b.vcf",
            &["11\t2600000\t.\tC\tCA,T\t.\t.\tCSQ=CA|frameshift_variant|HIGH|KCNQ1|YES||||||,T|missense_variant|MODERATE|KCNQ1|YES||||||"],
        );
        let vcf = VepAnnotations { path }.load().unwrap();
        assert_eq!(vcf.variants.len(), 2);
        assert_eq!(vcf.field(&vcf.variants[0], "Consequence"), Some("frameshift_variant"));
        assert_eq!(vcf.variants[1].key.alternate, "T");
        assert_eq!(vcf.field(&vcf.variants[1], "Consequence"), Some("missense_variant"));
    }

    #[test]
    fn records_without_csq_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_vcf(dir.path(), "c.vcf", &["1\t100\t.\tA\tG\t.\t.\tDP=10", "1\tx\t.\tA\tG\t.\t.\tCSQ=G"]);
        let vcf = VepAnnotations { path }.load().unwrap();
        assert!(vcf.variants.is_empty());
        assert_eq!(vcf.skipped_records, 2);
    }

    #[test]
    fn multi_member_gzip_is_read_to_the_end() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let dir = tempfile::tempdir().unwrap();
        let plain = write_vcf(
            dir.path(),
            "plain.vcf",
            &[
                "14\t23885000\trs1\tG\tA\t.\t.\tCSQ=A|missense_variant|MODERATE|MYH7|YES||||||",
                "11\t2600000\trs2\tC\tT\t.\t.\tCSQ=T|synonymous_variant|LOW|KCNQ1|YES||||||",
            ],
        );
        let text = std::fs::read_to_string(&plain).unwrap();
        // split inside the records, the way bgzip cuts blocks
        let cut = text.find("rs2").unwrap();

        let path = dir.path().join("annotated.vcf.gz");
        let mut out = std::fs::File::create(&path).unwrap();
        for part in [&text[..cut], &text[cut..]] {
            let mut member = GzEncoder::new(Vec::new(), Compression::default());
            member.write_all(part.as_bytes()).unwrap();
            out.write_all(&member.finish().unwrap()).unwrap();
        }
        drop(out);

        let vcf = VepAnnotations { path }.load().unwrap();
        assert_eq!(vcf.skipped_records, 0);
        assert_eq!(vcf.variants.len(), 2);
        assert_eq!(vcf.variants[1].key, VariantKey::new("11", 2600000, "C", "T"));
        assert_eq!(vcf.field(&vcf.variants[1], "Consequence"), Some("synonymous_variant"));
    }

    #[test]
    fn missing_csq_header_is_a_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.vcf");
        std::fs::write(&path, "##fileformat=VCFv4.2\n#CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n").unwrap();
        let err = VepAnnotations { path }.load().unwrap_err();
        assert!(matches!(err, PipelineError::MissingColumns { .. }));
    }
}
