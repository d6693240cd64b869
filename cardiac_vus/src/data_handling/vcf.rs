//! Record-level VCF reading on `noodles-vcf`, shared by the VEP and ClinVar
//! loaders. Each site carries the fixed columns plus the values of a single
//! INFO key; what those values mean is up to the caller.

use std::borrow::Cow;
use std::io::{self, BufRead, Read};
use std::path::{Path, PathBuf};

use noodles_vcf as vcf;
use noodles_vcf::variant::record::info::field::{value::Array, Value};
use noodles_vcf::variant::record::{AlternateBases as _, Info as _};
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::helper_functions::open_text;

/// One VCF data line.
#[derive(Debug, Clone, PartialEq)]
pub struct VcfSite {
    pub chrom: String,
    pub pos: u64,
    pub id: String,
    pub reference: String,
    /// Empty and `.` alleles removed.
    pub alternates: Vec<String>,
    /// Values of the requested INFO key, `None` when the key is absent.
    pub info: Option<Vec<String>>,
}

pub struct VcfReader {
    path: PathBuf,
    reader: vcf::io::Reader<Box<dyn BufRead>>,
    header: vcf::Header,
    info_key: &'static str,
    record: vcf::Record,
}

/// Header lines noodles rejects (annotation dumps carry a few) are skipped
/// with a warning instead of failing the whole file.
fn parse_header(path: &Path, raw: &str) -> Result<vcf::Header> {
    let mut parser = vcf::header::Parser::default();
    let mut rejected = 0usize;
    for line in raw.lines() {
        if let Err(e) = parser.parse_partial(line.as_bytes()) {
            debug!("VCF header line skipped ({}): {}", e, line);
            rejected += 1;
        }
    }
    if rejected > 0 {
        warn!("{} header lines of {} could not be parsed and were ignored", rejected, path.display());
    }
    parser
        .finish()
        .map_err(|e| PipelineError::malformed(path, format!("invalid VCF header: {e}")))
}

fn info_values(value: Option<Value<'_>>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.into_owned()],
        Some(Value::Array(Array::String(values))) => values
            .iter()
            .filter_map(|v| v.ok().flatten())
            .map(Cow::into_owned)
            .collect(),
        _ => Vec::new(),
    }
}

impl VcfReader {
    pub fn open(path: &Path, info_key: &'static str) -> Result<Self> {
        let unreadable = |source| PipelineError::Unreadable {
            path: path.to_path_buf(),
            source,
        };
        let mut reader = vcf::io::Reader::new(open_text(path)?);
        let mut raw = String::new();
        reader.header_reader().read_to_string(&mut raw).map_err(unreadable)?;
        let header = parse_header(path, &raw)?;
        Ok(VcfReader {
            path: path.to_path_buf(),
            reader,
            header,
            info_key,
            record: vcf::Record::default(),
        })
    }

    pub fn header(&self) -> &vcf::Header {
        &self.header
    }

    /// The current record as a site, `None` when its position is unusable.
    fn site(&self) -> Option<VcfSite> {
        let record = &self.record;
        let pos = match record.variant_start() {
            Some(Ok(p)) => usize::from(p) as u64,
            _ => {
                debug!("VCF record at {} with bad position skipped", record.reference_sequence_name());
                return None;
            }
        };
        let alternates = record
            .alternate_bases()
            .iter()
            .filter_map(|a| a.ok())
            .filter(|a| !a.is_empty() && *a != ".")
            .map(str::to_string)
            .collect();
        let info = match record.info().get(&self.header, self.info_key) {
            None => None,
            Some(Ok(value)) => Some(info_values(value)),
            Some(Err(e)) => {
                debug!("unreadable {} value at {}:{}: {}", self.info_key, record.reference_sequence_name(), pos, e);
                None
            }
        };
        Some(VcfSite {
            chrom: record.reference_sequence_name().to_string(),
            pos,
            id: record.ids().as_ref().to_string(),
            reference: record.reference_bases().to_string(),
            alternates,
            info,
        })
    }
}

/// `Ok(None)` is a data line that could not be used; the caller counts it.
impl Iterator for VcfReader {
    type Item = Result<Option<VcfSite>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.read_record(&mut self.record) {
            Ok(0) => None,
            Ok(_) => Some(Ok(self.site())),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                debug!("malformed VCF line skipped: {}", e);
                Some(Ok(None))
            }
            Err(source) => Some(Err(PipelineError::Unreadable {
                path: self.path.clone(),
                source,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("t.vcf");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn sites_carry_fixed_columns_and_info_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "##fileformat=VCFv4.2\n\
             ##INFO=<ID=NOTE,Number=.,Type=String,Description=\"x\">\n\
             #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n\
             chr1\t100\trs7\tA\tG,T\t.\t.\tDP=3;NOTE=a,b\n\
             2\t200\t.\tC\t.\t.\t.\tDP=1\n",
        );
        let sites: Vec<VcfSite> = VcfReader::open(&path, "NOTE")
            .unwrap()
            .map(|s| s.unwrap().unwrap())
            .collect();
        assert_eq!(sites.len(), 2);
        assert_eq!(sites[0].chrom, "chr1");
        assert_eq!(sites[0].pos, 100);
        assert_eq!(sites[0].id, "rs7");
        assert_eq!(sites[0].alternates, vec!["G", "T"]);
        assert_eq!(sites[0].info, Some(vec!["a".to_string(), "b".to_string()]));
        assert!(sites[1].alternates.is_empty());
        assert_eq!(sites[1].info, None);
    }

    #[test]
    fn rejected_header_lines_do_not_fail_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "##fileformat=VCFv4.1\n\
             ##ID=<Description=\"ClinVar Variation ID\">\n\
             #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n\
             1\t5\t.\tA\tC\t.\t.\tCLNSIG=Benign\n",
        );
        let mut reader = VcfReader::open(&path, "CLNSIG").unwrap();
        let site = reader.next().unwrap().unwrap().unwrap();
        assert_eq!(site.info, Some(vec!["Benign".to_string()]));
        assert!(reader.next().is_none());
    }

    #[test]
    fn short_lines_are_skipped_and_reading_continues() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "##fileformat=VCFv4.2\n\
             #CHROM\tPOS\tID\tREF\tALT\tQUAL\tFILTER\tINFO\n\
             1\t5\t.\tA\n\
             1\t6\t.\tA\tC\t.\t.\t.\n",
        );
        let items: Vec<Option<VcfSite>> = VcfReader::open(&path, "X").unwrap().map(|s| s.unwrap()).collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_none());
        assert_eq!(items[1].as_ref().map(|s| s.pos), Some(6));
    }

    #[test]
    fn missing_file_is_unreadable() {
        let err = VcfReader::open(Path::new("/definitely/not/here.vcf"), "CSQ").err().unwrap();
        assert!(matches!(err, PipelineError::Unreadable { .. }));
    }
}
