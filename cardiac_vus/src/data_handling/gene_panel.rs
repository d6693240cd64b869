use std::io::Write;
use std::path::Path;

use tracing::info;

use crate::error::Result;
use crate::helper_functions::write_atomic;
use crate::models::normalize_chrom;

/// A panel gene and its GRCh38 span. `start` is 0-based and `end` exclusive,
/// as in BED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PanelGene {
    pub symbol: &'static str,
    pub chrom: &'static str,
    pub start: u64,
    pub end: u64,
}

impl PanelGene {
    /// `pos` is a 1-based VCF position.
    pub fn contains(&self, chrom: &str, pos: u64) -> bool {
        self.chrom == chrom && pos > self.start && pos <= self.end
    }
}

/// Rough gene spans, not canonical transcripts.
pub const GENE_PANEL: [PanelGene; 6] = [
    PanelGene { symbol: "MYH7", chrom: "14", start: 23872933, end: 23904751 },
    PanelGene { symbol: "MYBPC3", chrom: "11", start: 47317013, end: 47363695 },
    PanelGene { symbol: "TNNT2", chrom: "1", start: 201359228, end: 201378015 },
    PanelGene { symbol: "TTN", chrom: "2", start: 178525989, end: 178807423 },
    PanelGene { symbol: "SCN5A", chrom: "3", start: 38589545, end: 38691305 },
    PanelGene { symbol: "KCNQ1", chrom: "11", start: 2589737, end: 2817649 },
];

pub fn is_panel_gene(symbol: &str) -> bool {
    GENE_PANEL.iter().any(|g| g.symbol == symbol)
}

pub fn gene_at(chrom: &str, pos: u64) -> Option<&'static PanelGene> {
    let chrom = normalize_chrom(chrom);
    GENE_PANEL.iter().find(|g| g.contains(&chrom, pos))
}

pub fn panel_symbols() -> Vec<&'static str> {
    GENE_PANEL.iter().map(|g| g.symbol).collect()
}

/// Write the panel as `chrom start end gene`, one interval per line.
pub fn write_bed(path: &Path) -> Result<usize> {
    write_atomic(path, |file| {
        for gene in &GENE_PANEL {
            writeln!(file, "{}\t{}\t{}\t{}", gene.chrom, gene.start, gene.end, gene.symbol)?;
        }
        Ok(())
    })?;
    info!("Wrote {} intervals to {}", GENE_PANEL.len(), path.display());
    Ok(GENE_PANEL.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_resolve_to_panel_genes() {
        assert_eq!(gene_at("chr11", 2600000).map(|g| g.symbol), Some("KCNQ1"));
        assert_eq!(gene_at("14", 23872934).map(|g| g.symbol), Some("MYH7"));
        // BED start is exclusive for 1-based positions
        assert_eq!(gene_at("14", 23872933), None);
        assert_eq!(gene_at("7", 100), None);
    }

    #[test]
    fn bed_has_one_line_per_gene() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("panel.bed");
        assert_eq!(write_bed(&path).unwrap(), 6);
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 6);
        assert!(text.starts_with("14\t23872933\t23904751\tMYH7\n"));
    }
}
