pub mod clinvar;
pub mod expression;
pub mod gene_panel;
pub mod gtex;
pub mod vcf;
pub mod vep_annotations;

use crate::error::Result;

/// An input file (or file bundle) produced by an upstream collaborator.
pub trait Source {
    type Output;

    fn load(&self) -> Result<Self::Output>;
}
