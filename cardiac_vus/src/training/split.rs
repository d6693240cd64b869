use std::path::Path;

use log::info;
use polars::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::dataset::LabeledDataset;
use crate::error::{PipelineError, Result};
use crate::features::add_key_columns;
use crate::helper_functions::dataframe_to_csv;

/// Row indices into the dataset, each side in ascending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

impl Split {
    pub fn is_test(&self, row: usize) -> bool {
        self.test.binary_search(&row).is_ok()
    }
}

/// Stratified by label: each class is shuffled with the seeded generator
/// (benign first, then pathogenic) and `round(n · test_fraction)` of its
/// rows, clamped to `1..n-1`, go to the test side.
pub fn stratified_split(labels: &[u8], test_fraction: f64, seed: u64) -> Result<Split> {
    if !(test_fraction > 0.0 && test_fraction < 1.0) {
        return Err(PipelineError::Config(format!(
            "test fraction must lie strictly between 0 and 1, got {test_fraction}"
        )));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();
    for class in [0u8, 1] {
        let mut members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|&(_, &l)| l == class)
            .map(|(i, _)| i)
            .collect();
        let n = members.len();
        if n < 2 {
            return Err(PipelineError::InsufficientTrainingData(format!(
                "class {} has {} row(s); a stratified split needs at least 2",
                class, n
            )));
        }
        members.shuffle(&mut rng);
        let n_test = ((n as f64 * test_fraction).round() as usize).clamp(1, n - 1);
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    info!("Stratified split: {} train / {} test rows", train.len(), test.len());
    Ok(Split { train, test })
}

/// `chrom,pos,ref,alt,split` for every dataset row, in dataset order.
pub fn write_split(dataset: &LabeledDataset, split: &Split, path: &Path) -> Result<()> {
    let mut df = DataFrame::default();
    add_key_columns(&mut df, dataset.rows.iter().map(|r| &r.row.key))?;
    let sides: Vec<&str> = (0..dataset.len())
        .map(|i| if split.is_test(i) { "test" } else { "train" })
        .collect();
    df.with_column(Series::new(PlSmallStr::from("split"), sides))?;
    dataframe_to_csv(&mut df, path)
}
