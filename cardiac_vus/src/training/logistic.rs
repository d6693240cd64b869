//! Standardised L2 logistic regression baseline.

use linfa::prelude::*;
use linfa_logistic::LogisticRegression;
use log::info;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogisticParams {
    pub l2: f64,
    pub max_iterations: u64,
}

impl Default for LogisticParams {
    fn default() -> Self {
        LogisticParams {
            l2: 1.0,
            max_iterations: 100,
        }
    }
}

/// Coefficients live on z-scored features; `means` / `stds` are the
/// training-set statistics (ddof = 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl LogisticModel {
    pub fn standardise(&self, j: usize, value: f64) -> f64 {
        (value - self.means[j]) / self.stds[j]
    }

    /// Per-feature terms `β_j · z_j`.
    pub fn contributions(&self, row: &[f64]) -> Vec<f64> {
        self.coefficients
            .iter()
            .enumerate()
            .map(|(j, beta)| beta * self.standardise(j, row[j]))
            .collect()
    }

    pub fn raw_score(&self, row: &[f64]) -> f64 {
        self.intercept + self.contributions(row).iter().sum::<f64>()
    }
}

fn column_stats(x: &Array2<f64>) -> (Vec<f64>, Vec<f64>) {
    let mut means = Vec::with_capacity(x.ncols());
    let mut stds = Vec::with_capacity(x.ncols());
    for col in x.axis_iter(Axis(1)) {
        let mean = col.mean().unwrap_or(0.0);
        let std = if col.len() > 1 { col.var(1.0).sqrt() } else { 0.0 };
        means.push(mean);
        stds.push(std.max(1e-9));
    }
    (means, stds)
}

pub fn fit_logistic(x: &Array2<f64>, y: &Array1<u8>, params: &LogisticParams) -> Result<LogisticModel> {
    let (means, stds) = column_stats(x);
    info!("=== Logistic standardisation parameters ===");
    for (j, (mean, std)) in means.iter().zip(&stds).enumerate() {
        info!("feature {:<3} μ = {:>12.6},  σ = {:>12.6}", j, mean, std);
    }

    let mut z = x.clone();
    for (j, mut col) in z.axis_iter_mut(Axis(1)).enumerate() {
        col.mapv_inplace(|v| (v - means[j]) / stds[j]);
    }

    let model = LogisticRegression::default()
        .max_iterations(params.max_iterations)
        .gradient_tolerance(1e-6)
        .alpha(params.l2)
        .fit(&Dataset::new(z.clone(), y.clone()))
        .map_err(|e| PipelineError::Fit(format!("logistic regression: {e}")))?;

    let mut fitted = LogisticModel {
        intercept: model.intercept(),
        coefficients: model.params().to_vec(),
        means,
        stds,
    };

    // linfa picks its own positive class; orient the coefficients so the
    // score is the log-odds of label 1.
    let probabilities = model.predict_probabilities(&z);
    let predicted: Array1<u8> = model.predict(&z);
    let flipped = probabilities
        .iter()
        .zip(predicted.iter())
        .find(|(p, _)| (**p - 0.5).abs() > 1e-9)
        .map_or(false, |(p, label)| (*p > 0.5) != (*label == 1));
    if flipped {
        fitted.intercept = -fitted.intercept;
        fitted.coefficients.iter_mut().for_each(|b| *b = -*b);
    }
    Ok(fitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn score_increases_with_the_pathogenic_signal() {
        let x = array![
            [0.0, 1.0],
            [0.5, 0.0],
            [1.0, 1.0],
            [1.5, 0.0],
            [3.0, 1.0],
            [3.5, 0.0],
            [4.0, 1.0],
            [4.5, 0.0]
        ];
        let y = array![0u8, 0, 0, 0, 1, 1, 1, 1];
        let model = fit_logistic(&x, &y, &LogisticParams::default()).unwrap();
        assert!(model.coefficients[0] > 0.0);
        assert!(model.raw_score(&[4.5, 0.0]) > model.raw_score(&[0.0, 0.0]));

        let row = [3.0, 1.0];
        let total = model.intercept + model.contributions(&row).iter().sum::<f64>();
        assert!((total - model.raw_score(&row)).abs() < 1e-12);
    }

    #[test]
    fn constant_columns_do_not_divide_by_zero() {
        let x = array![[1.0, 7.0], [2.0, 7.0], [3.0, 7.0]];
        let (means, stds) = column_stats(&x);
        assert_eq!(means[1], 7.0);
        assert!(stds[1] >= 1e-9);
    }
}
