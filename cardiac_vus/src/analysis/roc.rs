use std::cmp::Ordering;
use std::error::Error;
use std::path::Path;

use plotters::prelude::*;
use tracing::info;

/// Labels paired with scores, highest score first. Equal scores stay
/// adjacent so threshold groups can be walked in one pass.
fn ranked(actual: &[u8], predicted: &[f64]) -> Vec<(f64, bool)> {
    let mut paired: Vec<(f64, bool)> = predicted
        .iter()
        .cloned()
        .zip(actual.iter().map(|&y| y == 1))
        .collect();
    paired.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));
    paired
}

/// Calculate ROC curve points (FPR and TPR), one point per distinct score.
/// Returns `None` when only one class is present.
pub fn calculate_roc(actual: &[u8], predicted: &[f64]) -> Option<(Vec<f64>, Vec<f64>)> {
    let positive_count = actual.iter().filter(|&&y| y == 1).count();
    let negative_count = actual.len() - positive_count;
    if positive_count == 0 || negative_count == 0 {
        return None;
    }

    let paired = ranked(actual, predicted);
    let mut fpr_values = vec![0.0];
    let mut tpr_values = vec![0.0];
    let (mut tp, mut fp) = (0usize, 0usize);

    for (i, &(score, is_positive)) in paired.iter().enumerate() {
        if is_positive {
            tp += 1;
        } else {
            fp += 1;
        }
        // tied scores form a single threshold
        let last_of_group = paired.get(i + 1).map_or(true, |next| next.0 != score);
        if last_of_group {
            fpr_values.push(fp as f64 / negative_count as f64);
            tpr_values.push(tp as f64 / positive_count as f64);
        }
    }
    Some((fpr_values, tpr_values))
}

/// Trapezoid area under a polyline given as paired coordinates, `x`
/// non-decreasing. Mismatched lengths or a single point enclose nothing.
pub fn curve_area(x: &[f64], y: &[f64]) -> f64 {
    if x.len() != y.len() {
        return 0.0;
    }
    let points: Vec<(f64, f64)> = x.iter().copied().zip(y.iter().copied()).collect();
    points
        .windows(2)
        .map(|pair| {
            let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
            (x1 - x0) * (y0 + y1) * 0.5
        })
        .sum()
}

pub fn roc_auc(actual: &[u8], predicted: &[f64]) -> Option<f64> {
    calculate_roc(actual, predicted).map(|(fpr, tpr)| curve_area(&fpr, &tpr))
}

/// Average precision: Σ (Rₖ − Rₖ₋₁) · Pₖ over distinct thresholds.
pub fn average_precision(actual: &[u8], predicted: &[f64]) -> Option<f64> {
    let positive_count = actual.iter().filter(|&&y| y == 1).count();
    if positive_count == 0 {
        return None;
    }

    let paired = ranked(actual, predicted);
    let (mut tp, mut fp) = (0usize, 0usize);
    let mut last_recall = 0.0;
    let mut ap = 0.0;
    for (i, &(score, is_positive)) in paired.iter().enumerate() {
        if is_positive {
            tp += 1;
        } else {
            fp += 1;
        }
        let last_of_group = paired.get(i + 1).map_or(true, |next| next.0 != score);
        if last_of_group {
            let recall = tp as f64 / positive_count as f64;
            let precision = tp as f64 / (tp + fp) as f64;
            ap += (recall - last_recall) * precision;
            last_recall = recall;
        }
    }
    Some(ap)
}

/// ROC curve of the held-out split with the chance diagonal.
pub fn draw_roc_plot(output_path: &Path, fpr: &[f64], tpr: &[f64], auc: f64, label: &str) -> Result<(), Box<dyn Error>> {
    let caption_font = ("sans-serif bold", 26);
    let axis_font = ("sans-serif", 22);
    let label_font = ("sans-serif bold", 18);
    let colour = RGBColor(0, 100, 0);

    let root = BitMapBackend::new(output_path, (900, 650)).into_drawing_area();
    root.fill(&WHITE)?;

    let mut chart = ChartBuilder::on(&root)
        .caption("Held-out ROC", caption_font)
        .margin(15)
        .x_label_area_size(50)
        .y_label_area_size(50)
        .build_cartesian_2d(0.0..1.0, 0.0..1.0)?;

    chart
        .configure_mesh()
        .x_desc("False Positive Rate")
        .y_desc("True Positive Rate")
        .axis_desc_style(axis_font)
        .label_style(label_font)
        .draw()?;

    chart
        .draw_series(LineSeries::new(
            fpr.iter().zip(tpr.iter()).map(|(&x, &y)| (x, y)),
            colour.stroke_width(3),
        ))?
        .label(format!("{label} (AUC = {auc:.3})"))
        .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 25, y)], colour.stroke_width(3)));

    chart
        .draw_series(LineSeries::new(
            vec![(0.0, 0.0), (1.0, 1.0)],
            BLACK.mix(0.2).stroke_width(2),
        ))?
        .label("Random (AUC = 0.50)")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 25, y)], BLACK.mix(0.2).stroke_width(3)));

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(&BLACK)
        .label_font(label_font)
        .legend_area_size(25)
        .position(SeriesLabelPosition::LowerRight)
        .draw()?;

    root.present()?;
    info!("ROC curve saved to {}", output_path.display());
    Ok(())
}
