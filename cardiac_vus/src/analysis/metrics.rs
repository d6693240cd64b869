use serde::{Deserialize, Serialize};

use crate::analysis::roc::{average_precision, roc_auc};

/// Held-out evaluation of a trained classifier. Key names follow the
/// metrics file consumed downstream (`ROC_AUC`, `PR_AUC`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub model_type: String,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    #[serde(rename = "ROC_AUC")]
    pub roc_auc: Option<f64>,
    #[serde(rename = "PR_AUC")]
    pub pr_auc: Option<f64>,
    pub threshold: f64,
    pub tp: usize,
    pub fp: usize,
    pub tn: usize,
    #[serde(rename = "fn")]
    pub false_negatives: usize,
    pub n_train: usize,
    pub n_test: usize,
    pub features: Vec<String>,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Confusion {
    pub tp: usize,
    pub fp: usize,
    pub tn: usize,
    pub fn_: usize,
}

impl Confusion {
    pub fn at_threshold(actual: &[u8], probabilities: &[f64], threshold: f64) -> Self {
        let mut c = Confusion::default();
        for (&p, &lab) in probabilities.iter().zip(actual) {
            match (p >= threshold, lab == 1) {
                (true, true) => c.tp += 1,
                (true, false) => c.fp += 1,
                (false, true) => c.fn_ += 1,
                (false, false) => c.tn += 1,
            }
        }
        c
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.tp + self.tn + self.fp + self.fn_)
    }

    /// 0 when nothing is predicted positive.
    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

pub struct EvaluationContext<'a> {
    pub model_type: &'a str,
    pub n_train: usize,
    pub features: Vec<String>,
    pub fallback_used: bool,
    pub threshold: f64,
}

pub fn evaluate(actual: &[u8], probabilities: &[f64], ctx: EvaluationContext<'_>) -> Metrics {
    let confusion = Confusion::at_threshold(actual, probabilities, ctx.threshold);
    Metrics {
        model_type: ctx.model_type.to_string(),
        accuracy: confusion.accuracy(),
        precision: confusion.precision(),
        recall: confusion.recall(),
        roc_auc: roc_auc(actual, probabilities),
        pr_auc: average_precision(actual, probabilities),
        threshold: ctx.threshold,
        tp: confusion.tp,
        fp: confusion.fp,
        tn: confusion.tn,
        false_negatives: confusion.fn_,
        n_train: ctx.n_train,
        n_test: actual.len(),
        features: ctx.features,
        fallback_used: ctx.fallback_used,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confusion_counts_and_keys() {
        let metrics = evaluate(
            &[1, 1, 0, 0, 1],
            &[0.9, 0.4, 0.6, 0.1, 0.5],
            EvaluationContext {
                model_type: "boosted_trees",
                n_train: 15,
                features: vec!["impact".to_string()],
                fallback_used: false,
                threshold: 0.5,
            },
        );
        assert_eq!((metrics.tp, metrics.fp, metrics.tn, metrics.false_negatives), (2, 1, 1, 1));
        assert!((metrics.accuracy - 0.6).abs() < 1e-12);
        assert!((metrics.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((metrics.recall - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(metrics.n_test, 5);

        let json = serde_json::to_value(&metrics).unwrap();
        assert!(json.get("ROC_AUC").is_some());
        assert!(json.get("PR_AUC").is_some());
        assert_eq!(json["fn"], 1);
        assert_eq!(json["model_type"], "boosted_trees");
    }

    #[test]
    fn no_positive_predictions_gives_zero_precision() {
        let c = Confusion::at_threshold(&[1, 0], &[0.2, 0.1], 0.5);
        assert_eq!(c.precision(), 0.0);
        assert_eq!(c.recall(), 0.0);
    }
}
