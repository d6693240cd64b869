use std::path::PathBuf;

use polars::prelude::PolarsError;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Every failure a stage can report. The first five variants are the
/// pipeline's own taxonomy; the rest wrap library errors.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Input artifact missing or unreadable.
    #[error("cannot read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Required columns (or header fields) are absent.
    #[error("{} is missing required column(s) {}; expected {expected}", path.display(), missing.join(", "))]
    MissingColumns {
        path: PathBuf,
        missing: Vec<String>,
        expected: String,
    },

    /// A value could not be parsed or violates its domain.
    #[error("{}: {detail}", path.display())]
    Malformed { path: PathBuf, detail: String },

    /// Filtering or joining left nothing to emit.
    #[error("no usable rows: {0}")]
    DataQuality(String),

    /// Too few rows or classes for a stable stratified split.
    #[error("insufficient training data: {0}")]
    InsufficientTrainingData(String),

    /// A step of the end-to-end run failed; the cause is the source.
    #[error("{stage} stage failed")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("attribution failed: {0}")]
    Explainability(String),

    #[error("model fitting failed: {0}")]
    Fit(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Polars(#[from] PolarsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl PipelineError {
    pub fn malformed(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        PipelineError::Malformed {
            path: path.into(),
            detail: detail.into(),
        }
    }
}
