pub mod metrics;
pub mod roc;
