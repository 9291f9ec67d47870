//! Anomaly detection over finalized windows
//!
//! Three rule kinds are supported: static thresholds on a chosen statistic,
//! rate of change between consecutive windows, and outliers against an
//! exponentially weighted baseline of window means.

mod baseline;
mod detector;

pub use baseline::EwmaBaseline;
pub use detector::{AnomalyDetector, RuleState};
