//! Anomaly rule configuration

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::aggregates::AggregateSnapshot;

/// Alert severity attached to a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Warning
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// Which aggregate statistic a threshold rule inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    Mean,
    Min,
    Max,
    P50,
    P95,
    P99,
    Stddev,
}

impl Default for Statistic {
    fn default() -> Self {
        Statistic::Mean
    }
}

impl Statistic {
    /// Read this statistic from a snapshot
    pub fn of(&self, snapshot: &AggregateSnapshot) -> f64 {
        match self {
            Statistic::Mean => snapshot.mean,
            Statistic::Min => snapshot.min,
            Statistic::Max => snapshot.max,
            Statistic::P50 => snapshot.p50,
            Statistic::P95 => snapshot.p95,
            Statistic::P99 => snapshot.p99,
            Statistic::Stddev => snapshot.stddev,
        }
    }
}

/// Rule kind and its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    /// Fires when the chosen statistic leaves `[low, high]`
    Threshold {
        #[serde(default)]
        low: Option<f64>,
        #[serde(default)]
        high: Option<f64>,
        #[serde(default)]
        statistic: Statistic,
    },
    /// Fires when `|mean - previous mean| / window size` exceeds `max_rate` (units per second)
    RateOfChange { max_rate: f64 },
    /// Fires when the window mean is more than `k` baseline deviations from the baseline mean
    StddevOutlier { k: f64 },
}

impl RuleKind {
    /// Stable name of the kind, used in alerts and metrics
    pub fn name(&self) -> &'static str {
        match self {
            RuleKind::Threshold { .. } => "threshold",
            RuleKind::RateOfChange { .. } => "rate_of_change",
            RuleKind::StddevOutlier { .. } => "stddev_outlier",
        }
    }
}

/// A rule bound to one metric name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRule {
    pub id: String,
    #[serde(alias = "metric")]
    pub metric_name: String,
    #[serde(flatten)]
    pub kind: RuleKind,
    #[serde(default)]
    pub severity: Severity,
}

impl AnomalyRule {
    /// Whether this rule is evaluated for the given metric
    pub fn applies_to(&self, metric_name: &str) -> bool {
        self.metric_name == metric_name
    }
}
