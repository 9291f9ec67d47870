//! Alert records emitted by the anomaly detector

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rules::Severity;

/// An anomaly alert for one (window, rule) pair
///
/// Serialized as a flat record; the window is represented by its bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: Uuid,
    pub source_id: String,
    pub metric_name: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub rule_id: String,
    /// Rule kind that fired (`threshold`, `rate_of_change`, `stddev_outlier`)
    pub rule_kind: String,
    pub observed_value: f64,
    /// The bound the observed value was compared against
    pub limit: f64,
    pub severity: Severity,
    pub triggered_at: DateTime<Utc>,
    pub message: String,
}
