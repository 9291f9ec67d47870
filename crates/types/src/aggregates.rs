//! Finalized window aggregates

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::readings::SeriesKey;

/// What caused a window to be finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseTrigger {
    /// The key's watermark passed the window end
    Watermark,
    /// The engine force-finalized the window during graceful shutdown
    Shutdown,
}

/// Immutable summary of one closed window
///
/// Percentiles are estimates from a bounded t-digest; all other statistics
/// are exact single-pass results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub source_id: String,
    pub metric_name: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Sample variance (n - 1); zero for a single value
    pub variance: f64,
    pub stddev: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub trigger: CloseTrigger,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl AggregateSnapshot {
    /// The series this snapshot summarizes
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.source_id.clone(), self.metric_name.clone())
    }

    /// Window identifier, stable for a given series and window start
    pub fn window_id(&self) -> String {
        format!(
            "{}/{}@{}",
            self.source_id,
            self.metric_name,
            self.window_start.timestamp_millis()
        )
    }
}
