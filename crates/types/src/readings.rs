//! Normalized sensor readings and their series keys

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of one independent time series: a metric reported by a source
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Sensor or device identifier
    pub source_id: String,
    /// Metric reported by the sensor (e.g. `temperature`)
    pub metric_name: String,
}

impl SeriesKey {
    /// Create a new series key
    pub fn new(source_id: impl Into<String>, metric_name: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            metric_name: metric_name.into(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source_id, self.metric_name)
    }
}

/// A validated, canonical sensor reading
///
/// `event_time` is asserted by the sensor and may be skewed or out of order.
/// `ingest_time` is assigned locally when the raw message arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub source_id: String,
    pub metric_name: String,
    pub value: f64,
    pub event_time: DateTime<Utc>,
    pub ingest_time: DateTime<Utc>,
    /// Optional descriptive tags carried from the raw payload (`location`, `unit`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

impl Reading {
    /// Create a reading without tags
    pub fn new(
        source_id: impl Into<String>,
        metric_name: impl Into<String>,
        value: f64,
        event_time: DateTime<Utc>,
        ingest_time: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            metric_name: metric_name.into(),
            value,
            event_time,
            ingest_time,
            tags: BTreeMap::new(),
        }
    }

    /// Attach a tag
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// The series this reading belongs to
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::new(self.source_id.clone(), self.metric_name.clone())
    }

    /// Event time in milliseconds since the epoch
    pub fn event_time_ms(&self) -> i64 {
        self.event_time.timestamp_millis()
    }
}
