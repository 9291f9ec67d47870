//! Time-series storage encoding of window snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use telemetry_types::AggregateSnapshot;

/// A field value in a storage point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(u64),
    Float(f64),
}

/// One point for the time-series store
///
/// measurement = metric name, tags = `source_id` (and `location` when the
/// sensor reported one), fields = window statistics, timestamp = window end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp: DateTime<Utc>,
}

impl From<&AggregateSnapshot> for StoragePoint {
    fn from(snapshot: &AggregateSnapshot) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("source_id".to_string(), snapshot.source_id.clone());
        if let Some(location) = snapshot.tags.get("location") {
            tags.insert("location".to_string(), location.clone());
        }

        let mut fields = BTreeMap::new();
        fields.insert("count".to_string(), FieldValue::Integer(snapshot.count));
        for (name, value) in [
            ("mean", snapshot.mean),
            ("min", snapshot.min),
            ("max", snapshot.max),
            ("p50", snapshot.p50),
            ("p95", snapshot.p95),
            ("p99", snapshot.p99),
            ("stddev", snapshot.stddev),
        ] {
            fields.insert(name.to_string(), FieldValue::Float(value));
        }

        Self {
            measurement: snapshot.metric_name.clone(),
            tags,
            fields,
            timestamp: snapshot.window_end,
        }
    }
}

impl StoragePoint {
    /// Render as a line-protocol record with a nanosecond timestamp
    pub fn to_line_protocol(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);
        for (key, value) in &self.tags {
            let _ = write!(
                line,
                ",{}={}",
                escape(key, &[',', '=', ' ']),
                escape(value, &[',', '=', ' '])
            );
        }

        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    FieldValue::Integer(v) => format!("{v}i"),
                    FieldValue::Float(v) => format!("{v}"),
                };
                format!("{}={}", escape(key, &[',', '=', ' ']), rendered)
            })
            .collect();

        let nanos = self
            .timestamp
            .timestamp_nanos_opt()
            .unwrap_or_else(|| self.timestamp.timestamp_millis().saturating_mul(1_000_000));
        let _ = write!(line, " {} {}", fields.join(","), nanos);
        line
    }
}

fn escape(value: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || special.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
