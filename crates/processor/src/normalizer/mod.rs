//! Event normalization
//!
//! Turns loosely-typed raw messages into canonical [`Reading`]s or structured
//! [`Rejection`]s. Two payload shapes are understood: the canonical
//! `{source_id, metric_name, value, event_time}` and the sensor simulator's
//! `{sensor_id, type, location, value, unit, timestamp}`.
//!
//! Validation is stateless and can run at the ingestion boundary.
//! Deduplication needs per-key memory and runs inside the owning lane
//! through [`DedupFilter`].

mod dedup;

pub use dedup::{DedupFilter, IdempotencyKey};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use telemetry_config::{NormalizerConfig, ValueRange};
use telemetry_types::Reading;
use thiserror::Error;

const SOURCE_FIELDS: &[&str] = &["source_id", "sensor_id"];
const METRIC_FIELDS: &[&str] = &["metric_name", "metric", "type"];
const TIME_FIELDS: &[&str] = &["event_time", "timestamp"];
const TAG_FIELDS: &[&str] = &["location", "unit"];

/// Why a raw message was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    MissingField,
    TypeMismatch,
    OutOfRange,
    Duplicate,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::MissingField => "missing_field",
            RejectReason::TypeMismatch => "type_mismatch",
            RejectReason::OutOfRange => "out_of_range",
            RejectReason::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw message that failed validation, with the original payload
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{reason}: {detail}")]
pub struct Rejection {
    pub reason: RejectReason,
    pub detail: String,
    pub raw: Value,
}

impl Rejection {
    fn new(reason: RejectReason, detail: impl Into<String>, raw: &Value) -> Self {
        Self {
            reason,
            detail: detail.into(),
            raw: raw.clone(),
        }
    }
}

/// Validates and canonicalizes raw readings
#[derive(Debug, Clone)]
pub struct Normalizer {
    ranges: BTreeMap<String, ValueRange>,
    max_clock_skew_ms: i64,
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Self {
        Self {
            ranges: config.ranges.clone(),
            max_clock_skew_ms: config.max_clock_skew.as_millis() as i64,
        }
    }

    /// Validate one raw message that arrived at `ingest_time`
    pub fn validate(&self, raw: &Value, ingest_time: DateTime<Utc>) -> Result<Reading, Rejection> {
        let Some(object) = raw.as_object() else {
            return Err(Rejection::new(
                RejectReason::TypeMismatch,
                "payload must be a JSON object",
                raw,
            ));
        };

        let source_id = required_string(object, SOURCE_FIELDS, raw)?;
        let metric_name = required_string(object, METRIC_FIELDS, raw)?;
        let value = required_value(object, raw)?;
        let event_time = required_time(object, raw)?;

        if let Some(range) = self.ranges.get(&metric_name) {
            if !range.contains(value) {
                return Err(Rejection::new(
                    RejectReason::OutOfRange,
                    format!(
                        "{metric_name} value {value} outside plausible range [{}, {}]",
                        range.min, range.max
                    ),
                    raw,
                ));
            }
        }

        let lead_ms = event_time.timestamp_millis() - ingest_time.timestamp_millis();
        if lead_ms > self.max_clock_skew_ms {
            return Err(Rejection::new(
                RejectReason::OutOfRange,
                format!("event_time is {lead_ms}ms in the future"),
                raw,
            ));
        }

        let mut reading = Reading::new(source_id, metric_name, value, event_time, ingest_time);
        for field in TAG_FIELDS {
            if let Some(Value::String(tag)) = object.get(*field) {
                reading = reading.with_tag(*field, tag.clone());
            }
        }
        Ok(reading)
    }
}

fn lookup<'a>(object: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| object.get(*name))
        .find(|value| !value.is_null())
}

fn required_string(
    object: &Map<String, Value>,
    names: &[&str],
    raw: &Value,
) -> Result<String, Rejection> {
    match lookup(object, names) {
        None => Err(Rejection::new(
            RejectReason::MissingField,
            format!("missing {}", names[0]),
            raw,
        )),
        Some(Value::String(s)) if s.trim().is_empty() => Err(Rejection::new(
            RejectReason::MissingField,
            format!("{} is empty", names[0]),
            raw,
        )),
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(other) => Err(Rejection::new(
            RejectReason::TypeMismatch,
            format!("{} must be a string, got {}", names[0], type_name(other)),
            raw,
        )),
    }
}

fn required_value(object: &Map<String, Value>, raw: &Value) -> Result<f64, Rejection> {
    let value = match lookup(object, &["value"]) {
        None => {
            return Err(Rejection::new(RejectReason::MissingField, "missing value", raw));
        }
        Some(Value::Bool(flag)) => {
            if *flag {
                1.0
            } else {
                0.0
            }
        }
        Some(Value::Number(n)) => n.as_f64().ok_or_else(|| {
            Rejection::new(RejectReason::TypeMismatch, "value is not representable", raw)
        })?,
        Some(other) => {
            return Err(Rejection::new(
                RejectReason::TypeMismatch,
                format!("value must be a number, got {}", type_name(other)),
                raw,
            ));
        }
    };

    if !value.is_finite() {
        return Err(Rejection::new(
            RejectReason::OutOfRange,
            "value must be finite",
            raw,
        ));
    }
    Ok(value)
}

fn required_time(object: &Map<String, Value>, raw: &Value) -> Result<DateTime<Utc>, Rejection> {
    match lookup(object, TIME_FIELDS) {
        None => Err(Rejection::new(
            RejectReason::MissingField,
            "missing event_time",
            raw,
        )),
        Some(Value::String(s)) => parse_timestamp(s).ok_or_else(|| {
            Rejection::new(
                RejectReason::TypeMismatch,
                format!("unparseable timestamp '{s}'"),
                raw,
            )
        }),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(millis) => DateTime::from_timestamp_millis(millis).ok_or_else(|| {
                Rejection::new(
                    RejectReason::OutOfRange,
                    format!("epoch milliseconds {millis} out of range"),
                    raw,
                )
            }),
            None => Err(Rejection::new(
                RejectReason::TypeMismatch,
                "numeric timestamps must be integer epoch milliseconds",
                raw,
            )),
        },
        Some(other) => Err(Rejection::new(
            RejectReason::TypeMismatch,
            format!("event_time must be a string or integer, got {}", type_name(other)),
            raw,
        )),
    }
}

/// RFC 3339, or a naive ISO-8601 date-time interpreted as UTC
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .map(|naive| naive.and_utc())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
