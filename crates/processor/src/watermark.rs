//! Per-series watermark tracking
//!
//! A watermark is the tracker's estimate that no more events with an event
//! time at or below it will arrive, other than within the allowed-lateness
//! slack. Each series key advances independently, so one slow or stalled
//! sensor never holds back window closure for the others.
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use processor::watermark::KeyedWatermarkTracker;
//! use std::time::Duration;
//! use telemetry_types::SeriesKey;
//!
//! let mut tracker = KeyedWatermarkTracker::new(Duration::from_secs(10), Duration::from_secs(30));
//! let key = SeriesKey::new("temperature_1", "temperature");
//!
//! let at = |secs| Utc.timestamp_opt(secs, 0).unwrap();
//! tracker.observe_at(&key, at(80), at(80));
//! tracker.observe_at(&key, at(39), at(81));
//!
//! assert_eq!(tracker.current(&key).timestamp, 70_000);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use telemetry_types::SeriesKey;
use tracing::{debug, trace};

/// Represents a watermark timestamp
///
/// Watermarks indicate that all events with timestamps less than or equal to the watermark
/// have been observed. [`Watermark::min`] means no event has been seen yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    /// The watermark timestamp in milliseconds since epoch
    pub timestamp: i64,
}

impl Watermark {
    /// Creates a new watermark with the given timestamp
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    /// Creates a watermark from a DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            timestamp: dt.timestamp_millis(),
        }
    }

    /// Converts the watermark to a DateTime, if it is representable
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }

    /// Returns the minimum possible watermark (beginning of time)
    pub fn min() -> Self {
        Self { timestamp: i64::MIN }
    }

    /// Checks if this watermark is before the given timestamp
    pub fn is_before(&self, timestamp: i64) -> bool {
        self.timestamp < timestamp
    }

    /// Checks if this watermark is at or after the given timestamp
    pub fn has_passed(&self, timestamp: i64) -> bool {
        self.timestamp >= timestamp
    }

    /// Returns true if this is the minimum watermark
    pub fn is_min(&self) -> bool {
        self.timestamp == i64::MIN
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::min()
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.to_datetime() {
            Some(dt) if !self.is_min() => write!(f, "Watermark({})", dt.to_rfc3339()),
            _ => write!(f, "Watermark(min)"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct KeyProgress {
    max_event_time: i64,
    watermark: Watermark,
    /// Processing time (ms) the key last produced an event
    last_seen: i64,
}

/// Bounded out-of-orderness watermarks, one per series key
///
/// `watermark = max(event_time seen) - max_out_of_orderness`, never
/// decreasing. Keys that stay silent for `idle_timeout` are advanced by the
/// processing time that has elapsed since their last event, so their last
/// window still closes.
#[derive(Debug, Clone)]
pub struct KeyedWatermarkTracker {
    max_out_of_orderness_ms: i64,
    idle_timeout_ms: i64,
    keys: HashMap<SeriesKey, KeyProgress>,
}

impl KeyedWatermarkTracker {
    pub fn new(max_out_of_orderness: Duration, idle_timeout: Duration) -> Self {
        Self {
            max_out_of_orderness_ms: max_out_of_orderness.as_millis() as i64,
            idle_timeout_ms: idle_timeout.as_millis() as i64,
            keys: HashMap::new(),
        }
    }

    /// Record an event for `key` seen now and return the key's watermark
    pub fn observe(&mut self, key: &SeriesKey, event_time: DateTime<Utc>) -> Watermark {
        self.observe_at(key, event_time, Utc::now())
    }

    /// Record an event for `key` seen at processing time `seen_at`
    pub fn observe_at(
        &mut self,
        key: &SeriesKey,
        event_time: DateTime<Utc>,
        seen_at: DateTime<Utc>,
    ) -> Watermark {
        let event_ms = event_time.timestamp_millis();
        let seen_ms = seen_at.timestamp_millis();
        let candidate = Watermark::new(event_ms.saturating_sub(self.max_out_of_orderness_ms));

        match self.keys.get_mut(key) {
            Some(progress) => {
                progress.max_event_time = progress.max_event_time.max(event_ms);
                progress.last_seen = progress.last_seen.max(seen_ms);
                if candidate > progress.watermark {
                    trace!(key = %key, watermark = candidate.timestamp, "watermark advanced");
                    progress.watermark = candidate;
                }
                progress.watermark
            }
            None => {
                self.keys.insert(
                    key.clone(),
                    KeyProgress {
                        max_event_time: event_ms,
                        watermark: candidate,
                        last_seen: seen_ms,
                    },
                );
                candidate
            }
        }
    }

    /// Current watermark for `key`; [`Watermark::min`] for unseen keys
    pub fn current(&self, key: &SeriesKey) -> Watermark {
        self.keys
            .get(key)
            .map(|progress| progress.watermark)
            .unwrap_or_else(Watermark::min)
    }

    /// Advance the watermark of every idle key by elapsed processing time
    ///
    /// Returns the keys whose watermark moved, with their new value.
    pub fn advance_idle(&mut self, now: DateTime<Utc>) -> Vec<(SeriesKey, Watermark)> {
        let now_ms = now.timestamp_millis();
        let mut advanced = Vec::new();

        for (key, progress) in self.keys.iter_mut() {
            let idle_for = now_ms.saturating_sub(progress.last_seen);
            if idle_for < self.idle_timeout_ms {
                continue;
            }

            let candidate = Watermark::new(
                progress
                    .max_event_time
                    .saturating_add(idle_for)
                    .saturating_sub(self.max_out_of_orderness_ms),
            );
            if candidate > progress.watermark {
                debug!(
                    key = %key,
                    idle_ms = idle_for,
                    watermark = candidate.timestamp,
                    "advancing watermark of idle key"
                );
                progress.watermark = candidate;
                advanced.push((key.clone(), candidate));
            }
        }

        advanced
    }

    /// Processing time elapsed since `key` last produced an event (ms)
    pub fn idle_for(&self, key: &SeriesKey, now: DateTime<Utc>) -> Option<i64> {
        self.keys
            .get(key)
            .map(|progress| now.timestamp_millis().saturating_sub(progress.last_seen))
    }

    /// Stop tracking `key`; its watermark restarts from scratch if it returns
    pub fn retire(&mut self, key: &SeriesKey) -> bool {
        self.keys.remove(key).is_some()
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
