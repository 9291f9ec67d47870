//! Window types and bounds

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use telemetry_types::{Reading, SeriesKey};

use crate::error::{WindowError, WindowResult};
use crate::watermark::Watermark;

/// Represents the time bounds of a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowBounds {
    /// Start time of the window (inclusive)
    pub start: DateTime<Utc>,
    /// End time of the window (exclusive)
    pub end: DateTime<Utc>,
}

impl WindowBounds {
    /// Create bounds from epoch milliseconds
    pub fn from_millis(start: i64, end: i64) -> WindowResult<Self> {
        if start >= end {
            return Err(WindowError::InvalidTimestamp {
                timestamp: start,
                reason: format!("window start must be before end {end}"),
            });
        }
        let to_datetime = |millis: i64| {
            DateTime::from_timestamp_millis(millis).ok_or_else(|| WindowError::InvalidTimestamp {
                timestamp: millis,
                reason: "out of representable range".to_string(),
            })
        };
        Ok(Self {
            start: to_datetime(start)?,
            end: to_datetime(end)?,
        })
    }

    pub fn start_ms(&self) -> i64 {
        self.start.timestamp_millis()
    }

    pub fn end_ms(&self) -> i64 {
        self.end.timestamp_millis()
    }

    /// Check if a timestamp falls within this window
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} - {})",
            self.start.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.end.format("%Y-%m-%d %H:%M:%S%.3f")
        )
    }
}

impl PartialOrd for WindowBounds {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WindowBounds {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}

/// Lifecycle of a window
///
/// `Open` accepts updates. `Closing` is held only while the window is being
/// finalized. `Closed` windows have emitted their snapshot and never accept
/// updates again; they are retained for the allowed lateness plus the
/// eviction grace and then `Evicted`, at which point their state is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    Open,
    Closing,
    Closed,
    Evicted,
}

impl fmt::Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WindowState::Open => "open",
            WindowState::Closing => "closing",
            WindowState::Closed => "closed",
            WindowState::Evicted => "evicted",
        };
        f.write_str(name)
    }
}

/// Handle to one live window: `(source_id, metric_name, window_start)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowRef {
    pub key: SeriesKey,
    pub bounds: WindowBounds,
}

impl WindowRef {
    pub fn new(key: SeriesKey, bounds: WindowBounds) -> Self {
        Self { key, bounds }
    }
}

impl fmt::Display for WindowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.bounds)
    }
}

/// Why a reading went to the late side-output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateReason {
    /// Event time is older than the watermark minus the allowed lateness
    BeyondAllowedLateness,
    /// The target window has already been closed
    WindowClosed,
}

impl LateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LateReason::BeyondAllowedLateness => "beyond_allowed_lateness",
            LateReason::WindowClosed => "window_closed",
        }
    }
}

/// A reading that could not be assigned because it arrived too late
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateEvent {
    pub reading: Reading,
    /// Target window, when the reading was rejected by a closed window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowBounds>,
    pub reason: LateReason,
    /// Key watermark (epoch ms) at the time the reading arrived
    pub watermark: Watermark,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_bounds_from_millis() {
        let bounds = WindowBounds::from_millis(0, 60_000).unwrap();
        assert_eq!(bounds.start_ms(), 0);
        assert_eq!(bounds.end_ms(), 60_000);
        assert!(bounds.contains(Utc.timestamp_millis_opt(59_999).unwrap()));
        assert!(!bounds.contains(Utc.timestamp_millis_opt(60_000).unwrap()));
    }

    #[test]
    fn test_bounds_rejects_inverted_range() {
        assert!(WindowBounds::from_millis(10, 10).is_err());
        assert!(WindowBounds::from_millis(i64::MAX - 1, i64::MAX).is_err());
    }

    #[test]
    fn test_bounds_ordering() {
        let a = WindowBounds::from_millis(0, 60_000).unwrap();
        let b = WindowBounds::from_millis(30_000, 90_000).unwrap();
        assert!(a < b);
    }
}
