//! Output envelope and key routing shared by lanes and dispatchers

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use telemetry_types::{AggregateSnapshot, Alert, SeriesKey};

use crate::window::LateEvent;

/// Everything a lane hands to its dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Output {
    /// A finalized window aggregate
    Snapshot(AggregateSnapshot),
    /// An anomaly alert
    Alert(Alert),
    /// A reading diverted to the late side-output
    Late(LateEvent),
}

/// Discriminant of [`Output`], used for sink filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Snapshot,
    Alert,
    Late,
}

impl OutputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::Snapshot => "snapshot",
            OutputKind::Alert => "alert",
            OutputKind::Late => "late",
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Output {
    pub fn kind(&self) -> OutputKind {
        match self {
            Output::Snapshot(_) => OutputKind::Snapshot,
            Output::Alert(_) => OutputKind::Alert,
            Output::Late(_) => OutputKind::Late,
        }
    }

    /// Series the output belongs to
    pub fn series_key(&self) -> SeriesKey {
        match self {
            Output::Snapshot(snapshot) => snapshot.series_key(),
            Output::Alert(alert) => {
                SeriesKey::new(alert.source_id.clone(), alert.metric_name.clone())
            }
            Output::Late(late) => late.reading.series_key(),
        }
    }
}

/// Lane index owning `key`
///
/// Stable for the lifetime of the process, so every reading of a series is
/// processed by the same lane in arrival order.
pub fn route_lane(key: &SeriesKey, lanes: usize) -> usize {
    if lanes <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}
