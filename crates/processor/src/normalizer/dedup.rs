use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use telemetry_types::Reading;
use tracing::trace;

use super::{RejectReason, Rejection};

/// Identity of a reading for duplicate detection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub source_id: String,
    pub metric_name: String,
    pub event_time_ms: i64,
}

impl From<&Reading> for IdempotencyKey {
    fn from(reading: &Reading) -> Self {
        Self {
            source_id: reading.source_id.clone(),
            metric_name: reading.metric_name.clone(),
            event_time_ms: reading.event_time_ms(),
        }
    }
}

/// Sliding-window duplicate filter keyed by `source_id + metric_name + event_time`
///
/// A key is remembered for `window` of ingest time after it was first seen.
/// Re-deliveries inside that span are duplicates; once the entry expires the
/// same reading is accepted again. Memory is capped at `max_entries`, and the
/// oldest keys are forgotten early when the cap is hit.
#[derive(Debug)]
pub struct DedupFilter {
    window_ms: i64,
    max_entries: usize,
    seen: HashMap<IdempotencyKey, i64>,
    order: VecDeque<(IdempotencyKey, i64)>,
}

impl DedupFilter {
    pub fn new(window: Duration, max_entries: usize) -> Self {
        Self {
            window_ms: window.as_millis() as i64,
            max_entries: max_entries.max(1),
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns `true` if the reading was already seen inside the window
    pub fn is_duplicate(&mut self, reading: &Reading) -> bool {
        let now = reading.ingest_time.timestamp_millis();
        self.expire(now);

        let key = IdempotencyKey::from(reading);
        if self.seen.contains_key(&key) {
            return true;
        }

        while self.seen.len() >= self.max_entries {
            let Some((oldest, _)) = self.order.pop_front() else {
                break;
            };
            trace!(source_id = %oldest.source_id, "dedup capacity reached, forgetting oldest key");
            self.seen.remove(&oldest);
        }

        self.seen.insert(key.clone(), now);
        self.order.push_back((key, now));
        false
    }

    /// Reject a reading seen inside the window
    pub fn admit(&mut self, reading: &Reading) -> Result<(), Rejection> {
        if !self.is_duplicate(reading) {
            return Ok(());
        }
        Err(Rejection {
            reason: RejectReason::Duplicate,
            detail: format!(
                "{}/{} at {} already seen",
                reading.source_id,
                reading.metric_name,
                reading.event_time.to_rfc3339()
            ),
            raw: serde_json::to_value(reading).unwrap_or(Value::Null),
        })
    }

    fn expire(&mut self, now: i64) {
        while let Some((_, first_seen)) = self.order.front() {
            if now.saturating_sub(*first_seen) < self.window_ms {
                break;
            }
            if let Some((key, _)) = self.order.pop_front() {
                self.seen.remove(&key);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
