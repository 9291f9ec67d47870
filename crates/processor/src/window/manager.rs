//! Per-lane window state
//!
//! Windows are owned records indexed first by series key and then by window
//! start in an ordered map, so closing and evicting a key only touches that
//! key's windows and only from the oldest end.

use std::collections::{BTreeMap, HashMap};
use telemetry_config::WindowConfig;
use telemetry_types::{AggregateSnapshot, CloseTrigger, Reading, SeriesKey};
use tracing::{debug, warn};

use super::assigner::{self, WindowAssigner};
use super::types::{LateEvent, LateReason, WindowBounds, WindowRef, WindowState};
use crate::aggregation::AggregateState;
use crate::error::{Result, StateInvariantViolation, WindowError, WindowResult};
use crate::watermark::Watermark;

/// One window and its accumulator
#[derive(Debug, Clone)]
pub struct WindowRecord {
    bounds: WindowBounds,
    state: WindowState,
    accumulator: AggregateState,
    tags: BTreeMap<String, String>,
}

impl WindowRecord {
    pub fn bounds(&self) -> WindowBounds {
        self.bounds
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    pub fn accumulator(&self) -> &AggregateState {
        &self.accumulator
    }

    pub fn count(&self) -> u64 {
        self.accumulator.count()
    }

    fn finalize(&mut self, key: &SeriesKey, trigger: CloseTrigger) -> Option<AggregateSnapshot> {
        self.state = WindowState::Closing;
        let snapshot = self.accumulator.finalize(
            key,
            self.bounds.start,
            self.bounds.end,
            trigger,
            &self.tags,
        );
        self.state = WindowState::Closed;

        match snapshot {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                warn!(key = %key, window = %self.bounds, error = %err, "window closed without a snapshot");
                None
            }
        }
    }
}

#[derive(Debug)]
struct SeriesWindows {
    windows: BTreeMap<i64, WindowRecord>,
    /// Largest window end (ms) whose state has been freed
    evicted_through: i64,
}

impl SeriesWindows {
    fn new() -> Self {
        Self {
            windows: BTreeMap::new(),
            evicted_through: i64::MIN,
        }
    }
}

/// Outcome of assigning one reading
#[derive(Debug, Default)]
pub struct Assignment {
    /// Open windows the reading must be folded into
    pub windows: Vec<WindowRef>,
    /// Late side-output, one entry per rejected target window
    pub late: Vec<LateEvent>,
    pub violations: Vec<StateInvariantViolation>,
    /// Number of windows created by this assignment
    pub opened: usize,
}

/// Outcome of advancing a key's watermark
#[derive(Debug, Default)]
pub struct Advance {
    pub closed: Vec<AggregateSnapshot>,
    /// Windows that left the open state without producing a snapshot
    pub discarded: usize,
    pub evicted: usize,
}

/// Window lifecycle manager for the keys owned by one lane
#[derive(Debug)]
pub struct WindowManager {
    assigner: Box<dyn WindowAssigner>,
    allowed_lateness_ms: i64,
    eviction_grace_ms: i64,
    empty_state: AggregateState,
    series: HashMap<SeriesKey, SeriesWindows>,
    open_windows: usize,
}

impl WindowManager {
    pub fn new(config: &WindowConfig, percentile_compression: f64) -> Result<Self> {
        Ok(Self {
            assigner: assigner::from_config(config)?,
            allowed_lateness_ms: config.allowed_lateness_ms(),
            eviction_grace_ms: config.eviction_grace_ms(),
            empty_state: AggregateState::new(percentile_compression)?,
            series: HashMap::new(),
            open_windows: 0,
        })
    }

    pub fn window_size_ms(&self) -> i64 {
        self.assigner.size_ms()
    }

    /// Map a reading to its window(s), opening new windows as needed
    ///
    /// Readings older than `watermark - allowed_lateness` are not assigned at
    /// all. Readings whose target window has already closed go to the late
    /// side-output for that window; closed windows are never re-opened.
    /// Non-finite values are refused before any window is created.
    pub fn assign(&mut self, reading: &Reading, watermark: Watermark) -> WindowResult<Assignment> {
        let key = reading.series_key();
        if !reading.value.is_finite() {
            return Err(WindowError::NonFiniteValue {
                key: key.to_string(),
                value: reading.value,
            });
        }
        let timestamp = reading.event_time_ms();
        let mut assignment = Assignment::default();

        if !watermark.is_min()
            && timestamp < watermark.timestamp.saturating_sub(self.allowed_lateness_ms)
        {
            assignment.late.push(LateEvent {
                reading: reading.clone(),
                window: None,
                reason: LateReason::BeyondAllowedLateness,
                watermark,
            });
            return Ok(assignment);
        }

        let targets = self.assigner.assign_windows(timestamp)?;
        let series = self
            .series
            .entry(key.clone())
            .or_insert_with(SeriesWindows::new);

        for bounds in targets {
            if bounds.end_ms() <= series.evicted_through {
                assignment
                    .violations
                    .push(StateInvariantViolation::UpdateOnEvictedWindow {
                        key: key.clone(),
                        window_start: bounds.start_ms(),
                        evicted_through: series.evicted_through,
                    });
                continue;
            }

            let existing = series.windows.get(&bounds.start_ms()).map(|r| r.state);
            let closed = match existing {
                Some(WindowState::Open) => false,
                Some(_) => true,
                None => watermark.has_passed(bounds.end_ms()),
            };

            if closed {
                assignment.late.push(LateEvent {
                    reading: reading.clone(),
                    window: Some(bounds),
                    reason: LateReason::WindowClosed,
                    watermark,
                });
                continue;
            }

            if existing.is_none() {
                series.windows.insert(
                    bounds.start_ms(),
                    WindowRecord {
                        bounds,
                        state: WindowState::Open,
                        accumulator: self.empty_state.clone(),
                        tags: reading.tags.clone(),
                    },
                );
                self.open_windows += 1;
                assignment.opened += 1;
            }

            assignment.windows.push(WindowRef::new(key.clone(), bounds));
        }

        Ok(assignment)
    }

    /// Fold a reading into an open window
    pub fn update(&mut self, window: &WindowRef, reading: &Reading) -> Result<()> {
        let start = window.bounds.start_ms();
        let series = self.series.get_mut(&window.key).ok_or_else(|| {
            StateInvariantViolation::UnknownWindow {
                key: window.key.clone(),
                window_start: start,
            }
        })?;

        if window.bounds.end_ms() <= series.evicted_through {
            return Err(StateInvariantViolation::UpdateOnEvictedWindow {
                key: window.key.clone(),
                window_start: start,
                evicted_through: series.evicted_through,
            }
            .into());
        }

        let record = series.windows.get_mut(&start).ok_or_else(|| {
            StateInvariantViolation::UnknownWindow {
                key: window.key.clone(),
                window_start: start,
            }
        })?;

        if record.state != WindowState::Open {
            return Err(StateInvariantViolation::UpdateOnClosedWindow {
                key: window.key.clone(),
                window_start: start,
            }
            .into());
        }

        record.accumulator.update(reading.value)?;
        Ok(())
    }

    /// Close every window of `key` whose end the watermark has passed, then
    /// evict closed windows past their retention
    pub fn advance(&mut self, key: &SeriesKey, watermark: Watermark) -> Advance {
        let mut advance = Advance::default();
        if watermark.is_min() {
            return advance;
        }
        let retention = self.retention_ms();
        let Some(series) = self.series.get_mut(key) else {
            return advance;
        };

        for record in series.windows.values_mut() {
            if !watermark.has_passed(record.bounds.end_ms()) {
                break;
            }
            if record.state != WindowState::Open {
                continue;
            }
            self.open_windows = self.open_windows.saturating_sub(1);
            match record.finalize(key, CloseTrigger::Watermark) {
                Some(snapshot) => {
                    debug!(
                        key = %key,
                        window = %record.bounds,
                        count = snapshot.count,
                        watermark = watermark.timestamp,
                        "window closed"
                    );
                    advance.closed.push(snapshot);
                }
                None => advance.discarded += 1,
            }
        }

        while let Some(entry) = series.windows.first_entry() {
            let record = entry.get();
            if record.state != WindowState::Closed
                || !watermark.has_passed(record.bounds.end_ms().saturating_add(retention))
            {
                break;
            }
            let record = entry.remove();
            series.evicted_through = series.evicted_through.max(record.bounds.end_ms());
            advance.evicted += 1;
        }

        advance
    }

    /// Force-finalize every open window, oldest first per key
    pub fn drain(&mut self) -> Advance {
        let mut keys: Vec<SeriesKey> = self.series.keys().cloned().collect();
        keys.sort();

        let mut drained = Advance::default();
        for key in keys {
            let Some(series) = self.series.get_mut(&key) else {
                continue;
            };
            for record in series.windows.values_mut() {
                if record.state != WindowState::Open {
                    continue;
                }
                match record.finalize(&key, CloseTrigger::Shutdown) {
                    Some(snapshot) => drained.closed.push(snapshot),
                    None => drained.discarded += 1,
                }
            }
        }

        self.open_windows = 0;
        drained
    }

    /// Drop the bookkeeping of `key` once it holds no windows
    ///
    /// Returns false, leaving the key in place, while any window of the key
    /// is still retained.
    pub fn retire(&mut self, key: &SeriesKey) -> bool {
        match self.series.get(key) {
            Some(series) if series.windows.is_empty() => {
                self.series.remove(key);
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Whether `key` still holds open or closed-but-retained windows
    pub fn has_windows(&self, key: &SeriesKey) -> bool {
        self.series
            .get(key)
            .is_some_and(|series| !series.windows.is_empty())
    }

    /// Processing-time horizon after which a closed window is evicted (ms)
    pub fn retention_ms(&self) -> i64 {
        self.allowed_lateness_ms.saturating_add(self.eviction_grace_ms)
    }

    /// Lifecycle state of the window starting at `window_start` (ms)
    pub fn window_state(&self, key: &SeriesKey, window_start: i64) -> Option<WindowState> {
        let series = self.series.get(key)?;
        if let Some(record) = series.windows.get(&window_start) {
            return Some(record.state);
        }
        let end = window_start.saturating_add(self.assigner.size_ms());
        (end <= series.evicted_through).then_some(WindowState::Evicted)
    }

    pub fn record(&self, key: &SeriesKey, window_start: i64) -> Option<&WindowRecord> {
        self.series.get(key)?.windows.get(&window_start)
    }

    /// Windows currently accepting updates
    pub fn open_window_count(&self) -> usize {
        self.open_windows
    }

    /// Windows held in memory (open or closed awaiting eviction)
    pub fn retained_window_count(&self) -> usize {
        self.series.values().map(|s| s.windows.len()).sum()
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn reading(secs: i64, value: f64) -> Reading {
        Reading::new("temperature_1", "temperature", value, at(secs), at(secs))
    }

    fn key() -> SeriesKey {
        SeriesKey::new("temperature_1", "temperature")
    }

    fn manager() -> WindowManager {
        let mut config = WindowConfig::tumbling(Duration::from_secs(60));
        config.allowed_lateness = Duration::from_secs(30);
        config.eviction_grace = Duration::from_secs(60);
        WindowManager::new(&config, 100.0).unwrap()
    }

    fn ingest(manager: &mut WindowManager, r: &Reading, wm: Watermark) -> Assignment {
        let assignment = manager.assign(r, wm).unwrap();
        for window in &assignment.windows {
            manager.update(window, r).unwrap();
        }
        assignment
    }

    #[test]
    fn test_assign_opens_single_tumbling_window() {
        let mut manager = manager();
        let assignment = ingest(&mut manager, &reading(20, 1.0), Watermark::new(10_000));

        assert_eq!(assignment.windows.len(), 1);
        assert_eq!(assignment.opened, 1);
        assert_eq!(assignment.windows[0].bounds.start_ms(), 0);
        assert_eq!(manager.open_window_count(), 1);

        let again = ingest(&mut manager, &reading(5, 2.0), Watermark::new(10_000));
        assert_eq!(again.opened, 0);
        assert_eq!(manager.record(&key(), 0).unwrap().count(), 2);
    }

    #[test]
    fn test_advance_closes_passed_windows() {
        let mut manager = manager();
        ingest(&mut manager, &reading(20, 1.0), Watermark::new(10_000));
        ingest(&mut manager, &reading(80, 3.0), Watermark::new(70_000));

        let advance = manager.advance(&key(), Watermark::new(70_000));
        assert_eq!(advance.closed.len(), 1);
        assert_eq!(advance.closed[0].count, 1);
        assert_eq!(advance.closed[0].trigger, CloseTrigger::Watermark);
        assert_eq!(manager.window_state(&key(), 0), Some(WindowState::Closed));
        assert_eq!(manager.window_state(&key(), 60_000), Some(WindowState::Open));

        // Closing is idempotent
        assert!(manager.advance(&key(), Watermark::new(70_000)).closed.is_empty());
    }

    #[test]
    fn test_window_closed_late_event_does_not_mutate() {
        let mut manager = manager();
        ingest(&mut manager, &reading(20, 1.0), Watermark::new(10_000));
        manager.advance(&key(), Watermark::new(65_000));
        let before = manager.record(&key(), 0).unwrap().accumulator().clone();

        // Within allowed lateness but the window has closed
        let assignment = ingest(&mut manager, &reading(50, 9.0), Watermark::new(65_000));
        assert!(assignment.windows.is_empty());
        assert_eq!(assignment.late.len(), 1);
        assert_eq!(assignment.late[0].reason, LateReason::WindowClosed);
        assert_eq!(manager.record(&key(), 0).unwrap().accumulator(), &before);
    }

    #[test]
    fn test_beyond_allowed_lateness() {
        let mut manager = manager();
        let assignment = manager.assign(&reading(39, 1.0), Watermark::new(70_000)).unwrap();

        assert!(assignment.windows.is_empty());
        assert_eq!(assignment.late[0].reason, LateReason::BeyondAllowedLateness);
        assert_eq!(assignment.late[0].window, None);
        assert_eq!(manager.open_window_count(), 0);
    }

    #[test]
    fn test_update_on_closed_window_is_violation() {
        let mut manager = manager();
        let assignment = ingest(&mut manager, &reading(20, 1.0), Watermark::new(10_000));
        manager.advance(&key(), Watermark::new(60_000));

        let err = manager
            .update(&assignment.windows[0], &reading(21, 1.0))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::ProcessorError::StateInvariant(
                StateInvariantViolation::UpdateOnClosedWindow { .. }
            )
        ));
    }

    #[test]
    fn test_eviction_after_lateness_and_grace() {
        let mut manager = manager();
        let assignment = ingest(&mut manager, &reading(20, 1.0), Watermark::new(10_000));

        assert_eq!(manager.advance(&key(), Watermark::new(60_000)).evicted, 0);
        assert_eq!(manager.advance(&key(), Watermark::new(149_999)).evicted, 0);
        assert_eq!(manager.advance(&key(), Watermark::new(150_000)).evicted, 1);

        assert_eq!(manager.window_state(&key(), 0), Some(WindowState::Evicted));
        assert_eq!(manager.retained_window_count(), 0);

        let err = manager
            .update(&assignment.windows[0], &reading(21, 1.0))
            .unwrap_err();
        assert!(matches!(
            err,
            crate::error::ProcessorError::StateInvariant(
                StateInvariantViolation::UpdateOnEvictedWindow { .. }
            )
        ));
    }

    #[test]
    fn test_sliding_assignment_spans_windows() {
        let config = WindowConfig::sliding(Duration::from_secs(60), Duration::from_secs(30));
        let mut manager = WindowManager::new(&config, 100.0).unwrap();

        let assignment = ingest(&mut manager, &reading(45, 1.0), Watermark::new(35_000));
        let starts: Vec<i64> = assignment.windows.iter().map(|w| w.bounds.start_ms()).collect();
        assert_eq!(starts, vec![0, 30_000]);
        assert_eq!(manager.open_window_count(), 2);

        let advance = manager.advance(&key(), Watermark::new(60_000));
        assert_eq!(advance.closed.len(), 1);
        assert_eq!(manager.open_window_count(), 1);
    }

    #[test]
    fn test_drain_force_finalizes() {
        let mut manager = manager();
        ingest(&mut manager, &reading(20, 1.0), Watermark::new(10_000));
        ingest(
            &mut manager,
            &Reading::new("humidity_1", "humidity", 50.0, at(30), at(30)),
            Watermark::new(20_000),
        );

        let drained = manager.drain();
        assert_eq!(drained.closed.len(), 2);
        assert_eq!(drained.discarded, 0);
        assert!(drained.closed.iter().all(|s| s.trigger == CloseTrigger::Shutdown));
        assert_eq!(manager.open_window_count(), 0);
        assert!(manager.drain().closed.is_empty());
    }

    #[test]
    fn test_non_finite_value_opens_nothing() {
        let mut manager = manager();
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = manager.assign(&reading(20, value), Watermark::new(10_000)).unwrap_err();
            assert!(matches!(err, WindowError::NonFiniteValue { .. }));
        }

        assert_eq!(manager.open_window_count(), 0);
        assert_eq!(manager.retained_window_count(), 0);
        assert_eq!(manager.window_state(&key(), 0), None);
    }

    #[test]
    fn test_retire_only_after_eviction() {
        let mut manager = manager();
        ingest(&mut manager, &reading(20, 1.0), Watermark::new(10_000));

        assert!(manager.has_windows(&key()));
        assert!(!manager.retire(&key()));
        assert_eq!(manager.series_count(), 1);

        manager.advance(&key(), Watermark::new(150_000));
        assert!(!manager.has_windows(&key()));
        assert!(manager.retire(&key()));
        assert_eq!(manager.series_count(), 0);
        assert_eq!(manager.window_state(&key(), 0), None);
    }
}
