//! Processing lanes
//!
//! A lane owns the complete per-key state for the series routed to it:
//! duplicate filter, watermarks, windows, and anomaly history. Lanes share
//! nothing, so a lane processes its readings strictly in arrival order
//! without locking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use telemetry_config::PipelineConfig;
use telemetry_types::{AggregateSnapshot, Reading, SeriesKey};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::anomaly::AnomalyDetector;
use crate::core::Output;
use crate::dispatch::DispatchHandle;
use crate::error::{EngineError, Result, StateInvariantViolation};
use crate::metrics::{ProcessorMetrics, ReasonLabels, SeverityLabels};
use crate::normalizer::{DedupFilter, RejectReason};
use crate::watermark::{KeyedWatermarkTracker, Watermark};
use crate::window::{Advance, WindowManager};

/// Per-lane processing counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStats {
    /// Readings folded into the pipeline after deduplication
    pub readings: u64,
    /// Readings refused by the lane itself (non-finite values)
    pub rejected: u64,
    pub duplicates: u64,
    /// Readings diverted to the late side-output
    pub late: u64,
    pub windows_opened: u64,
    pub windows_closed: u64,
    pub windows_evicted: u64,
    pub alerts: u64,
    pub violations: u64,
    /// Silent series whose state was released
    pub series_retired: u64,
}

impl LaneStats {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AddAssign for LaneStats {
    fn add_assign(&mut self, other: Self) {
        self.readings += other.readings;
        self.rejected += other.rejected;
        self.duplicates += other.duplicates;
        self.late += other.late;
        self.windows_opened += other.windows_opened;
        self.windows_closed += other.windows_closed;
        self.windows_evicted += other.windows_evicted;
        self.alerts += other.alerts;
        self.violations += other.violations;
        self.series_retired += other.series_retired;
    }
}

/// Work item delivered to a lane task
#[derive(Debug, Clone)]
pub enum LaneMessage {
    /// A validated reading
    Reading(Reading),
    /// Processing-time tick used to advance idle keys
    Tick(DateTime<Utc>),
}

/// Single-threaded processing state for one lane
#[derive(Debug)]
pub struct Lane {
    id: usize,
    dedup: DedupFilter,
    watermarks: KeyedWatermarkTracker,
    windows: WindowManager,
    detector: AnomalyDetector,
    metrics: ProcessorMetrics,
    stats: LaneStats,
}

impl Lane {
    pub fn new(id: usize, config: &PipelineConfig, metrics: ProcessorMetrics) -> Result<Self> {
        let windows = WindowManager::new(&config.window, config.engine.percentile_compression)?;
        let detector = AnomalyDetector::new(&config.anomaly, windows.window_size_ms());

        Ok(Self {
            id,
            dedup: DedupFilter::new(
                config.normalizer.dedup_window,
                config.normalizer.max_dedup_entries,
            ),
            watermarks: KeyedWatermarkTracker::new(
                config.watermark.max_out_of_orderness,
                config.watermark.idle_timeout,
            ),
            windows,
            detector,
            metrics,
            stats: LaneStats::new(),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> LaneStats {
        self.stats
    }

    /// Current watermark of `key`
    pub fn watermark(&self, key: &SeriesKey) -> Watermark {
        self.watermarks.current(key)
    }

    pub fn windows(&self) -> &WindowManager {
        &self.windows
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    /// Series keys this lane currently keeps watermark state for
    pub fn tracked_series(&self) -> usize {
        self.watermarks.len()
    }

    /// Run one reading through dedup, watermarking, windowing, and detection
    ///
    /// Returns the outputs produced, in emission order: late side-outputs for
    /// this reading first, then each closed window's snapshot followed by the
    /// alerts it raised.
    pub fn process(&mut self, reading: Reading) -> Vec<Output> {
        let mut outputs = Vec::new();

        if !reading.value.is_finite() {
            debug!(
                lane = self.id,
                key = %reading.series_key(),
                value = reading.value,
                "non-finite reading rejected"
            );
            self.metrics
                .readings_rejected
                .get_or_create(&ReasonLabels::new(RejectReason::OutOfRange.as_str()))
                .inc();
            self.stats.rejected += 1;
            return outputs;
        }

        if let Err(rejection) = self.dedup.admit(&reading) {
            trace!(lane = self.id, detail = %rejection.detail, "duplicate reading dropped");
            self.metrics.readings_duplicate.inc();
            self.stats.duplicates += 1;
            return outputs;
        }
        self.metrics.readings_accepted.inc();
        self.stats.readings += 1;

        let key = reading.series_key();
        let watermark = self
            .watermarks
            .observe_at(&key, reading.event_time, reading.ingest_time);

        let assignment = match self.windows.assign(&reading, watermark) {
            Ok(assignment) => assignment,
            Err(err) => {
                warn!(lane = self.id, key = %key, error = %err, "window assignment failed");
                return outputs;
            }
        };

        for violation in &assignment.violations {
            self.record_violation(violation);
        }

        if assignment.opened > 0 {
            self.metrics.windows_opened.inc_by(assignment.opened as u64);
            self.metrics.open_windows.inc_by(assignment.opened as i64);
            self.stats.windows_opened += assignment.opened as u64;
        }

        for window in &assignment.windows {
            if let Err(err) = self.windows.update(window, &reading) {
                warn!(lane = self.id, window = %window, error = %err, "window update rejected");
                self.metrics.state_invariant_violations.inc();
                self.stats.violations += 1;
            }
        }

        for late in assignment.late {
            debug!(
                lane = self.id,
                key = %key,
                event_time = %late.reading.event_time,
                watermark = late.watermark.timestamp,
                reason = late.reason.as_str(),
                "late reading"
            );
            self.metrics
                .late_events
                .get_or_create(&ReasonLabels::new(late.reason.as_str()))
                .inc();
            self.stats.late += 1;
            outputs.push(Output::Late(late));
        }

        let advance = self.windows.advance(&key, watermark);
        self.on_advance(advance, reading.ingest_time, &mut outputs);
        outputs
    }

    /// Advance idle keys by processing time and close what that releases
    ///
    /// A key whose windows have all been evicted and that has stayed silent
    /// for the eviction horizon is retired from every per-key table.
    pub fn on_tick(&mut self, now: DateTime<Utc>) -> Vec<Output> {
        let mut outputs = Vec::new();
        let retention_ms = self.windows.retention_ms();
        for (key, watermark) in self.watermarks.advance_idle(now) {
            trace!(lane = self.id, key = %key, watermark = %watermark, "idle key advanced");
            let advance = self.windows.advance(&key, watermark);
            self.on_advance(advance, now, &mut outputs);

            let expired = self
                .watermarks
                .idle_for(&key, now)
                .is_some_and(|idle| idle >= retention_ms);
            if expired && !self.windows.has_windows(&key) {
                self.retire(&key);
            }
        }
        outputs
    }

    /// Finalize every open window for shutdown
    pub fn drain(&mut self, now: DateTime<Utc>) -> Vec<Output> {
        let mut outputs = Vec::new();
        let drained = self.windows.drain();
        if !drained.closed.is_empty() {
            debug!(lane = self.id, windows = drained.closed.len(), "draining open windows");
        }
        self.on_advance(drained, now, &mut outputs);
        outputs
    }

    fn retire(&mut self, key: &SeriesKey) {
        self.windows.retire(key);
        self.watermarks.retire(key);
        self.detector.retire(key);
        self.stats.series_retired += 1;
        debug!(lane = self.id, key = %key, "silent series retired");
    }

    fn on_advance(&mut self, advance: Advance, now: DateTime<Utc>, outputs: &mut Vec<Output>) {
        for snapshot in advance.closed {
            self.emit_closed(snapshot, now, outputs);
        }
        if advance.discarded > 0 {
            self.metrics.open_windows.dec_by(advance.discarded as i64);
        }
        if advance.evicted > 0 {
            self.metrics.windows_evicted.inc_by(advance.evicted as u64);
            self.stats.windows_evicted += advance.evicted as u64;
        }
    }

    fn emit_closed(&mut self, snapshot: AggregateSnapshot, now: DateTime<Utc>, outputs: &mut Vec<Output>) {
        self.metrics.windows_closed.inc();
        self.metrics.open_windows.dec();
        self.stats.windows_closed += 1;

        let alerts = self.detector.evaluate(&snapshot, now);
        outputs.push(Output::Snapshot(snapshot));

        for alert in alerts {
            self.metrics
                .alerts_emitted
                .get_or_create(&SeverityLabels::new(alert.severity.to_string()))
                .inc();
            self.stats.alerts += 1;
            outputs.push(Output::Alert(alert));
        }
    }

    fn record_violation(&mut self, violation: &StateInvariantViolation) {
        warn!(lane = self.id, violation = %violation, "state invariant violation");
        self.metrics.state_invariant_violations.inc();
        self.stats.violations += 1;
    }
}

/// Start the task driving `lane`
///
/// The task consumes its queue until every sender is dropped, then drains
/// the lane's open windows and returns its counters. Every output is handed
/// to `dispatch` before the next message is read, so a slow dispatcher
/// stalls the lane and, once its queue fills, the submitter.
pub fn spawn_lane(
    mut lane: Lane,
    mut rx: mpsc::Receiver<LaneMessage>,
    dispatch: DispatchHandle,
) -> JoinHandle<std::result::Result<LaneStats, EngineError>> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let outputs = match message {
                LaneMessage::Reading(reading) => lane.process(reading),
                LaneMessage::Tick(now) => lane.on_tick(now),
            };
            for output in outputs {
                if let Err(err) = dispatch.emit(output).await {
                    error!(lane = lane.id(), error = %err, "dispatcher unavailable, stopping lane");
                    return Err(err);
                }
            }
        }

        for output in lane.drain(Utc::now()) {
            dispatch.emit(output).await?;
        }
        debug!(lane = lane.id(), readings = lane.stats().readings, "lane drained");
        Ok(lane.stats())
    })
}
