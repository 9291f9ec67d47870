//! Running engine: ingestion, timer ticks, and graceful shutdown

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telemetry_types::Reading;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, trace};

use super::lane::{LaneMessage, LaneStats};
use crate::core::route_lane;
use crate::dispatch::{DeadLetterQueue, DispatchStats};
use crate::error::EngineError;
use crate::metrics::{MetricsRegistry, ProcessorMetrics, ReasonLabels};
use crate::normalizer::{Normalizer, Rejection};

/// Result of submitting one raw message
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The reading was valid and queued on its lane
    Accepted,
    /// The message failed validation; it was counted and dropped
    Rejected(Rejection),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted)
    }
}

/// Totals of one engine run, returned by [`EngineHandle::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineReport {
    pub accepted: u64,
    pub rejected: u64,
    pub duplicates: u64,
    pub late: u64,
    pub windows_closed: u64,
    pub alerts: u64,
    pub violations: u64,
    pub outputs: u64,
    pub delivered: u64,
    pub retries: u64,
    pub dead_letters: u64,
}

impl EngineReport {
    fn from_parts(rejected: u64, lanes: LaneStats, dispatch: DispatchStats) -> Self {
        Self {
            accepted: lanes.readings,
            rejected: rejected + lanes.rejected,
            duplicates: lanes.duplicates,
            late: lanes.late,
            windows_closed: lanes.windows_closed,
            alerts: lanes.alerts,
            violations: lanes.violations,
            outputs: dispatch.outputs,
            delivered: dispatch.delivered,
            retries: dispatch.retries,
            dead_letters: dispatch.dead_lettered,
        }
    }
}

/// Background tasks owned by a running engine
pub(crate) struct EngineTasks {
    pub(crate) ticker: JoinHandle<()>,
    pub(crate) ticker_stop: oneshot::Sender<()>,
    pub(crate) lanes: Vec<JoinHandle<Result<LaneStats, EngineError>>>,
    pub(crate) dispatchers: Vec<JoinHandle<DispatchStats>>,
}

/// Handle to a running engine
///
/// Raw messages are validated on the caller's task and routed to the lane
/// owning their series key. `submit` waits while that lane's queue is full.
/// Dropping the handle without calling [`EngineHandle::shutdown`] stops
/// ingestion but discards the final drain report.
pub struct EngineHandle {
    normalizer: Normalizer,
    lanes: Vec<mpsc::Sender<LaneMessage>>,
    tasks: Option<EngineTasks>,
    metrics: ProcessorMetrics,
    registry: MetricsRegistry,
    dead_letters: Arc<dyn DeadLetterQueue>,
    rejected: AtomicU64,
}

impl EngineHandle {
    pub(crate) fn new(
        normalizer: Normalizer,
        lanes: Vec<mpsc::Sender<LaneMessage>>,
        tasks: EngineTasks,
        metrics: ProcessorMetrics,
        registry: MetricsRegistry,
        dead_letters: Arc<dyn DeadLetterQueue>,
    ) -> Self {
        Self {
            normalizer,
            lanes,
            tasks: Some(tasks),
            metrics,
            registry,
            dead_letters,
            rejected: AtomicU64::new(0),
        }
    }

    /// Validate a raw message and queue it on its lane
    ///
    /// Invalid messages are not errors: they are counted, logged, and
    /// reported as [`SubmitOutcome::Rejected`].
    pub async fn submit(&self, raw: &Value) -> Result<SubmitOutcome, EngineError> {
        if self.tasks.is_none() {
            return Err(EngineError::ShuttingDown);
        }

        match self.normalizer.validate(raw, Utc::now()) {
            Ok(reading) => {
                self.submit_reading(reading).await?;
                Ok(SubmitOutcome::Accepted)
            }
            Err(rejection) => {
                debug!(
                    reason = %rejection.reason,
                    detail = %rejection.detail,
                    "reading rejected"
                );
                self.metrics
                    .readings_rejected
                    .get_or_create(&ReasonLabels::new(rejection.reason.as_str()))
                    .inc();
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Ok(SubmitOutcome::Rejected(rejection))
            }
        }
    }

    /// Queue an already-validated reading on the lane owning its key
    ///
    /// Skips the normalizer; the lane still refuses non-finite values and
    /// counts them in the report's `rejected` total.
    pub async fn submit_reading(&self, reading: Reading) -> Result<(), EngineError> {
        if self.tasks.is_none() || self.lanes.is_empty() {
            return Err(EngineError::ShuttingDown);
        }

        let lane = route_lane(&reading.series_key(), self.lanes.len());
        self.lanes[lane]
            .send(LaneMessage::Reading(reading))
            .await
            .map_err(|_| EngineError::LaneClosed { lane })
    }

    /// Number of processing lanes
    pub fn lanes(&self) -> usize {
        self.lanes.len()
    }

    /// Messages rejected by validation so far
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn metrics_registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    pub fn dead_letter_queue(&self) -> Arc<dyn DeadLetterQueue> {
        Arc::clone(&self.dead_letters)
    }

    /// Stop accepting input, drain every lane, and flush the dispatchers
    ///
    /// Open windows are force-finalized and delivered before this returns.
    /// A second call returns [`EngineError::ShuttingDown`].
    pub async fn shutdown(&mut self) -> Result<EngineReport, EngineError> {
        let Some(tasks) = self.tasks.take() else {
            return Err(EngineError::ShuttingDown);
        };
        info!(lanes = self.lanes.len(), "shutting down stream engine");

        // The receiver may already be gone if the ticker exited on its own.
        let _ = tasks.ticker_stop.send(());
        tasks
            .ticker
            .await
            .map_err(|e| EngineError::Join(e.to_string()))?;

        self.lanes.clear();

        let mut first_error = None;
        let mut lane_totals = LaneStats::new();
        for (lane, task) in tasks.lanes.into_iter().enumerate() {
            match task.await {
                Ok(Ok(stats)) => lane_totals += stats,
                Ok(Err(err)) => {
                    error!(lane, error = %err, "lane stopped with error");
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    error!(lane, error = %err, "lane task failed");
                    first_error.get_or_insert(EngineError::Join(err.to_string()));
                }
            }
        }

        let mut dispatch_totals = DispatchStats::default();
        for (lane, task) in tasks.dispatchers.into_iter().enumerate() {
            match task.await {
                Ok(stats) => dispatch_totals += stats,
                Err(err) => {
                    error!(lane, error = %err, "dispatcher task failed");
                    first_error.get_or_insert(EngineError::Join(err.to_string()));
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        let report = EngineReport::from_parts(self.rejected(), lane_totals, dispatch_totals);
        info!(
            accepted = report.accepted,
            rejected = report.rejected,
            duplicates = report.duplicates,
            late = report.late,
            windows_closed = report.windows_closed,
            alerts = report.alerts,
            dead_letters = report.dead_letters,
            "stream engine stopped"
        );
        Ok(report)
    }
}

/// Start the periodic tick that lets lanes close windows of idle keys
///
/// Ticks are advisory: a lane whose queue is full skips the tick, since it
/// is busy with readings that advance watermarks anyway.
pub(crate) fn spawn_ticker(
    lanes: Vec<mpsc::Sender<LaneMessage>>,
    period: Duration,
    mut stop: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = interval.tick() => {
                    let now = Utc::now();
                    for (lane, tx) in lanes.iter().enumerate() {
                        match tx.try_send(LaneMessage::Tick(now)) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => trace!(lane, "lane busy, tick skipped"),
                            Err(TrySendError::Closed(_)) => return,
                        }
                    }
                }
            }
        }
        debug!("ticker stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_from_parts() {
        let lanes = LaneStats {
            readings: 10,
            rejected: 1,
            duplicates: 2,
            late: 1,
            windows_closed: 3,
            alerts: 1,
            ..LaneStats::default()
        };
        let dispatch = DispatchStats {
            outputs: 5,
            delivered: 9,
            retries: 2,
            dead_lettered: 1,
        };

        let report = EngineReport::from_parts(4, lanes, dispatch);
        assert_eq!(report.accepted, 10);
        assert_eq!(report.rejected, 5);
        assert_eq!(report.duplicates, 2);
        assert_eq!(report.windows_closed, 3);
        assert_eq!(report.delivered, 9);
        assert_eq!(report.dead_letters, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_sends_ticks_until_stopped() {
        let (tx, mut rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = oneshot::channel();
        let ticker = spawn_ticker(vec![tx], Duration::from_secs(1), stop_rx);

        time::sleep(Duration::from_millis(3_500)).await;
        stop_tx.send(()).unwrap();
        ticker.await.unwrap();

        let mut ticks = 0;
        while let Ok(message) = rx.try_recv() {
            assert!(matches!(message, LaneMessage::Tick(_)));
            ticks += 1;
        }
        assert_eq!(ticks, 3);
    }
}
