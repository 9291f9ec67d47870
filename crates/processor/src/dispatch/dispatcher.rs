use std::ops::AddAssign;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::dead_letter::{DeadLetterEntry, DeadLetterQueue};
use super::retry::RetryPolicy;
use super::sink::Sink;
use crate::core::Output;
use crate::error::EngineError;
use crate::metrics::{ProcessorMetrics, SinkLabels};

/// Delivery counters of one dispatcher
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Outputs received from the lane
    pub outputs: u64,
    /// Successful sink writes
    pub delivered: u64,
    /// Writes repeated after a transient failure
    pub retries: u64,
    /// Sink deliveries abandoned to the dead-letter queue
    pub dead_lettered: u64,
}

impl AddAssign for DispatchStats {
    fn add_assign(&mut self, other: Self) {
        self.outputs += other.outputs;
        self.delivered += other.delivered;
        self.retries += other.retries;
        self.dead_lettered += other.dead_lettered;
    }
}

/// Fans each output out to every sink that accepts it
///
/// Each sink is retried independently with bounded exponential backoff.
/// When the attempt budget is exhausted, or the sink reports a permanent
/// error, the output is written to the dead-letter queue for that sink and
/// the dispatcher moves on.
pub struct OutputDispatcher {
    sinks: Vec<Arc<dyn Sink>>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    policy: RetryPolicy,
    metrics: ProcessorMetrics,
}

impl OutputDispatcher {
    pub fn new(
        sinks: Vec<Arc<dyn Sink>>,
        dead_letters: Arc<dyn DeadLetterQueue>,
        policy: RetryPolicy,
        metrics: ProcessorMetrics,
    ) -> Self {
        Self {
            sinks,
            dead_letters,
            policy,
            metrics,
        }
    }

    /// Deliver one output to all accepting sinks
    pub async fn deliver(&self, output: &Output) -> DispatchStats {
        let mut stats = DispatchStats {
            outputs: 1,
            ..Default::default()
        };

        for sink in self.sinks.iter().filter(|s| s.accepts(output)) {
            stats += self.deliver_to(sink.as_ref(), output).await;
        }
        stats
    }

    async fn deliver_to(&self, sink: &dyn Sink, output: &Output) -> DispatchStats {
        let mut stats = DispatchStats::default();
        let labels = SinkLabels::new(sink.name());
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let err = match sink.write(output).await {
                Ok(()) => {
                    self.metrics.sink_deliveries.get_or_create(&labels).inc();
                    if attempt > 1 {
                        debug!(sink = sink.name(), attempts = attempt, "sink write succeeded after retry");
                    }
                    stats.delivered += 1;
                    return stats;
                }
                Err(err) => err,
            };

            if err.is_retryable() && self.policy.should_retry(attempt) {
                let backoff = self.policy.backoff(attempt);
                warn!(
                    sink = sink.name(),
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "sink write failed, retrying"
                );
                self.metrics.sink_retries.get_or_create(&labels).inc();
                stats.retries += 1;
                tokio::time::sleep(backoff).await;
                continue;
            }

            error!(
                sink = sink.name(),
                attempts = attempt,
                kind = %output.kind(),
                error = %err,
                "delivery failed, writing to dead-letter queue"
            );
            let entry = DeadLetterEntry::new(sink.name(), output.clone(), err.to_string(), attempt);
            if let Err(dlq_err) = self.dead_letters.push(entry).await {
                error!(sink = sink.name(), error = %dlq_err, "failed to write dead-letter entry");
            }
            self.metrics.dead_letters.get_or_create(&labels).inc();
            stats.dead_lettered += 1;
            return stats;
        }
    }

    /// Flush every sink
    pub async fn flush(&self) {
        for sink in &self.sinks {
            if let Err(err) = sink.flush().await {
                warn!(sink = sink.name(), error = %err, "sink flush failed");
            }
        }
    }
}

/// Sending half of a lane's bounded dispatch channel
///
/// `emit` waits while the channel is full, which is how backpressure
/// reaches the lane and, through the lane's own queue, the ingestion side.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    lane: usize,
    tx: mpsc::Sender<Output>,
}

impl DispatchHandle {
    /// Queue an output for delivery; completes once the dispatcher has accepted it
    pub async fn emit(&self, output: Output) -> Result<(), EngineError> {
        self.tx
            .send(output)
            .await
            .map_err(|_| EngineError::DispatcherClosed { lane: self.lane })
    }

    pub fn lane(&self) -> usize {
        self.lane
    }
}

/// Start the dispatcher task for `lane`
///
/// The task delivers outputs in the order they were emitted and, once every
/// handle is dropped, flushes the sinks and returns its counters.
pub fn spawn_dispatcher(
    lane: usize,
    dispatcher: Arc<OutputDispatcher>,
    capacity: usize,
) -> (DispatchHandle, JoinHandle<DispatchStats>) {
    let (tx, mut rx) = mpsc::channel::<Output>(capacity.max(1));

    let task = tokio::spawn(async move {
        let mut stats = DispatchStats::default();
        while let Some(output) = rx.recv().await {
            stats += dispatcher.deliver(&output).await;
        }
        dispatcher.flush().await;
        debug!(lane, outputs = stats.outputs, "dispatcher drained");
        stats
    });

    (DispatchHandle { lane, tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::OutputKind;
    use crate::dispatch::dead_letter::InMemoryDeadLetterQueue;
    use crate::dispatch::sink::{MemorySink, OutputFilter};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use telemetry_types::{AggregateSnapshot, CloseTrigger};

    fn snapshot(window: i64) -> Output {
        Output::Snapshot(AggregateSnapshot {
            source_id: "temperature_1".to_string(),
            metric_name: "temperature".to_string(),
            window_start: Utc.timestamp_opt(window * 60, 0).unwrap(),
            window_end: Utc.timestamp_opt(window * 60 + 60, 0).unwrap(),
            count: 1,
            sum: 20.0,
            mean: 20.0,
            min: 20.0,
            max: 20.0,
            variance: 0.0,
            stddev: 0.0,
            p50: 20.0,
            p95: 20.0,
            p99: 20.0,
            trigger: CloseTrigger::Watermark,
            tags: BTreeMap::new(),
        })
    }

    fn dispatcher(
        sinks: Vec<Arc<dyn Sink>>,
        dlq: Arc<InMemoryDeadLetterQueue>,
        max_attempts: u32,
    ) -> OutputDispatcher {
        OutputDispatcher::new(
            sinks,
            dlq,
            RetryPolicy::new(Duration::from_millis(200), Duration::from_secs(10), max_attempts),
            ProcessorMetrics::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_goes_to_dead_letter() {
        let sink = Arc::new(MemorySink::new("storage"));
        sink.fail_next(10);
        let dlq = Arc::new(InMemoryDeadLetterQueue::new());
        let dispatcher = dispatcher(vec![sink.clone() as Arc<dyn Sink>], dlq.clone(), 3);

        let started = tokio::time::Instant::now();
        let stats = dispatcher.deliver(&snapshot(0)).await;

        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(sink.attempts(), 3);
        // 200ms + 400ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(600));

        let entries = dlq.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].sink, "storage");
        assert_eq!(entries[0].attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_skips_retries() {
        let sink = Arc::new(MemorySink::new("alerts").rejecting());
        let dlq = Arc::new(InMemoryDeadLetterQueue::new());
        let dispatcher = dispatcher(vec![sink.clone() as Arc<dyn Sink>], dlq.clone(), 5);

        let stats = dispatcher.deliver(&snapshot(0)).await;
        assert_eq!(stats.retries, 0);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(sink.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sinks_fail_independently() {
        let healthy = Arc::new(MemorySink::new("storage"));
        let broken = Arc::new(MemorySink::new("mirror").rejecting());
        let filtered = Arc::new(
            MemorySink::new("alerts").with_filter(OutputFilter::only(OutputKind::Alert)),
        );
        let dlq = Arc::new(InMemoryDeadLetterQueue::new());
        let dispatcher = dispatcher(
            vec![
                healthy.clone() as Arc<dyn Sink>,
                broken.clone() as Arc<dyn Sink>,
                filtered.clone() as Arc<dyn Sink>,
            ],
            dlq.clone(),
            5,
        );

        let stats = dispatcher.deliver(&snapshot(0)).await;
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(healthy.records().len(), 1);
        assert_eq!(filtered.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_preserves_order_and_drains() {
        let sink = Arc::new(MemorySink::new("storage"));
        let dlq = Arc::new(InMemoryDeadLetterQueue::new());
        let dispatcher = Arc::new(dispatcher(vec![sink.clone() as Arc<dyn Sink>], dlq, 5));

        let (handle, task) = spawn_dispatcher(0, dispatcher, 2);
        for window in 0..5 {
            handle.emit(snapshot(window)).await.unwrap();
        }
        drop(handle);

        let stats = task.await.unwrap();
        assert_eq!(stats.outputs, 5);
        assert_eq!(stats.delivered, 5);

        let starts: Vec<i64> = sink
            .records()
            .iter()
            .map(|o| match o {
                Output::Snapshot(s) => s.window_start.timestamp(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(starts, vec![0, 60, 120, 180, 240]);
    }
}
