//! Stream engine builder
//!
//! Collects configuration, sinks, and the dead-letter store, then starts the
//! lane, dispatcher, and ticker tasks.

use std::sync::Arc;
use telemetry_config::PipelineConfig;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use super::executor::{spawn_ticker, EngineHandle, EngineTasks};
use super::lane::{spawn_lane, Lane};
use crate::dispatch::{
    spawn_dispatcher, DeadLetterQueue, InMemoryDeadLetterQueue, OutputDispatcher, RetryPolicy, Sink,
};
use crate::error::Result;
use crate::metrics::{MetricsRegistry, ProcessorMetrics};
use crate::normalizer::Normalizer;

/// Builder for a running stream engine
///
/// # Example
///
/// ```rust,no_run
/// use processor::dispatch::MemorySink;
/// use processor::pipeline::StreamEngineBuilder;
/// use std::sync::Arc;
/// use telemetry_config::PipelineConfig;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let storage = Arc::new(MemorySink::new("storage"));
/// let mut engine = StreamEngineBuilder::new()
///     .with_name("greenhouse")
///     .with_config(PipelineConfig::default())
///     .with_sink(storage.clone())
///     .start()?;
///
/// engine
///     .submit(&serde_json::json!({
///         "sensor_id": "temperature_1",
///         "type": "temperature",
///         "value": 21.5,
///         "timestamp": "2024-01-01T12:00:00Z"
///     }))
///     .await?;
///
/// let report = engine.shutdown().await?;
/// assert_eq!(report.accepted, 1);
/// # Ok(())
/// # }
/// ```
pub struct StreamEngineBuilder {
    name: String,
    config: PipelineConfig,
    sinks: Vec<Arc<dyn Sink>>,
    dead_letters: Option<Arc<dyn DeadLetterQueue>>,
    registry: Option<MetricsRegistry>,
}

impl Default for StreamEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamEngineBuilder {
    pub fn new() -> Self {
        Self {
            name: "telemetry-pipeline".to_string(),
            config: PipelineConfig::default(),
            sinks: Vec::new(),
            dead_letters: None,
            registry: None,
        }
    }

    /// Set the engine name used in logs
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a sink; every output is offered to every sink
    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_sinks<I>(mut self, sinks: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Sink>>,
    {
        self.sinks.extend(sinks);
        self
    }

    /// Store for undeliverable outputs; defaults to an in-memory queue
    pub fn with_dead_letter_queue(mut self, dead_letters: Arc<dyn DeadLetterQueue>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    /// Register engine metrics in an existing registry
    pub fn with_metrics_registry(mut self, registry: MetricsRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate the configuration and start the engine
    ///
    /// Must be called from within a Tokio runtime. Configuration errors are
    /// returned before any task is spawned.
    pub fn start(self) -> Result<EngineHandle> {
        let config = self.config;
        config.validate()?;

        let registry = self.registry.unwrap_or_default();
        let metrics = ProcessorMetrics::register(&registry);
        let dead_letters = self
            .dead_letters
            .unwrap_or_else(|| Arc::new(InMemoryDeadLetterQueue::new()));

        let lane_count = config.engine.lanes;
        let lanes = (0..lane_count)
            .map(|id| Lane::new(id, &config, metrics.clone()))
            .collect::<Result<Vec<_>>>()?;

        let dispatcher = Arc::new(OutputDispatcher::new(
            self.sinks,
            Arc::clone(&dead_letters),
            RetryPolicy::from(&config.dispatcher.retry),
            metrics.clone(),
        ));

        let mut senders = Vec::with_capacity(lane_count);
        let mut lane_tasks = Vec::with_capacity(lane_count);
        let mut dispatcher_tasks = Vec::with_capacity(lane_count);

        for lane in lanes {
            let (dispatch, dispatcher_task) = spawn_dispatcher(
                lane.id(),
                Arc::clone(&dispatcher),
                config.dispatcher.channel_capacity,
            );
            let (tx, rx) = mpsc::channel(config.engine.lane_queue_capacity);
            lane_tasks.push(spawn_lane(lane, rx, dispatch));
            dispatcher_tasks.push(dispatcher_task);
            senders.push(tx);
        }

        let (ticker_stop, stop_rx) = oneshot::channel();
        let ticker = spawn_ticker(senders.clone(), config.engine.tick_interval, stop_rx);

        info!(
            engine = %self.name,
            lanes = lane_count,
            window = ?config.window.kind,
            window_size_ms = config.window.size_ms(),
            rules = config.anomaly.rules.len(),
            "stream engine started"
        );

        Ok(EngineHandle::new(
            Normalizer::new(&config.normalizer),
            senders,
            EngineTasks {
                ticker,
                ticker_stop,
                lanes: lane_tasks,
                dispatchers: dispatcher_tasks,
            },
            metrics,
            registry,
            dead_letters,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProcessorError;
    use std::time::Duration;

    #[tokio::test]
    async fn test_invalid_config_fails_before_start() {
        let mut config = PipelineConfig::default();
        config.engine.lanes = 0;

        let result = StreamEngineBuilder::new().with_config(config).start();
        assert!(matches!(result, Err(ProcessorError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_and_shutdown_without_input() {
        let mut config = PipelineConfig::default();
        config.engine.lanes = 2;
        config.engine.tick_interval = Duration::from_millis(10);

        let mut engine = StreamEngineBuilder::new().with_config(config).start().unwrap();
        assert_eq!(engine.lanes(), 2);

        let report = engine.shutdown().await.unwrap();
        assert_eq!(report.accepted, 0);
        assert_eq!(report.windows_closed, 0);
        assert!(engine.shutdown().await.is_err());
    }
}
