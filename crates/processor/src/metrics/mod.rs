//! Prometheus metrics for the stream processor
//!
//! Dropped, late and dead-lettered data is always counted here, never lost
//! silently.

mod labels;
mod registry;

pub use labels::{ReasonLabels, SeverityLabels, SinkLabels};
pub use registry::MetricsRegistry;

use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use thiserror::Error;

/// Errors that can occur in the metrics subsystem
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metric encoding error: {0}")]
    EncodingError(String),
}

/// Counters and gauges shared by every lane and dispatcher of an engine
#[derive(Debug, Clone, Default)]
pub struct ProcessorMetrics {
    pub readings_accepted: Counter,
    pub readings_rejected: Family<ReasonLabels, Counter>,
    pub readings_duplicate: Counter,
    pub late_events: Family<ReasonLabels, Counter>,
    pub windows_opened: Counter,
    pub windows_closed: Counter,
    pub windows_evicted: Counter,
    pub open_windows: Gauge,
    pub alerts_emitted: Family<SeverityLabels, Counter>,
    pub state_invariant_violations: Counter,
    pub sink_retries: Family<SinkLabels, Counter>,
    pub sink_deliveries: Family<SinkLabels, Counter>,
    pub dead_letters: Family<SinkLabels, Counter>,
}

impl ProcessorMetrics {
    /// Create the metric set and register it
    pub fn register(registry: &MetricsRegistry) -> Self {
        let metrics = Self::default();
        registry.register_with(|registry| {
            registry.register(
                "readings_accepted",
                "Readings that passed validation and deduplication",
                metrics.readings_accepted.clone(),
            );
            registry.register(
                "readings_rejected",
                "Readings rejected by validation, by reason",
                metrics.readings_rejected.clone(),
            );
            registry.register(
                "readings_duplicate",
                "Readings dropped as duplicates inside the dedup window",
                metrics.readings_duplicate.clone(),
            );
            registry.register(
                "late_events",
                "Readings routed to the late side-output, by reason",
                metrics.late_events.clone(),
            );
            registry.register(
                "windows_opened",
                "Windows created",
                metrics.windows_opened.clone(),
            );
            registry.register(
                "windows_closed",
                "Windows finalized and emitted",
                metrics.windows_closed.clone(),
            );
            registry.register(
                "windows_evicted",
                "Closed windows whose state was freed",
                metrics.windows_evicted.clone(),
            );
            registry.register(
                "open_windows",
                "Windows currently accepting updates",
                metrics.open_windows.clone(),
            );
            registry.register(
                "alerts_emitted",
                "Anomaly alerts emitted, by severity",
                metrics.alerts_emitted.clone(),
            );
            registry.register(
                "state_invariant_violations",
                "Updates dropped because they targeted a closed or evicted window",
                metrics.state_invariant_violations.clone(),
            );
            registry.register(
                "sink_retries",
                "Sink writes retried after a transient failure",
                metrics.sink_retries.clone(),
            );
            registry.register(
                "sink_deliveries",
                "Outputs successfully written to a sink",
                metrics.sink_deliveries.clone(),
            );
            registry.register(
                "dead_letters",
                "Outputs written to the dead-letter queue",
                metrics.dead_letters.clone(),
            );
        });

        metrics
    }
}
