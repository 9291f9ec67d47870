//! Stream-processing core for sensor telemetry
//!
//! Raw sensor messages are normalized into [`Reading`]s, grouped per series
//! into event-time windows closed by per-key watermarks, reduced to
//! [`AggregateSnapshot`]s, checked against anomaly rules, and dispatched to
//! downstream sinks with retry and dead-lettering.

pub mod aggregation;
pub mod anomaly;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod normalizer;
pub mod pipeline;
pub mod watermark;
pub mod window;

pub use telemetry_types::{AggregateSnapshot, Alert, CloseTrigger, Reading, SeriesKey};

pub use crate::core::{route_lane, Output, OutputKind};

pub use error::{
    AggregationError, DeadLetterError, EngineError, ProcessorError, Result as ProcessorResult,
    SinkError, StateInvariantViolation, WindowError,
};

pub use aggregation::{AggregateState, Aggregator, TDigest};
pub use anomaly::{AnomalyDetector, EwmaBaseline, RuleState};
pub use dispatch::{
    DeadLetterEntry, DeadLetterQueue, FileDeadLetterQueue, FileSink, InMemoryDeadLetterQueue,
    MemorySink, OutputDispatcher, OutputFilter, RetryPolicy, Sink, SinkEncoding, StoragePoint,
};
pub use metrics::{MetricsRegistry, ProcessorMetrics};
pub use normalizer::{DedupFilter, Normalizer, RejectReason, Rejection};
pub use pipeline::{EngineHandle, EngineReport, Lane, StreamEngineBuilder, SubmitOutcome};
pub use watermark::{KeyedWatermarkTracker, Watermark};
pub use window::{
    LateEvent, LateReason, SlidingWindowAssigner, TumblingWindowAssigner, WindowAssigner,
    WindowBounds, WindowManager, WindowState,
};
