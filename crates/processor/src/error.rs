//! Error types for the stream processor
//!
//! Validation failures and late data are not errors at this level: they are
//! routed to side-outputs and counted. The types here cover window and
//! aggregation misuse, sink delivery, the dead-letter store, and the engine
//! runtime. Only configuration errors are fatal.

use telemetry_config::ConfigError;
use telemetry_types::SeriesKey;
use thiserror::Error;

/// Main processor error type
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Configuration errors (fatal at startup)
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Window-related errors
    #[error("window error: {0}")]
    Window(#[from] WindowError),

    /// Aggregation-related errors
    #[error("aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Window state was used in a way its lifecycle forbids
    #[error("state invariant violation: {0}")]
    StateInvariant(#[from] StateInvariantViolation),

    /// Downstream sink failures
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Dead-letter store failures
    #[error("dead-letter error: {0}")]
    DeadLetter(#[from] DeadLetterError),

    /// Engine runtime errors
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Window assignment errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WindowError {
    /// Window size is invalid
    #[error("invalid window size: {size}ms, must be greater than 0")]
    InvalidWindowSize { size: i64 },

    /// Slide size is invalid for sliding windows
    #[error("invalid slide size: {slide}ms, must be greater than 0 and less than or equal to window size {window}ms")]
    InvalidSlideSize { slide: i64, window: i64 },

    /// Event timestamp cannot be represented as a window bound
    #[error("invalid event timestamp: {timestamp}, reason: {reason}")]
    InvalidTimestamp { timestamp: i64, reason: String },

    /// Reading value is NaN or infinite
    #[error("non-finite value {value} for {key}")]
    NonFiniteValue { key: String, value: f64 },
}

/// A window lifecycle rule was broken
///
/// These indicate a lateness/grace-period misconfiguration rather than a
/// crash condition: the offending update is logged and dropped.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateInvariantViolation {
    /// Update attempted on a window that has already been finalized
    #[error("update on closed window {key}@{window_start}")]
    UpdateOnClosedWindow { key: SeriesKey, window_start: i64 },

    /// Update attempted on a window whose state has been freed
    #[error("update on evicted window {key}@{window_start} (evicted through {evicted_through})")]
    UpdateOnEvictedWindow {
        key: SeriesKey,
        window_start: i64,
        evicted_through: i64,
    },

    /// Update referenced a window that was never opened
    #[error("update on unknown window {key}@{window_start}")]
    UnknownWindow { key: SeriesKey, window_start: i64 },
}

/// Aggregation computation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    /// Finalize called before any value was added
    #[error("cannot finalize {aggregation_type} over zero values")]
    Empty { aggregation_type: String },

    /// Invalid metric value (NaN, Inf)
    #[error("invalid metric value: {value}, reason: {reason}")]
    InvalidValue { value: f64, reason: String },

    /// Quantile outside [0, 1]
    #[error("quantile must be between 0 and 1, got {0}")]
    InvalidQuantile(f64),

    /// Sketch configuration error
    #[error("invalid percentile compression: {0}")]
    InvalidCompression(f64),
}

/// Sink delivery errors
#[derive(Error, Debug)]
pub enum SinkError {
    /// Transient failure; the write may succeed if retried
    #[error("sink '{sink}' unavailable: {reason}")]
    Unavailable { sink: String, reason: String },

    /// Permanent failure; retrying the same payload cannot succeed
    #[error("sink '{sink}' rejected payload: {reason}")]
    Rejected { sink: String, reason: String },

    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink serialization error: {0}")]
    Serialization(String),
}

impl SinkError {
    /// Whether the dispatcher should retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Unavailable { .. } | SinkError::Io(_))
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        SinkError::Serialization(err.to_string())
    }
}

/// Dead-letter store errors
#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("dead-letter I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dead-letter serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DeadLetterError {
    fn from(err: serde_json::Error) -> Self {
        DeadLetterError::Serialization(err.to_string())
    }
}

/// Engine runtime errors
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine no longer accepts input
    #[error("engine is shutting down")]
    ShuttingDown,

    /// A lane task exited and its queue is closed
    #[error("lane {lane} is closed")]
    LaneClosed { lane: usize },

    /// The dispatcher channel for a lane is closed
    #[error("dispatcher for lane {lane} is closed")]
    DispatcherClosed { lane: usize },

    /// A background task panicked or was cancelled
    #[error("task join error: {0}")]
    Join(String),
}

/// Result type alias for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Result type alias for window operations
pub type WindowResult<T> = std::result::Result<T, WindowError>;

/// Result type alias for aggregation operations
pub type AggregationResult<T> = std::result::Result<T, AggregationError>;

/// Result type alias for sink operations
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Result type alias for dead-letter operations
pub type DeadLetterResult<T> = std::result::Result<T, DeadLetterError>;
