//! Engine runtime
//!
//! Readings are validated at submission, then routed by
//! `hash(source_id, metric_name)` to one of N lanes. Each lane owns the
//! windows, watermarks, and anomaly history of its keys and feeds its own
//! dispatcher through a bounded channel. A periodic tick advances idle keys,
//! and shutdown drains every open window before the dispatchers are flushed.
//!
//! # Example
//!
//! ```rust,no_run
//! use processor::pipeline::StreamEngineBuilder;
//! use telemetry_config::PipelineConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::load(None)?;
//! let mut engine = StreamEngineBuilder::new().with_config(config).start()?;
//! // engine.submit(&raw).await?;
//! let report = engine.shutdown().await?;
//! println!("{} windows closed", report.windows_closed);
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod executor;
pub mod lane;

pub use builder::StreamEngineBuilder;
pub use executor::{EngineHandle, EngineReport, SubmitOutcome};
pub use lane::{spawn_lane, Lane, LaneMessage, LaneStats};
