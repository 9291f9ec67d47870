//! Core types and data models for the sensor telemetry pipeline
//!
//! This crate provides the records exchanged between the stream processor,
//! its configuration layer, and the downstream sinks.

pub mod aggregates;
pub mod alerts;
pub mod readings;
pub mod rules;

pub use aggregates::{AggregateSnapshot, CloseTrigger};
pub use alerts::Alert;
pub use readings::{Reading, SeriesKey};
pub use rules::{AnomalyRule, RuleKind, Severity, Statistic};
