//! Windowing for per-series stream aggregation
//!
//! ## Tumbling Windows
//! Fixed-size, non-overlapping windows. Each event belongs to exactly one window.
//!
//! ```text
//! Time:     0----5----10---15---20---25---30
//! Windows:  [----][----][----][----][----]
//! ```
//!
//! ## Sliding Windows
//! Fixed-size, overlapping windows advancing by a stride. Events can belong
//! to multiple windows.
//!
//! ```text
//! Time:     0----5----10---15---20---25---30
//! Windows:  [----------]
//!                [----------]
//!                     [----------]
//! ```
//!
//! The [`WindowManager`] owns every window of the keys routed to its lane and
//! drives the lifecycle `Open -> Closing -> Closed -> Evicted` from watermark
//! updates.

pub mod assigner;
pub mod manager;
pub mod types;

pub use assigner::{SlidingWindowAssigner, TumblingWindowAssigner, WindowAssigner};
pub use manager::{Advance, Assignment, WindowManager, WindowRecord};
pub use types::{LateEvent, LateReason, WindowBounds, WindowRef, WindowState};
