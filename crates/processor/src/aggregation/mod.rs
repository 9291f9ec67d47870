//! Incremental aggregation over window values
//!
//! Every aggregator is single pass and never retains raw values:
//!
//! - [`MomentsAggregator`]: count, sum, mean and sample variance (Welford)
//! - [`MinMaxAggregator`]: extremes
//! - [`TDigest`]: bounded-memory p50/p95/p99 estimates
//!
//! [`AggregateState`] bundles the three for one window and turns them into an
//! [`AggregateSnapshot`](telemetry_types::AggregateSnapshot) on close.
//!
//! ```rust
//! use processor::aggregation::{Aggregator, MomentsAggregator};
//!
//! let mut left = MomentsAggregator::new();
//! left.update_batch(&[1.0, 2.0, 3.0]);
//!
//! let mut right = MomentsAggregator::new();
//! right.update_batch(&[4.0, 5.0, 6.0]);
//!
//! left.merge(&right);
//! assert_eq!(left.finalize().unwrap().sum, 21.0);
//! ```

pub mod minmax;
pub mod moments;
pub mod percentile;
pub mod state;
mod trait_;

pub use minmax::MinMaxAggregator;
pub use moments::{Moments, MomentsAggregator};
pub use percentile::{TDigest, DEFAULT_COMPRESSION};
pub use state::AggregateState;
pub use trait_::Aggregator;
