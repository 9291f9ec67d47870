use std::fmt::Debug;

use crate::error::AggregationResult;

/// Core trait for incremental aggregators
///
/// Aggregators consume values one at a time in a single pass and never
/// retain the raw values, so state stays bounded regardless of how many
/// readings a window receives.
pub trait Aggregator: Send + Sync + Debug {
    /// The type of the final aggregation result
    type Output;

    /// Update the aggregator with a new value
    fn update(&mut self, value: f64);

    /// Update with multiple values at once
    fn update_batch(&mut self, values: &[f64]) {
        for value in values {
            self.update(*value);
        }
    }

    /// Compute the final aggregation result
    fn finalize(&self) -> AggregationResult<Self::Output>;

    /// Merge another aggregator of the same kind into this one
    fn merge(&mut self, other: &Self)
    where
        Self: Sized;

    /// Reset the aggregator to initial state
    fn reset(&mut self);

    /// Get the number of values processed so far
    fn count(&self) -> u64;

    /// Check if the aggregator has processed any values
    fn is_empty(&self) -> bool {
        self.count() == 0
    }
}
