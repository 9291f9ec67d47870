use serde::{Deserialize, Serialize};

use super::trait_::Aggregator;
use crate::error::{AggregationError, AggregationResult};

/// Tracks the minimum and maximum value seen
///
/// # Examples
///
/// ```
/// use processor::aggregation::{Aggregator, MinMaxAggregator};
///
/// let mut agg = MinMaxAggregator::new();
/// agg.update(30.0);
/// agg.update(10.0);
/// agg.update(20.0);
///
/// assert_eq!(agg.finalize().unwrap(), (10.0, 30.0));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinMaxAggregator {
    min: Option<f64>,
    max: Option<f64>,
    count: u64,
}

impl MinMaxAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }
}

impl Aggregator for MinMaxAggregator {
    type Output = (f64, f64);

    fn update(&mut self, value: f64) {
        self.min = Some(self.min.map_or(value, |current| current.min(value)));
        self.max = Some(self.max.map_or(value, |current| current.max(value)));
        self.count += 1;
    }

    fn finalize(&self) -> AggregationResult<(f64, f64)> {
        match (self.min, self.max) {
            (Some(min), Some(max)) => Ok((min, max)),
            _ => Err(AggregationError::Empty {
                aggregation_type: "min/max".to_string(),
            }),
        }
    }

    fn merge(&mut self, other: &Self) {
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        self.count += other.count;
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn count(&self) -> u64 {
        self.count
    }
}
