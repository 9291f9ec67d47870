use serde::{Deserialize, Serialize};

use super::trait_::Aggregator;
use crate::error::{AggregationError, AggregationResult};

/// First and second moments of a window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    /// Sample variance (n - 1); zero when only one value was seen
    pub variance: f64,
    pub stddev: f64,
}

/// Count, sum, mean and variance in one pass
///
/// Mean and variance use Welford's online algorithm: the running mean and the
/// sum of squared deviations (`m2`) are updated per value, which avoids the
/// catastrophic cancellation of `E[x^2] - E[x]^2`. Partial states merge with
/// the parallel formula of Chan et al.
///
/// # Examples
///
/// ```
/// use processor::aggregation::{Aggregator, MomentsAggregator};
///
/// let mut agg = MomentsAggregator::new();
/// agg.update_batch(&[10.0, 12.0, 14.0, 16.0, 18.0]);
///
/// let moments = agg.finalize().unwrap();
/// assert_eq!(moments.mean, 14.0);
/// assert!((moments.stddev - 3.1622).abs() < 0.01);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MomentsAggregator {
    count: u64,
    sum: f64,
    mean: f64,
    m2: f64,
}

impl MomentsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.mean)
        }
    }

    /// Sample variance; zero for a single value
    pub fn variance(&self) -> Option<f64> {
        match self.count {
            0 => None,
            1 => Some(0.0),
            n => Some((self.m2 / (n - 1) as f64).max(0.0)),
        }
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }
}

impl Aggregator for MomentsAggregator {
    type Output = Moments;

    fn update(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    fn finalize(&self) -> AggregationResult<Moments> {
        let variance = self.variance().ok_or_else(|| AggregationError::Empty {
            aggregation_type: "moments".to_string(),
        })?;

        Ok(Moments {
            count: self.count,
            sum: self.sum,
            mean: self.mean,
            variance,
            stddev: variance.sqrt(),
        })
    }

    fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }

        let total = self.count + other.count;
        let delta = other.mean - self.mean;

        self.m2 += other.m2
            + delta * delta * (self.count as f64 * other.count as f64) / total as f64;
        self.mean += delta * other.count as f64 / total as f64;
        self.sum += other.sum;
        self.count = total;
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    fn count(&self) -> u64 {
        self.count
    }
}
