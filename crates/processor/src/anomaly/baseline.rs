use serde::{Deserialize, Serialize};

/// Exponentially weighted mean and variance of window means
///
/// With weight `alpha` for the newest observation:
///
/// > diff = x - mean
/// > mean = mean + alpha * diff
/// > var  = (1 - alpha) * (var + alpha * diff^2)
///
/// The first observation seeds the mean with zero variance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EwmaBaseline {
    alpha: f64,
    mean: f64,
    variance: f64,
    count: u64,
}

impl EwmaBaseline {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0),
            mean: 0.0,
            variance: 0.0,
            count: 0,
        }
    }

    pub fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.mean = value;
            self.variance = 0.0;
        } else {
            let diff = value - self.mean;
            let increment = self.alpha * diff;
            self.mean += increment;
            self.variance = (1.0 - self.alpha) * (self.variance + diff * increment);
        }
        self.count += 1;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn stddev(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }

    /// Number of observations folded in
    pub fn count(&self) -> u64 {
        self.count
    }
}
