//! Bounded-memory percentile estimation
//!
//! A merging t-digest: incoming values are buffered and periodically merged
//! into a sorted list of weighted centroids. Adjacent centroids are merged
//! only while they span at most one unit of the arcsine scale
//! `k(q) = compression / (2 * pi) * asin(2q - 1)`, so centroids near the tails
//! stay small and the median region absorbs most of the mass.
//!
//! Error bound: the rank error of an estimate at quantile `q` is at most
//! `pi * sqrt(q * (1 - q)) / compression`, half the widest centroid allowed
//! there. With the default compression of 100 that is about 1.6% of the count
//! at the median and 0.3% at p99; interpolation inside centroids is usually
//! far tighter. Windows of at most `compression / 2` values are never merged
//! and yield exact interpolated percentiles. Memory is bounded by about
//! `compression` centroids plus a buffer of `2 * compression` values,
//! independent of the window's count.

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use super::trait_::Aggregator;
use crate::error::{AggregationError, AggregationResult};

/// Default compression parameter
pub const DEFAULT_COMPRESSION: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct Centroid {
    mean: f64,
    weight: f64,
}

impl Centroid {
    fn absorb(&mut self, other: &Centroid) {
        let weight = self.weight + other.weight;
        self.mean += (other.mean - self.mean) * other.weight / weight;
        self.weight = weight;
    }
}

/// Merging t-digest
///
/// # Examples
///
/// ```
/// use processor::aggregation::{Aggregator, TDigest};
///
/// let mut digest = TDigest::new(100.0).unwrap();
/// for v in 1..=40 {
///     digest.update(v as f64);
/// }
///
/// let p50 = digest.quantile(0.5).unwrap();
/// assert!((p50 - 20.5).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TDigest {
    compression: f64,
    centroids: Vec<Centroid>,
    buffer: Vec<f64>,
    count: u64,
    min: f64,
    max: f64,
}

impl Default for TDigest {
    fn default() -> Self {
        Self {
            compression: DEFAULT_COMPRESSION,
            centroids: Vec::new(),
            buffer: Vec::new(),
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl TDigest {
    /// Create a digest with the given compression
    pub fn new(compression: f64) -> AggregationResult<Self> {
        if !compression.is_finite() || compression <= 0.0 {
            return Err(AggregationError::InvalidCompression(compression));
        }
        Ok(Self {
            compression,
            ..Self::default()
        })
    }

    pub fn compression(&self) -> f64 {
        self.compression
    }

    /// Number of centroids after merging any buffered values
    pub fn centroid_count(&self) -> usize {
        self.merged_view().len()
    }

    fn buffer_capacity(&self) -> usize {
        ((self.compression * 2.0).ceil() as usize).max(16)
    }

    /// Merge buffered values into the centroid list
    pub fn compress(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        self.centroids = self.merged_view();
        self.buffer.clear();
    }

    /// Centroids with the buffer folded in, without mutating the digest
    fn merged_view(&self) -> Vec<Centroid> {
        if self.buffer.is_empty() {
            return self.centroids.clone();
        }

        let mut all: Vec<Centroid> = Vec::with_capacity(self.centroids.len() + self.buffer.len());
        all.extend_from_slice(&self.centroids);
        all.extend(self.buffer.iter().map(|&mean| Centroid { mean, weight: 1.0 }));
        merge_centroids(all, self.compression)
    }

    /// Estimate the value at quantile `q` in `[0, 1]`
    pub fn quantile(&self, q: f64) -> AggregationResult<f64> {
        if !(0.0..=1.0).contains(&q) {
            return Err(AggregationError::InvalidQuantile(q));
        }
        if self.count == 0 {
            return Err(AggregationError::Empty {
                aggregation_type: "percentile".to_string(),
            });
        }

        let centroids = self.merged_view();
        Ok(interpolate(&centroids, q, self.min, self.max))
    }

    pub fn p50(&self) -> AggregationResult<f64> {
        self.quantile(0.50)
    }

    pub fn p95(&self) -> AggregationResult<f64> {
        self.quantile(0.95)
    }

    pub fn p99(&self) -> AggregationResult<f64> {
        self.quantile(0.99)
    }
}

fn merge_centroids(mut all: Vec<Centroid>, compression: f64) -> Vec<Centroid> {
    all.sort_by(|a, b| a.mean.total_cmp(&b.mean));

    let total: f64 = all.iter().map(|c| c.weight).sum();
    let mut merged: Vec<Centroid> = Vec::with_capacity(all.len());
    let mut iter = all.into_iter();

    let Some(mut current) = iter.next() else {
        return merged;
    };
    let mut weight_before = 0.0;
    let scale = |q: f64| compression / (2.0 * PI) * (2.0 * q - 1.0).clamp(-1.0, 1.0).asin();

    for next in iter {
        let proposed = current.weight + next.weight;
        let q_left = weight_before / total;
        let q_right = (weight_before + proposed) / total;

        if scale(q_right) - scale(q_left) <= 1.0 {
            current.absorb(&next);
        } else {
            weight_before += current.weight;
            merged.push(current);
            current = next;
        }
    }
    merged.push(current);
    merged
}

/// Interpolate between centroid centers, anchored at `min` and `max`
///
/// Centroid `i` is centered at cumulative rank `w_0 + .. + w_{i-1} + w_i / 2`.
/// For unit-weight centroids this reduces to midpoint interpolation over the
/// sorted values.
fn interpolate(centroids: &[Centroid], q: f64, min: f64, max: f64) -> f64 {
    let total: f64 = centroids.iter().map(|c| c.weight).sum();
    let target = q * total;

    if centroids.len() == 1 {
        let only = centroids[0];
        if only.weight <= 1.0 {
            return only.mean;
        }
    }

    let first = centroids[0];
    if target <= first.weight / 2.0 {
        let span = first.weight / 2.0;
        if span <= 0.0 {
            return min;
        }
        return min + (first.mean - min) * (target / span);
    }

    let mut cumulative = 0.0;
    for pair in centroids.windows(2) {
        let (left, right) = (pair[0], pair[1]);
        let left_center = cumulative + left.weight / 2.0;
        let right_center = cumulative + left.weight + right.weight / 2.0;

        if target <= right_center {
            let span = right_center - left_center;
            if span <= 0.0 {
                return left.mean;
            }
            let fraction = (target - left_center) / span;
            return left.mean + (right.mean - left.mean) * fraction;
        }
        cumulative += left.weight;
    }

    let last = centroids[centroids.len() - 1];
    let last_center = total - last.weight / 2.0;
    let span = total - last_center;
    if span <= 0.0 {
        return max;
    }
    let fraction = ((target - last_center) / span).clamp(0.0, 1.0);
    (last.mean + (max - last.mean) * fraction).clamp(min, max)
}

impl Aggregator for TDigest {
    type Output = (f64, f64, f64);

    fn update(&mut self, value: f64) {
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.buffer.push(value);

        if self.buffer.len() >= self.buffer_capacity() {
            self.compress();
        }
    }

    /// Returns `(p50, p95, p99)`
    fn finalize(&self) -> AggregationResult<(f64, f64, f64)> {
        if self.count == 0 {
            return Err(AggregationError::Empty {
                aggregation_type: "percentile".to_string(),
            });
        }
        let centroids = self.merged_view();
        Ok((
            interpolate(&centroids, 0.50, self.min, self.max),
            interpolate(&centroids, 0.95, self.min, self.max),
            interpolate(&centroids, 0.99, self.min, self.max),
        ))
    }

    fn merge(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        let mut all = self.merged_view();
        all.extend(other.merged_view());
        self.centroids = merge_centroids(all, self.compression);
        self.buffer.clear();
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    fn reset(&mut self) {
        *self = Self {
            compression: self.compression,
            ..Self::default()
        };
    }

    fn count(&self) -> u64 {
        self.count
    }
}
