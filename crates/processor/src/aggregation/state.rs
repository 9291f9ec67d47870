use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use telemetry_types::{AggregateSnapshot, CloseTrigger, SeriesKey};

use super::minmax::MinMaxAggregator;
use super::moments::MomentsAggregator;
use super::percentile::TDigest;
use super::trait_::Aggregator;
use crate::error::{AggregationError, AggregationResult};

/// Incremental sufficient statistics for one window
///
/// Owned exclusively by its window record. Each update is O(1) for the
/// moments and extremes and O(log n) amortized for the digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    moments: MomentsAggregator,
    extremes: MinMaxAggregator,
    digest: TDigest,
}

impl AggregateState {
    pub fn new(compression: f64) -> AggregationResult<Self> {
        Ok(Self {
            moments: MomentsAggregator::new(),
            extremes: MinMaxAggregator::new(),
            digest: TDigest::new(compression)?,
        })
    }

    /// Fold one value into the state
    pub fn update(&mut self, value: f64) -> AggregationResult<()> {
        if !value.is_finite() {
            return Err(AggregationError::InvalidValue {
                value,
                reason: "value must be finite".to_string(),
            });
        }
        self.moments.update(value);
        self.extremes.update(value);
        self.digest.update(value);
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.moments.count()
    }

    pub fn is_empty(&self) -> bool {
        self.moments.is_empty()
    }

    /// Combine a partial state for the same window into this one
    ///
    /// The result summarizes the union of both value streams, as if every
    /// value had been folded into `self`.
    pub fn merge(&mut self, other: &AggregateState) {
        self.moments.merge(&other.moments);
        self.extremes.merge(&other.extremes);
        self.digest.merge(&other.digest);
    }

    /// Produce the immutable summary for a window
    pub fn finalize(
        &self,
        key: &SeriesKey,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        trigger: CloseTrigger,
        tags: &BTreeMap<String, String>,
    ) -> AggregationResult<AggregateSnapshot> {
        let moments = self.moments.finalize()?;
        let (min, max) = self.extremes.finalize()?;
        let (p50, p95, p99) = self.digest.finalize()?;

        Ok(AggregateSnapshot {
            source_id: key.source_id.clone(),
            metric_name: key.metric_name.clone(),
            window_start,
            window_end,
            count: moments.count,
            sum: moments.sum,
            mean: moments.mean,
            min,
            max,
            variance: moments.variance,
            stddev: moments.stddev,
            p50,
            p95,
            p99,
            trigger,
            tags: tags.clone(),
        })
    }
}
