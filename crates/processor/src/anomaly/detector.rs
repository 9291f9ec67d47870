use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use telemetry_config::AnomalyConfig;
use telemetry_types::{AggregateSnapshot, Alert, AnomalyRule, RuleKind, SeriesKey};
use tracing::info;
use uuid::Uuid;

use super::baseline::EwmaBaseline;

/// Evaluation state of one rule for one series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    /// Not evaluated yet
    New,
    /// Evaluated without firing
    Evaluated,
    /// Fired on the last evaluated window
    Alerted,
    /// Fired earlier and stopped firing on the last evaluated window
    Cleared,
}

#[derive(Debug, Clone, Copy)]
struct RuleTrack {
    state: RuleState,
    last_window_start: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct SeriesHistory {
    previous: Option<AggregateSnapshot>,
    baseline: EwmaBaseline,
    tracks: HashMap<String, RuleTrack>,
}

struct Finding {
    observed: f64,
    limit: f64,
    message: String,
}

/// Evaluates anomaly rules on each finalized window of the lane's keys
///
/// Per key it keeps exactly one prior snapshot (for rate-of-change) and an
/// exponentially weighted baseline of window means (for outlier rules). Rules
/// are evaluated before the history is updated, so the window under test
/// never contributes to the baseline it is judged against.
#[derive(Debug)]
pub struct AnomalyDetector {
    rules: Vec<AnomalyRule>,
    window_size_secs: f64,
    baseline_alpha: f64,
    baseline_min_windows: u64,
    history: HashMap<SeriesKey, SeriesHistory>,
}

impl AnomalyDetector {
    pub fn new(config: &AnomalyConfig, window_size_ms: i64) -> Self {
        Self {
            rules: config.rules.clone(),
            window_size_secs: window_size_ms as f64 / 1000.0,
            baseline_alpha: config.baseline_alpha,
            baseline_min_windows: config.baseline_min_windows,
            history: HashMap::new(),
        }
    }

    /// Forget the history of a series that went away
    pub fn retire(&mut self, key: &SeriesKey) -> bool {
        self.history.remove(key).is_some()
    }

    /// Series with evaluation history
    pub fn tracked_series(&self) -> usize {
        self.history.len()
    }

    /// Evaluate every rule bound to the snapshot's metric
    ///
    /// Emits at most one alert per (window, rule): a window already evaluated
    /// for a rule is skipped.
    pub fn evaluate(&mut self, snapshot: &AggregateSnapshot, now: DateTime<Utc>) -> Vec<Alert> {
        let key = snapshot.series_key();
        let alpha = self.baseline_alpha;
        let history = self
            .history
            .entry(key.clone())
            .or_insert_with(|| SeriesHistory {
                previous: None,
                baseline: EwmaBaseline::new(alpha),
                tracks: HashMap::new(),
            });

        let mut alerts = Vec::new();
        for rule in self.rules.iter().filter(|r| r.applies_to(&snapshot.metric_name)) {
            let track = history.tracks.entry(rule.id.clone()).or_insert(RuleTrack {
                state: RuleState::New,
                last_window_start: None,
            });
            if matches!(track.last_window_start, Some(last) if last >= snapshot.window_start) {
                continue;
            }

            let finding = match &rule.kind {
                RuleKind::Threshold {
                    low,
                    high,
                    statistic,
                } => threshold(snapshot, *low, *high, statistic.of(snapshot)),
                RuleKind::RateOfChange { max_rate } => rate_of_change(
                    snapshot,
                    history.previous.as_ref(),
                    *max_rate,
                    self.window_size_secs,
                ),
                RuleKind::StddevOutlier { k } => {
                    if history.baseline.count() < self.baseline_min_windows {
                        None
                    } else {
                        outlier(snapshot, &history.baseline, *k)
                    }
                }
            };

            track.last_window_start = Some(snapshot.window_start);
            match finding {
                Some(finding) => {
                    track.state = RuleState::Alerted;
                    info!(
                        key = %key,
                        rule_id = %rule.id,
                        severity = %rule.severity,
                        observed = finding.observed,
                        limit = finding.limit,
                        window_start = %snapshot.window_start,
                        "anomaly alert emitted"
                    );
                    alerts.push(Alert {
                        alert_id: Uuid::new_v4(),
                        source_id: snapshot.source_id.clone(),
                        metric_name: snapshot.metric_name.clone(),
                        window_start: snapshot.window_start,
                        window_end: snapshot.window_end,
                        rule_id: rule.id.clone(),
                        rule_kind: rule.kind.name().to_string(),
                        observed_value: finding.observed,
                        limit: finding.limit,
                        severity: rule.severity,
                        triggered_at: now,
                        message: finding.message,
                    });
                }
                None if track.state == RuleState::Alerted => {
                    track.state = RuleState::Cleared;
                    info!(key = %key, rule_id = %rule.id, window_start = %snapshot.window_start, "alert cleared");
                }
                None => track.state = RuleState::Evaluated,
            }
        }

        let newer = history
            .previous
            .as_ref()
            .map_or(true, |prev| prev.window_start < snapshot.window_start);
        if newer {
            history.baseline.observe(snapshot.mean);
            history.previous = Some(snapshot.clone());
        }

        alerts
    }

    /// Current state of `rule_id` for `key`
    pub fn rule_state(&self, key: &SeriesKey, rule_id: &str) -> RuleState {
        self.history
            .get(key)
            .and_then(|h| h.tracks.get(rule_id))
            .map_or(RuleState::New, |t| t.state)
    }

    /// Baseline for `key`, if any window has been observed
    pub fn baseline(&self, key: &SeriesKey) -> Option<&EwmaBaseline> {
        self.history.get(key).map(|h| &h.baseline)
    }
}

fn threshold(
    snapshot: &AggregateSnapshot,
    low: Option<f64>,
    high: Option<f64>,
    observed: f64,
) -> Option<Finding> {
    if let Some(high) = high {
        if observed > high {
            return Some(Finding {
                observed,
                limit: high,
                message: format!(
                    "{} {} above threshold {}",
                    snapshot.metric_name, observed, high
                ),
            });
        }
    }
    if let Some(low) = low {
        if observed < low {
            return Some(Finding {
                observed,
                limit: low,
                message: format!(
                    "{} {} below threshold {}",
                    snapshot.metric_name, observed, low
                ),
            });
        }
    }
    None
}

fn rate_of_change(
    snapshot: &AggregateSnapshot,
    previous: Option<&AggregateSnapshot>,
    max_rate: f64,
    window_size_secs: f64,
) -> Option<Finding> {
    let previous = previous?;
    if window_size_secs <= 0.0 {
        return None;
    }
    let rate = (snapshot.mean - previous.mean).abs() / window_size_secs;
    (rate > max_rate).then(|| Finding {
        observed: rate,
        limit: max_rate,
        message: format!(
            "{} mean moved {} -> {} ({:.4}/s, limit {}/s)",
            snapshot.metric_name, previous.mean, snapshot.mean, rate, max_rate
        ),
    })
}

fn outlier(snapshot: &AggregateSnapshot, baseline: &EwmaBaseline, k: f64) -> Option<Finding> {
    let deviation = (snapshot.mean - baseline.mean()).abs();
    let limit = k * baseline.stddev();
    (deviation > limit).then(|| Finding {
        observed: snapshot.mean,
        limit,
        message: format!(
            "{} mean {} deviates {:.4} from baseline {:.4} (limit {:.4})",
            snapshot.metric_name,
            snapshot.mean,
            deviation,
            baseline.mean(),
            limit
        ),
    })
}
