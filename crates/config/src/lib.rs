//! Configuration management for the telemetry stream processor
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `TELEMETRY_`-prefixed environment variables (nested keys separated
//! by `__`, e.g. `TELEMETRY_ENGINE__LANES=8`). Every loaded configuration is
//! validated before any input is accepted; an invalid configuration is fatal.

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use telemetry_types::{AnomalyRule, RuleKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Main pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub window: WindowConfig,
    pub watermark: WatermarkConfig,
    pub normalizer: NormalizerConfig,
    pub anomaly: AnomalyConfig,
    pub dispatcher: DispatcherConfig,
    pub engine: EngineConfig,
}

impl PipelineConfig {
    /// Load configuration from an optional YAML file and the environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed("TELEMETRY_").split("__"));

        let config: PipelineConfig = figment
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        self.normalizer.validate()?;
        self.anomaly.validate()?;
        self.dispatcher.validate()?;
        self.engine.validate()?;
        Ok(())
    }
}

/// Window assignment strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Fixed-size non-overlapping windows
    Tumbling,
    /// Fixed-size windows advancing by a stride
    Sliding,
}

/// Window configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub kind: WindowKind,

    #[serde(with = "humantime_serde")]
    pub size: Duration,

    /// Stride between window starts (sliding windows only)
    #[serde(with = "humantime_serde")]
    pub slide: Option<Duration>,

    /// How far behind the watermark an event may be and still be assigned
    #[serde(with = "humantime_serde")]
    pub allowed_lateness: Duration,

    /// Extra retention for closed windows before their state is freed
    #[serde(with = "humantime_serde")]
    pub eviction_grace: Duration,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            kind: WindowKind::Tumbling,
            size: Duration::from_secs(60),
            slide: None,
            allowed_lateness: Duration::from_secs(30),
            eviction_grace: Duration::from_secs(60),
        }
    }
}

impl WindowConfig {
    /// Create a tumbling window configuration
    pub fn tumbling(size: Duration) -> Self {
        Self {
            kind: WindowKind::Tumbling,
            size,
            slide: None,
            ..Default::default()
        }
    }

    /// Create a sliding window configuration
    pub fn sliding(size: Duration, slide: Duration) -> Self {
        Self {
            kind: WindowKind::Sliding,
            size,
            slide: Some(slide),
            ..Default::default()
        }
    }

    pub fn size_ms(&self) -> i64 {
        self.size.as_millis() as i64
    }

    /// Effective stride: the slide for sliding windows, the size for tumbling windows
    pub fn stride_ms(&self) -> i64 {
        match (self.kind, self.slide) {
            (WindowKind::Sliding, Some(slide)) => slide.as_millis() as i64,
            _ => self.size_ms(),
        }
    }

    pub fn allowed_lateness_ms(&self) -> i64 {
        self.allowed_lateness.as_millis() as i64
    }

    pub fn eviction_grace_ms(&self) -> i64 {
        self.eviction_grace.as_millis() as i64
    }

    pub fn validate(&self) -> Result<()> {
        if self.size.as_millis() == 0 {
            return Err(invalid("window.size must be greater than 0"));
        }

        match self.kind {
            WindowKind::Tumbling => Ok(()),
            WindowKind::Sliding => {
                let slide = self
                    .slide
                    .ok_or_else(|| invalid("window.slide is required for sliding windows"))?;
                if slide.as_millis() == 0 {
                    return Err(invalid("window.slide must be greater than 0"));
                }
                if slide > self.size {
                    return Err(invalid(format!(
                        "window.slide ({:?}) must not exceed window.size ({:?})",
                        slide, self.size
                    )));
                }
                Ok(())
            }
        }
    }
}

/// Watermark configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatermarkConfig {
    /// Bound subtracted from the maximum observed event time
    #[serde(with = "humantime_serde")]
    pub max_out_of_orderness: Duration,

    /// Keys silent for this long have their watermark advanced by processing time
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        Self {
            max_out_of_orderness: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl WatermarkConfig {
    pub fn max_out_of_orderness_ms(&self) -> i64 {
        self.max_out_of_orderness.as_millis() as i64
    }

    pub fn idle_timeout_ms(&self) -> i64 {
        self.idle_timeout.as_millis() as i64
    }
}

/// Inclusive plausible range for a metric's values
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Normalizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Sliding window over which exact duplicates are dropped
    #[serde(with = "humantime_serde")]
    pub dedup_window: Duration,

    /// Tolerated amount by which `event_time` may lead the local clock
    #[serde(with = "humantime_serde")]
    pub max_clock_skew: Duration,

    /// Upper bound on remembered idempotency keys per lane
    pub max_dedup_entries: usize,

    /// Per-metric plausible ranges; metrics without an entry accept any finite value
    pub ranges: BTreeMap<String, ValueRange>,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        let mut ranges = BTreeMap::new();
        ranges.insert("temperature".to_string(), ValueRange::new(-40.0, 125.0));
        ranges.insert("humidity".to_string(), ValueRange::new(0.0, 100.0));
        ranges.insert("motion".to_string(), ValueRange::new(0.0, 1.0));

        Self {
            dedup_window: Duration::from_secs(300),
            max_clock_skew: Duration::from_secs(5),
            max_dedup_entries: 100_000,
            ranges,
        }
    }
}

impl NormalizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_dedup_entries == 0 {
            return Err(invalid("normalizer.max_dedup_entries must be greater than 0"));
        }

        for (metric, range) in &self.ranges {
            if !range.min.is_finite() || !range.max.is_finite() {
                return Err(invalid(format!(
                    "normalizer.ranges.{}: bounds must be finite",
                    metric
                )));
            }
            if range.min > range.max {
                return Err(invalid(format!(
                    "normalizer.ranges.{}: min {} is greater than max {}",
                    metric, range.min, range.max
                )));
            }
        }

        Ok(())
    }
}

/// Anomaly detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    pub rules: Vec<AnomalyRule>,

    /// Weight of the newest window in the exponentially weighted baseline
    pub baseline_alpha: f64,

    /// Windows folded into a baseline before outlier rules may fire
    pub baseline_min_windows: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            baseline_alpha: 0.1,
            baseline_min_windows: 5,
        }
    }
}

impl AnomalyConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.baseline_alpha > 0.0 && self.baseline_alpha <= 1.0) {
            return Err(invalid("anomaly.baseline_alpha must be in (0, 1]"));
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.id.is_empty() {
                return Err(invalid("anomaly rule id cannot be empty"));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(invalid(format!("duplicate anomaly rule id '{}'", rule.id)));
            }
            if rule.metric_name.is_empty() {
                return Err(invalid(format!("rule '{}': metric cannot be empty", rule.id)));
            }

            match &rule.kind {
                RuleKind::Threshold { low, high, .. } => match (low, high) {
                    (None, None) => {
                        return Err(invalid(format!(
                            "rule '{}': threshold needs a low or high bound",
                            rule.id
                        )))
                    }
                    (Some(low), Some(high)) if low > high => {
                        return Err(invalid(format!(
                            "rule '{}': low {} is greater than high {}",
                            rule.id, low, high
                        )))
                    }
                    _ => {}
                },
                RuleKind::RateOfChange { max_rate } => {
                    if !(*max_rate > 0.0) {
                        return Err(invalid(format!(
                            "rule '{}': max_rate must be positive",
                            rule.id
                        )));
                    }
                }
                RuleKind::StddevOutlier { k } => {
                    if !(*k > 0.0) {
                        return Err(invalid(format!("rule '{}': k must be positive", rule.id)));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Exponential backoff policy for sink delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "humantime_serde")]
    pub base: Duration,

    #[serde(with = "humantime_serde")]
    pub cap: Duration,

    /// Total delivery attempts, including the first
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            cap: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

/// Output dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub retry: RetryConfig,

    /// Capacity of the bounded channel between a lane and its dispatcher
    pub channel_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            channel_capacity: 1024,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(invalid("dispatcher.retry.max_attempts must be greater than 0"));
        }
        if self.retry.base > self.retry.cap {
            return Err(invalid("dispatcher.retry.base must not exceed dispatcher.retry.cap"));
        }
        if self.channel_capacity == 0 {
            return Err(invalid("dispatcher.channel_capacity must be greater than 0"));
        }
        Ok(())
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of processing lanes
    pub lanes: usize,

    /// Capacity of each lane's ingestion queue
    pub lane_queue_capacity: usize,

    /// Period of the timer tick that advances idle keys
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,

    /// t-digest compression used for percentile estimates
    pub percentile_compression: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lanes: 4,
            lane_queue_capacity: 1024,
            tick_interval: Duration::from_secs(1),
            percentile_compression: 100.0,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lanes == 0 {
            return Err(invalid("engine.lanes must be greater than 0"));
        }
        if self.lane_queue_capacity == 0 {
            return Err(invalid("engine.lane_queue_capacity must be greater than 0"));
        }
        if self.tick_interval.is_zero() {
            return Err(invalid("engine.tick_interval must be greater than 0"));
        }
        if !(self.percentile_compression > 0.0) {
            return Err(invalid("engine.percentile_compression must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use telemetry_types::{Severity, Statistic};

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatcher.retry.max_attempts, 5);
        assert_eq!(config.normalizer.dedup_window, Duration::from_secs(300));
        assert_eq!(config.window.stride_ms(), 60_000);
    }

    #[test]
    fn test_sliding_requires_valid_slide() {
        let mut window = WindowConfig::sliding(Duration::from_secs(60), Duration::from_secs(15));
        assert!(window.validate().is_ok());
        assert_eq!(window.stride_ms(), 15_000);

        window.slide = Some(Duration::from_secs(90));
        assert!(window.validate().is_err());

        window.slide = None;
        assert!(window.validate().is_err());
    }

    #[test]
    fn test_zero_window_size_is_rejected() {
        let window = WindowConfig::tumbling(Duration::ZERO);
        assert!(matches!(window.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_retry_base_above_cap_is_rejected() {
        let mut config = PipelineConfig::default();
        config.dispatcher.retry.base = Duration::from_secs(30);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_rule_needs_a_bound() {
        let mut config = PipelineConfig::default();
        config.anomaly.rules.push(AnomalyRule {
            id: "empty".to_string(),
            metric_name: "temperature".to_string(),
            kind: RuleKind::Threshold {
                low: None,
                high: None,
                statistic: Statistic::Mean,
            },
            severity: Severity::Warning,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_rule_ids_are_rejected() {
        let rule = AnomalyRule {
            id: "roc".to_string(),
            metric_name: "humidity".to_string(),
            kind: RuleKind::RateOfChange { max_rate: 1.0 },
            severity: Severity::Info,
        };
        let mut config = PipelineConfig::default();
        config.anomaly.rules = vec![rule.clone(), rule];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let mut config = PipelineConfig::default();
        config
            .normalizer
            .ranges
            .insert("pressure".to_string(), ValueRange::new(1100.0, 300.0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_yaml_with_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "pipeline.yaml",
                r#"
window:
  kind: sliding
  size: 60s
  slide: 20s
  allowed_lateness: 30s
watermark:
  max_out_of_orderness: 10s
anomaly:
  rules:
    - id: temp-high
      metric: temperature
      kind: threshold
      high: 100.0
      severity: critical
dispatcher:
  retry:
    base: 100ms
    cap: 5s
    max_attempts: 3
"#,
            )?;
            jail.set_env("TELEMETRY_ENGINE__LANES", "8");

            let config = PipelineConfig::load(Some(Path::new("pipeline.yaml")))
                .map_err(|e| e.to_string())?;

            assert_eq!(config.window.kind, WindowKind::Sliding);
            assert_eq!(config.window.stride_ms(), 20_000);
            assert_eq!(config.engine.lanes, 8);
            assert_eq!(config.dispatcher.retry.max_attempts, 3);
            assert_eq!(config.anomaly.rules.len(), 1);
            assert_eq!(config.anomaly.rules[0].severity, Severity::Critical);
            // Untouched sections keep their defaults
            assert_eq!(config.normalizer.max_dedup_entries, 100_000);
            Ok(())
        });
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        Jail::expect_with(|jail| {
            jail.create_file("bad.yaml", "engine:\n  lanes: 0\n")?;
            let result = PipelineConfig::load(Some(Path::new("bad.yaml")));
            assert!(matches!(result, Err(ConfigError::Invalid(_))));
            Ok(())
        });
    }
}
