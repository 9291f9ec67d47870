//! End-to-end tests for the stream processor
//!
//! Test Coverage:
//! - Window lifecycle driven by per-key watermarks
//! - Late readings and closed-window immutability
//! - Threshold, rate-of-change and outlier alerts
//! - Sink retry and dead-lettering
//! - Engine ingestion, routing and graceful shutdown
//! - Order independence and watermark monotonicity properties

use approx::assert_relative_eq;
use chrono::{DateTime, TimeZone, Utc};
use processor::dispatch::*;
use processor::pipeline::*;
use processor::watermark::*;
use processor::window::*;
use processor::{Output, OutputKind, ProcessorMetrics};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use telemetry_config::{PipelineConfig, WindowConfig};
use telemetry_types::{
    AggregateSnapshot, AnomalyRule, CloseTrigger, Reading, RuleKind, SeriesKey, Severity,
    Statistic,
};

// ============================================================================
// Helpers
// ============================================================================

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

fn reading(source: &str, event_secs: i64, value: f64) -> Reading {
    Reading::new(source, "temperature", value, at(event_secs), at(event_secs))
}

fn tumbling_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.window = WindowConfig::tumbling(Duration::from_secs(60));
    config.watermark.max_out_of_orderness = Duration::from_secs(10);
    config
}

fn lane(config: &PipelineConfig) -> Lane {
    Lane::new(0, config, ProcessorMetrics::default()).unwrap()
}

fn snapshots(outputs: &[Output]) -> Vec<AggregateSnapshot> {
    outputs
        .iter()
        .filter_map(|output| match output {
            Output::Snapshot(snapshot) => Some(snapshot.clone()),
            _ => None,
        })
        .collect()
}

fn alerts(outputs: &[Output]) -> Vec<telemetry_types::Alert> {
    outputs
        .iter()
        .filter_map(|output| match output {
            Output::Alert(alert) => Some(alert.clone()),
            _ => None,
        })
        .collect()
}

fn rule(id: &str, kind: RuleKind, severity: Severity) -> AnomalyRule {
    AnomalyRule {
        id: id.to_string(),
        metric_name: "temperature".to_string(),
        kind,
        severity,
    }
}

// ============================================================================
// WINDOW LIFECYCLE
// ============================================================================

mod window_lifecycle_tests {
    use super::*;

    #[test]
    fn test_out_of_order_readings_land_in_one_window() {
        let config = tumbling_config();
        let mut lane = lane(&config);

        let mut outputs = Vec::new();
        for (t, v) in [(20, 20.0), (5, 21.0), (58, 22.0), (45, 21.0)] {
            outputs.extend(lane.process(reading("temperature_1", t, v)));
        }
        assert!(outputs.is_empty());

        outputs.extend(lane.process(reading("temperature_1", 72, 23.0)));
        let closed = snapshots(&outputs);
        assert_eq!(closed.len(), 1);

        let snapshot = &closed[0];
        assert_eq!(snapshot.window_start, at(0));
        assert_eq!(snapshot.window_end, at(60));
        assert_eq!(snapshot.count, 4);
        assert_relative_eq!(snapshot.sum, 84.0);
        assert_relative_eq!(snapshot.mean, 21.0);
        assert_eq!(snapshot.min, 20.0);
        assert_eq!(snapshot.max, 22.0);
        assert_eq!(snapshot.trigger, CloseTrigger::Watermark);
    }

    #[test]
    fn test_keys_close_independently() {
        let config = tumbling_config();
        let mut lane = lane(&config);

        lane.process(reading("fast", 10, 20.0));
        lane.process(reading("slow", 10, 20.0));

        let outputs = lane.process(reading("fast", 90, 20.0));
        let closed = snapshots(&outputs);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].source_id, "fast");

        let slow = SeriesKey::new("slow", "temperature");
        assert_eq!(lane.windows().window_state(&slow, 0), Some(WindowState::Open));
    }

    #[test]
    fn test_sliding_windows_each_close_once() {
        let mut config = tumbling_config();
        config.window = WindowConfig::sliding(Duration::from_secs(60), Duration::from_secs(30));
        let mut lane = lane(&config);

        lane.process(reading("temperature_1", 40, 20.0));
        let outputs = lane.process(reading("temperature_1", 200, 20.0));

        let mut starts: Vec<_> = snapshots(&outputs)
            .into_iter()
            .filter(|s| s.count == 1)
            .map(|s| s.window_start)
            .collect();
        starts.sort();
        assert_eq!(starts, vec![at(0), at(30)]);
    }

    #[test]
    fn test_closed_windows_are_evicted_after_retention() {
        let config = tumbling_config();
        let mut lane = lane(&config);
        let key = SeriesKey::new("temperature_1", "temperature");

        lane.process(reading("temperature_1", 10, 20.0));
        lane.process(reading("temperature_1", 80, 20.0));
        assert_eq!(lane.windows().window_state(&key, 0), Some(WindowState::Closed));

        // end 60s + lateness 30s + grace 60s
        lane.process(reading("temperature_1", 161, 20.0));
        assert_eq!(lane.windows().window_state(&key, 0), Some(WindowState::Evicted));
        assert!(lane.windows().record(&key, 0).is_none());
        assert_eq!(lane.stats().windows_evicted, 1);
    }
}

// ============================================================================
// LATE DATA
// ============================================================================

mod late_data_tests {
    use super::*;

    #[test]
    fn test_late_reading_does_not_touch_closed_window() {
        let config = tumbling_config();
        let mut lane = lane(&config);
        let key = SeriesKey::new("temperature_1", "temperature");

        lane.process(reading("temperature_1", 30, 20.0));
        let outputs = lane.process(reading("temperature_1", 80, 21.0));
        let before = snapshots(&outputs);
        assert_eq!(before.len(), 1);
        assert_eq!(lane.watermark(&key), Watermark::new(70_000));

        let outputs = lane.process(reading("temperature_1", 39, 99.0));
        assert_eq!(outputs.len(), 1);
        match &outputs[0] {
            Output::Late(late) => {
                assert_eq!(late.reading.value, 99.0);
                assert_eq!(late.watermark, Watermark::new(70_000));
            }
            other => panic!("expected late output, got {other:?}"),
        }

        let record = lane.windows().record(&key, 0).unwrap();
        assert_eq!(record.state(), WindowState::Closed);
        assert_eq!(record.count(), 1);
        assert_eq!(lane.stats().late, 1);
    }

    #[test]
    fn test_reading_within_lateness_but_for_closed_window() {
        let mut config = tumbling_config();
        config.window.allowed_lateness = Duration::from_secs(60);
        let mut lane = lane(&config);

        lane.process(reading("temperature_1", 30, 20.0));
        lane.process(reading("temperature_1", 80, 21.0));

        let outputs = lane.process(reading("temperature_1", 50, 22.0));
        match &outputs[..] {
            [Output::Late(late)] => {
                assert_eq!(late.reason, LateReason::WindowClosed);
                assert_eq!(late.window.map(|w| w.start), Some(at(0)));
            }
            other => panic!("expected one late output, got {other:?}"),
        }
    }

    #[test]
    fn test_late_reading_for_open_window_is_folded_in() {
        let config = tumbling_config();
        let mut lane = lane(&config);
        let key = SeriesKey::new("temperature_1", "temperature");

        lane.process(reading("temperature_1", 65, 20.0));
        lane.process(reading("temperature_1", 110, 21.0));

        // behind the watermark (100s) but its window [60, 120) is still open
        let outputs = lane.process(reading("temperature_1", 95, 22.0));
        assert!(outputs.is_empty());
        assert_eq!(lane.windows().record(&key, 60_000).unwrap().count(), 3);
    }
}

// ============================================================================
// ANOMALY DETECTION
// ============================================================================

mod anomaly_tests {
    use super::*;

    #[test]
    fn test_threshold_breach_emits_one_alert() {
        let mut config = tumbling_config();
        config.anomaly.rules = vec![rule(
            "temp-high",
            RuleKind::Threshold {
                low: None,
                high: Some(100.0),
                statistic: Statistic::Mean,
            },
            Severity::Critical,
        )];
        let mut lane = lane(&config);

        lane.process(reading("temperature_1", 10, 100.0));
        lane.process(reading("temperature_1", 20, 110.0));
        let outputs = lane.process(reading("temperature_1", 75, 20.0));

        let raised = alerts(&outputs);
        assert_eq!(raised.len(), 1);
        let alert = &raised[0];
        assert_eq!(alert.rule_id, "temp-high");
        assert_eq!(alert.severity, Severity::Critical);
        assert_relative_eq!(alert.observed_value, 105.0);
        assert_eq!(alert.limit, 100.0);
        assert_eq!(alert.window_start, at(0));
        assert_eq!(alert.window_end, at(60));

        // the alert follows the snapshot it was raised for
        let snapshot_at = outputs.iter().position(|o| o.kind() == OutputKind::Snapshot);
        let alert_at = outputs.iter().position(|o| o.kind() == OutputKind::Alert);
        assert!(snapshot_at < alert_at);
    }

    #[test]
    fn test_rate_of_change_between_windows() {
        let mut config = tumbling_config();
        config.anomaly.rules = vec![rule(
            "temp-rate",
            RuleKind::RateOfChange { max_rate: 0.5 },
            Severity::Warning,
        )];
        let mut lane = lane(&config);

        lane.process(reading("temperature_1", 10, 20.0));
        lane.process(reading("temperature_1", 70, 80.0));
        let outputs = lane.process(reading("temperature_1", 130, 80.0));

        // 60 degrees over a 60s window is 1.0/s
        let raised = alerts(&outputs);
        assert_eq!(raised.len(), 1);
        assert_relative_eq!(raised[0].observed_value, 1.0);
    }

    #[test]
    fn test_no_outlier_alert_during_warm_up() {
        let mut config = tumbling_config();
        config.anomaly.baseline_min_windows = 5;
        config.anomaly.rules = vec![rule(
            "temp-outlier",
            RuleKind::StddevOutlier { k: 2.0 },
            Severity::Warning,
        )];
        let mut lane = lane(&config);

        let mut raised = Vec::new();
        for (i, value) in [20.0, 21.0, 100.0].into_iter().enumerate() {
            let base = i as i64 * 60;
            raised.extend(alerts(&lane.process(reading("temperature_1", base + 10, value))));
        }
        raised.extend(alerts(&lane.process(reading("temperature_1", 300, 20.0))));
        assert!(raised.is_empty());
    }
}

// ============================================================================
// IDLE KEYS AND SHUTDOWN
// ============================================================================

mod idle_and_drain_tests {
    use super::*;

    #[test]
    fn test_silent_sensor_window_closes_on_tick() {
        let config = tumbling_config();
        let mut lane = lane(&config);

        lane.process(reading("temperature_1", 10, 20.0));
        assert!(lane.on_tick(at(30)).is_empty());

        let outputs = lane.on_tick(at(120));
        let closed = snapshots(&outputs);
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].trigger, CloseTrigger::Watermark);
    }

    #[test]
    fn test_drain_force_finalizes_with_shutdown_trigger() {
        let config = tumbling_config();
        let mut lane = lane(&config);

        lane.process(reading("a", 10, 20.0));
        lane.process(reading("b", 10, 30.0));

        let drained = snapshots(&lane.drain(at(20)));
        assert_eq!(drained.len(), 2);
        assert!(drained.iter().all(|s| s.trigger == CloseTrigger::Shutdown));
        assert_eq!(drained[0].source_id, "a");
        assert_eq!(drained[1].source_id, "b");
    }

    #[test]
    fn test_redelivered_reading_is_counted_once() {
        let config = tumbling_config();
        let mut lane = lane(&config);

        for _ in 0..3 {
            lane.process(reading("temperature_1", 10, 20.0));
        }
        let drained = snapshots(&lane.drain(at(20)));
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].count, 1);
        assert_eq!(lane.stats().duplicates, 2);
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

mod dispatch_tests {
    use super::*;
    use std::collections::BTreeMap;

    fn snapshot_output() -> Output {
        Output::Snapshot(AggregateSnapshot {
            source_id: "temperature_1".to_string(),
            metric_name: "temperature".to_string(),
            window_start: at(0),
            window_end: at(60),
            count: 4,
            sum: 84.0,
            mean: 21.0,
            min: 20.0,
            max: 22.0,
            variance: 0.5,
            stddev: 0.7071,
            p50: 21.0,
            p95: 22.0,
            p99: 22.0,
            trigger: CloseTrigger::Watermark,
            tags: BTreeMap::new(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_recover_within_budget() {
        let sink = Arc::new(MemorySink::new("storage"));
        sink.fail_next(4);
        let dlq = Arc::new(InMemoryDeadLetterQueue::new());
        let dispatcher = OutputDispatcher::new(
            vec![sink.clone() as Arc<dyn Sink>],
            dlq.clone(),
            RetryPolicy::new(Duration::from_millis(200), Duration::from_secs(10), 5),
            ProcessorMetrics::default(),
        );

        let started = tokio::time::Instant::now();
        let stats = dispatcher.deliver(&snapshot_output()).await;

        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retries, 4);
        assert_eq!(stats.dead_lettered, 0);
        assert_eq!(sink.records().len(), 1);
        assert!(dlq.is_empty());
        // 200 + 400 + 800 + 1600 ms
        assert_eq!(started.elapsed(), Duration::from_millis(3_000));
    }

    #[tokio::test]
    async fn test_file_dead_letter_queue_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = Arc::new(FileDeadLetterQueue::new(dir.path().join("dead_letters.jsonl")));
        let sink = Arc::new(MemorySink::new("alerts").rejecting());
        let dispatcher = OutputDispatcher::new(
            vec![sink as Arc<dyn Sink>],
            dlq.clone(),
            RetryPolicy::default(),
            ProcessorMetrics::default(),
        );

        dispatcher.deliver(&snapshot_output()).await;
        dispatcher.deliver(&snapshot_output()).await;

        let entries = dlq.read_all().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].sink, "alerts");
        assert_eq!(entries[0].attempts, 1);
        assert_eq!(entries[0].output.kind(), OutputKind::Snapshot);
        assert_eq!(entries[0].output.series_key(), SeriesKey::new("temperature_1", "temperature"));
        assert_ne!(entries[0].id, entries[1].id);
    }
}

// ============================================================================
// ENGINE
// ============================================================================

mod engine_tests {
    use super::*;
    use serde_json::json;

    fn raw(sensor: &str, timestamp: &str, value: f64) -> serde_json::Value {
        json!({
            "sensor_id": sensor,
            "type": "temperature",
            "location": "greenhouse",
            "value": value,
            "unit": "celsius",
            "timestamp": timestamp,
        })
    }

    #[tokio::test]
    async fn test_engine_end_to_end_with_shutdown_drain() {
        let mut config = tumbling_config();
        config.engine.lanes = 2;
        config.anomaly.rules = vec![rule(
            "temp-high",
            RuleKind::Threshold {
                low: None,
                high: Some(100.0),
                statistic: Statistic::Max,
            },
            Severity::Critical,
        )];

        let storage = Arc::new(
            MemorySink::new("storage").with_filter(OutputFilter::only(OutputKind::Snapshot)),
        );
        let alert_sink =
            Arc::new(MemorySink::new("alerts").with_filter(OutputFilter::only(OutputKind::Alert)));

        let mut engine = StreamEngineBuilder::new()
            .with_config(config)
            .with_sink(storage.clone())
            .with_sink(alert_sink.clone())
            .start()
            .unwrap();

        let messages = [
            raw("temperature_1", "2024-01-01T12:00:20Z", 20.0),
            raw("temperature_1", "2024-01-01T12:00:05Z", 21.0),
            raw("temperature_1", "2024-01-01T12:00:58", 110.0),
            raw("temperature_1", "2024-01-01T12:00:45Z", 21.0),
            raw("temperature_1", "2024-01-01T12:01:15Z", 22.0),
            raw("temperature_2", "2024-01-01T12:00:30Z", 19.0),
            json!({"sensor_id": "temperature_3", "type": "temperature", "value": "hot"}),
            json!("not an object"),
        ];

        let mut accepted = 0;
        for message in &messages {
            if engine.submit(message).await.unwrap().is_accepted() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 6);

        let report = engine.shutdown().await.unwrap();
        assert_eq!(report.accepted, 6);
        assert_eq!(report.rejected, 2);
        assert_eq!(report.windows_closed, 3);
        assert_eq!(report.alerts, 1);
        assert_eq!(report.dead_letters, 0);

        let mut stored: Vec<_> = storage
            .records()
            .into_iter()
            .filter_map(|o| match o {
                Output::Snapshot(s) => Some(s),
                _ => None,
            })
            .collect();
        stored.sort_by(|a, b| (&a.source_id, a.window_start).cmp(&(&b.source_id, b.window_start)));
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[0].count, 4);
        assert_eq!(stored[0].trigger, CloseTrigger::Watermark);
        assert_eq!(stored[0].tags.get("location").map(String::as_str), Some("greenhouse"));
        assert_eq!(stored[1].trigger, CloseTrigger::Shutdown);
        assert_eq!(stored[2].source_id, "temperature_2");

        let raised = alert_sink.records();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind(), OutputKind::Alert);
    }

    #[tokio::test]
    async fn test_engine_rejects_input_after_shutdown() {
        let mut engine = StreamEngineBuilder::new()
            .with_config(tumbling_config())
            .start()
            .unwrap();
        engine.shutdown().await.unwrap();

        let result = engine
            .submit(&raw("temperature_1", "2024-01-01T12:00:20Z", 20.0))
            .await;
        assert!(matches!(result, Err(processor::EngineError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_non_finite_reading_submitted_directly_is_rejected() {
        let registry = processor::MetricsRegistry::new();
        let storage = Arc::new(MemorySink::new("storage"));
        let mut engine = StreamEngineBuilder::new()
            .with_config(tumbling_config())
            .with_metrics_registry(registry.clone())
            .with_sink(storage.clone())
            .start()
            .unwrap();

        engine.submit_reading(reading("temperature_1", 10, f64::NAN)).await.unwrap();
        engine.submit_reading(reading("temperature_1", 20, 21.0)).await.unwrap();
        let report = engine.shutdown().await.unwrap();

        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.violations, 0);
        assert_eq!(report.windows_closed, 1);
        assert_eq!(storage.records().len(), 1);

        let text = registry.encode().unwrap();
        assert!(text.contains("open_windows 0"));
    }

    #[tokio::test]
    async fn test_undeliverable_outputs_reach_dead_letter_file() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = Arc::new(FileDeadLetterQueue::new(dir.path().join("dlq.jsonl")));
        let sink = Arc::new(MemorySink::new("storage").rejecting());

        let mut engine = StreamEngineBuilder::new()
            .with_config(tumbling_config())
            .with_sink(sink)
            .with_dead_letter_queue(dlq.clone())
            .start()
            .unwrap();

        engine
            .submit(&raw("temperature_1", "2024-01-01T12:00:20Z", 20.0))
            .await
            .unwrap();
        let report = engine.shutdown().await.unwrap();
        assert_eq!(report.dead_letters, 1);

        let entries = dlq.read_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].output.kind(), OutputKind::Snapshot);
    }
}

// ============================================================================
// PROPERTIES
// ============================================================================

mod property_tests {
    use super::*;

    fn values_and_order() -> impl Strategy<Value = (Vec<f64>, Vec<usize>)> {
        prop::collection::vec(-40.0f64..125.0, 1..50).prop_flat_map(|values| {
            let order: Vec<usize> = (0..values.len()).collect();
            (Just(values), Just(order).prop_shuffle())
        })
    }

    fn drain_in_order(values: &[f64], order: &[usize]) -> AggregateSnapshot {
        let mut config = tumbling_config();
        config.watermark.max_out_of_orderness = Duration::from_secs(120);
        let mut lane = lane(&config);

        for &i in order {
            lane.process(reading("temperature_1", i as i64, values[i]));
        }
        let mut drained = snapshots(&lane.drain(at(600)));
        assert_eq!(drained.len(), 1);
        drained.remove(0)
    }

    proptest! {
        #[test]
        fn prop_snapshot_is_independent_of_arrival_order((values, order) in values_and_order()) {
            let in_order: Vec<usize> = (0..values.len()).collect();
            let a = drain_in_order(&values, &in_order);
            let b = drain_in_order(&values, &order);

            prop_assert_eq!(a.count, b.count);
            prop_assert_eq!(a.min, b.min);
            prop_assert_eq!(a.max, b.max);
            prop_assert!((a.sum - b.sum).abs() <= 1e-9 * a.sum.abs().max(1.0));
            prop_assert!((a.mean - b.mean).abs() <= 1e-9 * a.mean.abs().max(1.0));
            prop_assert!((a.variance - b.variance).abs() <= 1e-6 * a.variance.max(1.0));
            prop_assert!((a.p50 - b.p50).abs() <= 1e-9 * a.p50.abs().max(1.0));
        }

        #[test]
        fn prop_watermark_never_decreases(
            steps in prop::collection::vec((0i64..10_000, 0i64..5_000, any::<bool>()), 1..200)
        ) {
            let mut tracker = KeyedWatermarkTracker::new(Duration::from_secs(5), Duration::from_secs(2));
            let key = SeriesKey::new("temperature_1", "temperature");
            let mut now_ms = 0i64;
            let mut previous = Watermark::min();

            for (event_secs, elapsed_ms, tick) in steps {
                now_ms += elapsed_ms;
                let now = DateTime::from_timestamp_millis(now_ms).unwrap();
                if tick {
                    tracker.advance_idle(now);
                } else {
                    tracker.observe_at(&key, at(event_secs), now);
                }
                let current = tracker.current(&key);
                prop_assert!(current >= previous);
                previous = current;
            }
        }
    }
}
