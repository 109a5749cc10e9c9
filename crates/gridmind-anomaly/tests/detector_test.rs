//! Detector driven through the event bus and scheduler.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};

use gridmind_anomaly::{AnomalyConfig, AnomalyDetector, AnomalyType, Severity};
use gridmind_core::{EventBus, ManualClock, Reading, Scheduler};

#[tokio::test(start_paused = true)]
async fn test_detector_learns_then_flags_spike() {
    // 19:00 local
    let start = Utc.with_ymd_and_hms(2024, 6, 3, 19, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    let bus = Arc::new(EventBus::new());
    let config = AnomalyConfig {
        min_data_points: 50,
        baseline_interval_secs: 60,
        bootstrap_from_store: false,
        ..Default::default()
    };
    let detector = Arc::new(AnomalyDetector::new(config, Arc::new(clock.clone()), bus.clone()));
    let scheduler = Scheduler::new();
    detector.start(&scheduler).await;

    // 100 W with +-5 W of jitter
    for i in 0..100 {
        let power = if i % 2 == 0 { 95.0 } else { 105.0 };
        bus.publish_reading(Reading::new("oven", start + chrono::Duration::seconds(i), power), "test");
    }
    tokio::time::sleep(Duration::from_secs(61)).await;

    let baseline = detector.baseline("oven").await.expect("baseline after first cycle");
    assert_eq!(baseline.expected_at(19), 100.0);
    assert_eq!(baseline.confidence, 1.0);
    assert!(detector.list_anomalies().await.is_empty());

    bus.publish_reading(Reading::new("oven", start + chrono::Duration::minutes(3), 450.0), "test");
    tokio::time::sleep(Duration::from_millis(10)).await;

    let open = detector.list_open_anomalies().await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].anomaly_type, AnomalyType::Spike);
    assert_eq!(open[0].severity, Severity::Critical);

    scheduler.shutdown().await;
}
