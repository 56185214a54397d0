//! Telemetry stream tests.
//!
//! Tests ingestion, validation, retention and the subscription feed.

use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::StreamExt;

use techsense_core::{
    config::TelemetryConfig,
    telemetry::{GridDims, SoilingGrid, TelemetrySample, TelemetryStream},
    Error,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 6, 0, 0).unwrap()
}

/// Helper to create a valid sample on a 2x3 grid.
fn make_sample(at: DateTime<Utc>, battery: f64) -> TelemetrySample {
    TelemetrySample {
        timestamp: at,
        battery_pct: battery,
        pv_input_w: 410.0,
        water_level_pct: 75.0,
        tds_ppm: 90.0,
        soiling: SoilingGrid::uniform(GridDims::new(2, 3), 0.2),
        fault: None,
    }
}

fn make_stream(window: usize) -> TelemetryStream {
    let config = TelemetryConfig {
        history_window: window,
        stale_after_secs: 120,
    };
    TelemetryStream::new(&config, GridDims::new(2, 3))
}

#[test]
fn test_latest_empty_initially() {
    let stream = make_stream(10);
    assert!(stream.latest().is_none());
    assert!(stream.recent().is_empty());
    assert!(stream.is_stale(t0()));
}

#[test]
fn test_ingest_updates_latest_and_window() {
    let stream = make_stream(3);
    for i in 0..5 {
        stream
            .ingest(make_sample(t0() + Duration::seconds(i * 10), 90.0 - i as f64))
            .unwrap();
    }

    let latest = stream.latest().unwrap();
    assert_eq!(latest.battery_pct, 86.0);

    let recent = stream.recent();
    assert_eq!(recent.len(), 3);
    assert_eq!(recent[0].battery_pct, 88.0);
    assert_eq!(recent[2].battery_pct, 86.0);
}

#[test]
fn test_invalid_samples_rejected() {
    let stream = make_stream(10);

    let mut bad = make_sample(t0(), 120.0);
    assert!(matches!(stream.ingest(bad.clone()), Err(Error::Validation(_))));

    bad.battery_pct = 50.0;
    bad.pv_input_w = -1.0;
    assert!(stream.ingest(bad.clone()).is_err());

    bad.pv_input_w = 0.0;
    bad.soiling = SoilingGrid::uniform(GridDims::new(6, 8), 0.1);
    assert!(stream.ingest(bad).is_err());

    assert!(stream.latest().is_none());
}

#[test]
fn test_out_of_order_sample_rejected() {
    let stream = make_stream(10);
    stream.ingest(make_sample(t0(), 80.0)).unwrap();

    assert!(stream
        .ingest(make_sample(t0() - Duration::seconds(1), 70.0))
        .is_err());
    // Same timestamp is a resubmission, not a reordering.
    assert!(stream.ingest(make_sample(t0(), 80.0)).is_ok());
    assert_eq!(stream.recent().len(), 2);
}

#[test]
fn test_staleness() {
    let stream = make_stream(10);
    stream.ingest(make_sample(t0(), 80.0)).unwrap();

    assert!(!stream.is_stale(t0() + Duration::seconds(120)));
    assert!(stream.is_stale(t0() + Duration::seconds(121)));
}

#[tokio::test]
async fn test_subscription_in_arrival_order() {
    let stream = make_stream(10);
    stream.ingest(make_sample(t0(), 99.0)).unwrap();

    let mut sub = stream.subscribe();
    for i in 1..=3 {
        stream
            .ingest(make_sample(t0() + Duration::seconds(i), 90.0 + i as f64))
            .unwrap();
    }

    // Samples ingested before subscribing are not replayed.
    assert_eq!(sub.recv().await.unwrap().battery_pct, 91.0);
    assert_eq!(sub.recv().await.unwrap().battery_pct, 92.0);
    assert_eq!(sub.recv().await.unwrap().battery_pct, 93.0);
    assert!(sub.try_recv().is_none());
}

#[tokio::test]
async fn test_subscription_as_stream() {
    let stream = make_stream(10);
    let sub = stream.subscribe();

    stream.ingest(make_sample(t0(), 55.0)).unwrap();
    stream.ingest(make_sample(t0() + Duration::seconds(1), 54.0)).unwrap();

    let samples: Vec<_> = sub.into_stream().take(2).collect().await;
    assert_eq!(samples[0].battery_pct, 55.0);
    assert_eq!(samples[1].battery_pct, 54.0);
}
