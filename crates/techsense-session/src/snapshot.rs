//! Read-only status projection for the presentation layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use techsense_commands::HistoryLedger;
use techsense_core::telemetry::{SoilingGrid, TelemetrySample};
use techsense_core::DeviceStatus;

/// The telemetry snapshot shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub battery_pct: f64,
    pub pv_input_w: f64,
    pub water_level_pct: f64,
    pub tds_ppm: f64,
    pub status: DeviceStatus,
    pub soiling_grid: SoilingGrid,
    /// Completion time of the latest successful or partial cleaning.
    pub last_clean: Option<DateTime<Utc>>,
}

impl StatusSnapshot {
    pub fn new(sample: &TelemetrySample, status: DeviceStatus, ledger: &HistoryLedger) -> Self {
        Self {
            battery_pct: sample.battery_pct,
            pv_input_w: sample.pv_input_w,
            water_level_pct: sample.water_level_pct,
            tds_ppm: sample.tds_ppm,
            status,
            soiling_grid: sample.soiling.clone(),
            last_clean: ledger.last_clean(),
        }
    }
}
