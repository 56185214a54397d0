//! Rule conditions: a metric of the telemetry sample compared to a threshold.
//!
//! The set of metrics and operators is closed so a condition can be fully
//! checked when it is configured. Evaluation never fails.

use std::fmt;

use serde::{Deserialize, Serialize};
use techsense_core::telemetry::{GridDims, TelemetrySample};

use crate::error::{Result, RuleError};

/// A value read from a telemetry sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum Metric {
    BatteryPct,
    PvInputW,
    WaterLevelPct,
    TdsPpm,
    /// Soiling of the dirtiest cell.
    MaxCellSoiling,
    /// Mean soiling across the grid.
    MeanCellSoiling,
    /// Soiling of one cell.
    CellSoiling { row: usize, col: usize },
}

impl Metric {
    /// Read the metric from `sample`.
    pub fn value(&self, sample: &TelemetrySample) -> Option<f64> {
        match self {
            Metric::BatteryPct => Some(sample.battery_pct),
            Metric::PvInputW => Some(sample.pv_input_w),
            Metric::WaterLevelPct => Some(sample.water_level_pct),
            Metric::TdsPpm => Some(sample.tds_ppm),
            Metric::MaxCellSoiling => Some(sample.soiling.max()),
            Metric::MeanCellSoiling => Some(sample.soiling.mean()),
            Metric::CellSoiling { row, col } => sample.soiling.get(*row, *col),
        }
    }

    /// Range a threshold on this metric must fall in.
    fn bounds(&self) -> (f64, f64) {
        match self {
            Metric::BatteryPct | Metric::WaterLevelPct => (0.0, 100.0),
            Metric::PvInputW | Metric::TdsPpm => (0.0, f64::MAX),
            Metric::MaxCellSoiling | Metric::MeanCellSoiling | Metric::CellSoiling { .. } => {
                (0.0, 1.0)
            }
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::BatteryPct => f.write_str("battery_pct"),
            Metric::PvInputW => f.write_str("pv_input_w"),
            Metric::WaterLevelPct => f.write_str("water_level_pct"),
            Metric::TdsPpm => f.write_str("tds_ppm"),
            Metric::MaxCellSoiling => f.write_str("max_cell_soiling"),
            Metric::MeanCellSoiling => f.write_str("mean_cell_soiling"),
            Metric::CellSoiling { row, col } => write!(f, "cell_soiling[{},{}]", row, col),
        }
    }
}

/// Comparison operators for conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterEqual,
    #[serde(rename = "<=")]
    LessEqual,
    #[serde(rename = "==", alias = "=")]
    Equal,
}

impl ComparisonOperator {
    /// Evaluate the comparison.
    pub fn evaluate(&self, left: f64, right: f64) -> bool {
        match self {
            Self::GreaterThan => left > right,
            Self::LessThan => left < right,
            Self::GreaterEqual => left >= right,
            Self::LessEqual => left <= right,
            Self::Equal => (left - right).abs() < 0.0001,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::LessThan => "<",
            Self::GreaterEqual => ">=",
            Self::LessEqual => "<=",
            Self::Equal => "==",
        }
    }
}

/// One term of a rule's conjunction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(flatten)]
    pub metric: Metric,
    pub operator: ComparisonOperator,
    pub threshold: f64,
}

impl Condition {
    pub fn new(metric: Metric, operator: ComparisonOperator, threshold: f64) -> Self {
        Self {
            metric,
            operator,
            threshold,
        }
    }

    /// Whether `sample` satisfies the condition.
    pub fn evaluate(&self, sample: &TelemetrySample) -> bool {
        self.metric
            .value(sample)
            .is_some_and(|v| self.operator.evaluate(v, self.threshold))
    }

    /// Check the threshold and cell reference against `grid`.
    pub fn validate(&self, grid: GridDims) -> Result<()> {
        if let Metric::CellSoiling { row, col } = self.metric {
            if !grid.contains(row, col) {
                return Err(RuleError::Validation(format!(
                    "{} outside {}x{} grid",
                    self.metric, grid.rows, grid.cols
                )));
            }
        }
        let (lo, hi) = self.metric.bounds();
        if !self.threshold.is_finite() || self.threshold < lo || self.threshold > hi {
            return Err(RuleError::Validation(format!(
                "threshold {} out of range for {}",
                self.threshold, self.metric
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.operator.as_str(), self.threshold)
    }
}
