//! Device telemetry: samples, the soiling grid and the telemetry stream.
//!
//! The stream keeps the latest sample plus a bounded window of recent ones
//! and fans every accepted sample out to subscribers in arrival order.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::TelemetryConfig;
use crate::error::{Error, Result};
use crate::eventbus::DEFAULT_CHANNEL_CAPACITY;

/// Dimensions of the panel cell grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridDims {
    pub rows: usize,
    pub cols: usize,
}

impl GridDims {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Whether `(row, col)` addresses a cell of this grid.
    pub fn contains(&self, row: usize, col: usize) -> bool {
        row < self.rows && col < self.cols
    }

    pub fn cell_count(&self) -> usize {
        self.rows * self.cols
    }
}

/// Heatmap band of a soiling value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SoilingBand {
    /// Below 0.3.
    Clean,
    /// From 0.3 up to 0.7.
    Moderate,
    /// 0.7 and above.
    Heavy,
}

impl SoilingBand {
    pub fn classify(value: f64) -> Self {
        if value < 0.3 {
            SoilingBand::Clean
        } else if value < 0.7 {
            SoilingBand::Moderate
        } else {
            SoilingBand::Heavy
        }
    }
}

/// Per-cell normalized contamination estimates, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SoilingGrid {
    cells: Vec<Vec<f64>>,
}

impl SoilingGrid {
    /// Build a grid from rows, checking shape and value range.
    pub fn from_rows(cells: Vec<Vec<f64>>) -> Result<Self> {
        let grid = Self { cells };
        grid.check(None)?;
        Ok(grid)
    }

    /// A grid with every cell set to `value`.
    pub fn uniform(dims: GridDims, value: f64) -> Self {
        Self {
            cells: vec![vec![value; dims.cols]; dims.rows],
        }
    }

    pub fn dims(&self) -> GridDims {
        GridDims::new(
            self.cells.len(),
            self.cells.first().map(Vec::len).unwrap_or(0),
        )
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.cells.get(row).and_then(|r| r.get(col)).copied()
    }

    /// Set a single cell. Values are clamped to `[0, 1]`.
    pub fn set(&mut self, row: usize, col: usize, value: f64) -> bool {
        match self.cells.get_mut(row).and_then(|r| r.get_mut(col)) {
            Some(cell) => {
                *cell = value.clamp(0.0, 1.0);
                true
            }
            None => false,
        }
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.cells
    }

    /// The dirtiest cell, 0 for an empty grid.
    pub fn max(&self) -> f64 {
        self.cells
            .iter()
            .flatten()
            .copied()
            .fold(0.0_f64, f64::max)
    }

    /// Mean soiling across all cells, 0 for an empty grid.
    pub fn mean(&self) -> f64 {
        let count = self.cells.iter().map(Vec::len).sum::<usize>();
        if count == 0 {
            return 0.0;
        }
        self.cells.iter().flatten().sum::<f64>() / count as f64
    }

    pub fn band(&self, row: usize, col: usize) -> Option<SoilingBand> {
        self.get(row, col).map(SoilingBand::classify)
    }

    /// Row with the highest mean soiling.
    pub fn dirtiest_row(&self) -> Option<usize> {
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_empty())
            .map(|(i, r)| (i, r.iter().sum::<f64>() / r.len() as f64))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }

    fn check(&self, expected: Option<GridDims>) -> Result<()> {
        let dims = self.dims();
        if self.cells.iter().any(|r| r.len() != dims.cols) {
            return Err(Error::Validation("soiling grid rows have unequal length".into()));
        }
        if let Some(expected) = expected {
            if dims != expected {
                return Err(Error::Validation(format!(
                    "soiling grid is {}x{}, expected {}x{}",
                    dims.rows, dims.cols, expected.rows, expected.cols
                )));
            }
        }
        if let Some(bad) = self
            .cells
            .iter()
            .flatten()
            .find(|v| !v.is_finite() || !(0.0..=1.0).contains(*v))
        {
            return Err(Error::Validation(format!(
                "soiling value {} outside [0, 1]",
                bad
            )));
        }
        Ok(())
    }
}

/// One periodic device sample. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub battery_pct: f64,
    pub pv_input_w: f64,
    pub water_level_pct: f64,
    pub tds_ppm: f64,
    #[serde(rename = "soiling_grid")]
    pub soiling: SoilingGrid,
    /// Fault reported by the device itself, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

impl TelemetrySample {
    /// Check the value ranges of every field.
    pub fn validate(&self, grid: Option<GridDims>) -> Result<()> {
        check_pct("battery_pct", self.battery_pct)?;
        check_pct("water_level_pct", self.water_level_pct)?;
        check_non_negative("pv_input_w", self.pv_input_w)?;
        check_non_negative("tds_ppm", self.tds_ppm)?;
        self.soiling.check(grid)
    }
}

fn check_pct(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::Validation(format!("{} = {} outside [0, 100]", field, value)))
    }
}

fn check_non_negative(field: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(Error::Validation(format!("{} = {} must be >= 0", field, value)))
    }
}

struct StreamInner {
    latest: Option<Arc<TelemetrySample>>,
    recent: VecDeque<Arc<TelemetrySample>>,
}

/// Ingests device samples and exposes the latest one plus a change feed.
pub struct TelemetryStream {
    inner: RwLock<StreamInner>,
    tx: broadcast::Sender<Arc<TelemetrySample>>,
    window: usize,
    stale_after: chrono::Duration,
    grid: GridDims,
}

impl TelemetryStream {
    pub fn new(config: &TelemetryConfig, grid: GridDims) -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(StreamInner {
                latest: None,
                recent: VecDeque::with_capacity(config.history_window),
            }),
            tx,
            window: config.history_window.max(1),
            stale_after: config.stale_after(),
            grid,
        }
    }

    /// Accept a sample from the device channel.
    ///
    /// Samples outside the documented ranges, with the wrong grid shape, or
    /// older than the latest accepted sample are rejected and not broadcast.
    pub fn ingest(&self, sample: TelemetrySample) -> Result<Arc<TelemetrySample>> {
        sample.validate(Some(self.grid))?;

        let sample = Arc::new(sample);
        {
            let mut inner = self.inner.write();
            if let Some(latest) = &inner.latest {
                if sample.timestamp < latest.timestamp {
                    return Err(Error::Validation(format!(
                        "sample at {} is older than latest sample at {}",
                        sample.timestamp, latest.timestamp
                    )));
                }
            }
            inner.latest = Some(sample.clone());
            inner.recent.push_back(sample.clone());
            while inner.recent.len() > self.window {
                inner.recent.pop_front();
            }
        }

        // No subscribers is fine; the latest sample is still retained.
        let _ = self.tx.send(sample.clone());
        tracing::trace!(timestamp = %sample.timestamp, "telemetry sample ingested");
        Ok(sample)
    }

    pub fn latest(&self) -> Option<Arc<TelemetrySample>> {
        self.inner.read().latest.clone()
    }

    /// Recent samples, oldest first.
    pub fn recent(&self) -> Vec<Arc<TelemetrySample>> {
        self.inner.read().recent.iter().cloned().collect()
    }

    /// Whether the latest sample is missing or older than the staleness limit.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        match self.latest() {
            Some(latest) => now - latest.timestamp > self.stale_after,
            None => true,
        }
    }

    pub fn grid(&self) -> GridDims {
        self.grid
    }

    /// Subscribe to samples ingested from now on.
    pub fn subscribe(&self) -> TelemetrySubscription {
        TelemetrySubscription {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiver half of the telemetry change feed.
pub struct TelemetrySubscription {
    rx: broadcast::Receiver<Arc<TelemetrySample>>,
}

impl TelemetrySubscription {
    /// Receive the next sample.
    ///
    /// Returns `None` once the stream has been dropped. A lagging subscriber
    /// skips the samples it missed and continues with the oldest retained.
    pub async fn recv(&mut self) -> Option<Arc<TelemetrySample>> {
        loop {
            match self.rx.recv().await {
                Ok(sample) => return Some(sample),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "telemetry subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a sample without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<TelemetrySample>> {
        loop {
            match self.rx.try_recv() {
                Ok(sample) => return Some(sample),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Convert into a `Stream` of samples in arrival order.
    pub fn into_stream(mut self) -> impl Stream<Item = Arc<TelemetrySample>> {
        async_stream::stream! {
            while let Some(sample) = self.recv().await {
                yield sample;
            }
        }
    }
}
