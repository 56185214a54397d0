//! A simulated cleaning robot.
//!
//! [`SimulatedDevice`] stands in for the physical device: it implements
//! [`DeviceChannel`], runs the delivered command against a small physical
//! model and produces telemetry. Time only moves when
//! [`advance`](SimulatedDevice::advance) is called, so a driver decides how
//! fast simulated time runs.

use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use techsense_commands::{
    ActionType, Command, CommandError, CommandId, DeviceAck, DeviceChannel, Outcome, PowerLevel,
    Target,
};
use techsense_core::telemetry::{GridDims, SoilingGrid, TelemetrySample};
use tokio::sync::mpsc;

/// Physical parameters of the simulation.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Reservoir capacity in litres.
    pub tank_liters: f64,
    /// Battery capacity in kWh.
    pub battery_kwh: f64,
    /// Peak PV output in watts.
    pub pv_peak_w: f64,
    /// Soiling added per cell per simulated hour, at most.
    pub soiling_per_hour: f64,
    /// Seed for the noise generator; random when unset.
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            tank_liters: 40.0,
            battery_kwh: 5.0,
            pv_peak_w: 420.0,
            soiling_per_hour: 0.02,
            seed: None,
        }
    }
}

/// Nominal duration, water and energy of an action at normal power.
fn nominal_cost(action: ActionType) -> (f64, f64, f64) {
    match action {
        ActionType::FullSweep => (45.0 * 60.0, 12.5, 2.3),
        ActionType::RowClean => (12.0 * 60.0, 3.4, 0.6),
        ActionType::SpotClean => (8.0 * 60.0, 2.1, 0.4),
        ActionType::Move => (60.0, 0.0, 0.05),
        ActionType::Pause | ActionType::Resume | ActionType::Reset => (0.0, 0.0, 0.0),
    }
}

/// Duration and energy multipliers for a power level.
fn power_factor(power: PowerLevel) -> (f64, f64) {
    match power {
        PowerLevel::Eco => (1.4, 0.7),
        PowerLevel::Normal => (1.0, 1.0),
        PowerLevel::Max => (0.7, 1.4),
    }
}

#[derive(Debug)]
struct Job {
    command_id: CommandId,
    action: ActionType,
    target: Option<Target>,
    total_secs: f64,
    elapsed_secs: f64,
    water_rate: f64,
    energy_rate: f64,
    water_used: f64,
    energy_used: f64,
}

impl Job {
    fn new(command: &Command) -> Self {
        let (secs, water, energy) = nominal_cost(command.action);
        let (time_k, energy_k) = power_factor(command.params.power_level);
        let total_secs = (secs * time_k).max(1.0);
        Self {
            command_id: command.id,
            action: command.action,
            target: command.params.target,
            total_secs,
            elapsed_secs: 0.0,
            water_rate: water / total_secs,
            energy_rate: energy * energy_k / total_secs,
            water_used: 0.0,
            energy_used: 0.0,
        }
    }

    fn ack(&self, outcome: Outcome, reason: Option<String>) -> DeviceAck {
        DeviceAck::success(self.command_id)
            .with_outcome(outcome, reason)
            .with_usage(
                self.elapsed_secs.round() as u64,
                round2(self.water_used),
                round2(self.energy_used),
            )
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

struct SimState {
    now: DateTime<Utc>,
    battery_pct: f64,
    water_l: f64,
    tds_ppm: f64,
    pv_input_w: f64,
    soiling: SoilingGrid,
    job: Option<Job>,
    paused: bool,
    fault: Option<String>,
    /// Commands delivered, for inspection.
    delivered: Vec<ActionType>,
    rng: StdRng,
}

/// Simulated device channel and telemetry source.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Arc<Mutex<SimState>>,
    acks: mpsc::Sender<DeviceAck>,
    config: SimulationConfig,
}

impl SimulatedDevice {
    /// Create a device starting at `start`, returning the acknowledgement feed.
    pub fn new(
        grid: GridDims,
        config: SimulationConfig,
        start: DateTime<Utc>,
    ) -> (Self, mpsc::Receiver<DeviceAck>) {
        let (tx, rx) = mpsc::channel(64);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let state = SimState {
            now: start,
            battery_pct: 85.0,
            water_l: config.tank_liters * 0.8,
            tds_ppm: 140.0,
            pv_input_w: 0.0,
            soiling: SoilingGrid::uniform(grid, 0.15),
            job: None,
            paused: false,
            fault: None,
            delivered: Vec::new(),
            rng,
        };
        let device = Self {
            state: Arc::new(Mutex::new(state)),
            acks: tx,
            config,
        };
        (device, rx)
    }

    /// Report `fault` in every sample until the device is reset.
    pub fn inject_fault(&self, fault: impl Into<String>) {
        self.state.lock().fault = Some(fault.into());
    }

    pub fn set_water_pct(&self, pct: f64) {
        let mut state = self.state.lock();
        state.water_l = self.config.tank_liters * pct.clamp(0.0, 100.0) / 100.0;
    }

    pub fn set_battery_pct(&self, pct: f64) {
        self.state.lock().battery_pct = pct.clamp(0.0, 100.0);
    }

    /// Set every cell of the soiling grid.
    pub fn set_soiling(&self, value: f64) {
        let mut state = self.state.lock();
        let dims = state.soiling.dims();
        state.soiling = SoilingGrid::uniform(dims, value.clamp(0.0, 1.0));
    }

    /// Actions delivered so far, in order.
    pub fn delivered(&self) -> Vec<ActionType> {
        self.state.lock().delivered.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().job.is_some()
    }

    /// Advance simulated time by `dt` and return the resulting sample.
    ///
    /// A job that finishes during the step is acknowledged on the feed.
    pub fn advance(&self, dt: Duration) -> TelemetrySample {
        let secs = dt.as_secs_f64();
        let mut state = self.state.lock();
        state.now += chrono::Duration::milliseconds(dt.as_millis() as i64);

        self.update_environment(&mut state, secs);
        if let Some(ack) = self.progress_job(&mut state, secs) {
            if let Err(e) = self.acks.try_send(ack) {
                tracing::warn!(error = %e, "Simulated acknowledgement dropped");
            }
        }

        TelemetrySample {
            timestamp: state.now,
            battery_pct: round2(state.battery_pct.clamp(0.0, 100.0)),
            pv_input_w: round2(state.pv_input_w.max(0.0)),
            water_level_pct: round2(
                (state.water_l / self.config.tank_liters * 100.0).clamp(0.0, 100.0),
            ),
            tds_ppm: round2(state.tds_ppm.max(0.0)),
            soiling: state.soiling.clone(),
            fault: state.fault.clone(),
        }
    }

    fn update_environment(&self, state: &mut SimState, secs: f64) {
        let hour = state.now.hour() as f64 + state.now.minute() as f64 / 60.0;
        let daylight = ((hour - 6.0) / 12.0 * PI).sin().max(0.0);
        let noise = state.rng.gen_range(0.9..1.1);
        state.pv_input_w = self.config.pv_peak_w * daylight * noise;

        let charged_kwh = state.pv_input_w * secs / 3_600_000.0;
        state.battery_pct += charged_kwh / self.config.battery_kwh * 100.0;
        state.battery_pct = state.battery_pct.min(100.0);

        state.tds_ppm += state.rng.gen_range(-0.5..0.6) * secs / 60.0;

        let dims = state.soiling.dims();
        let max_step = self.config.soiling_per_hour * secs / 3600.0;
        if max_step > 0.0 {
            for row in 0..dims.rows {
                for col in 0..dims.cols {
                    let add = state.rng.gen_range(0.0..max_step);
                    let current = state.soiling.get(row, col).unwrap_or(0.0);
                    state.soiling.set(row, col, current + add);
                }
            }
        }
    }

    fn progress_job(&self, state: &mut SimState, secs: f64) -> Option<DeviceAck> {
        if state.paused || state.fault.is_some() {
            return None;
        }
        let mut job = state.job.take()?;

        let step = secs.min(job.total_secs - job.elapsed_secs);
        let water_needed = job.water_rate * step;
        if water_needed > state.water_l {
            // Runs until the reservoir is empty.
            let fraction = if water_needed > 0.0 {
                state.water_l / water_needed
            } else {
                0.0
            };
            advance_job(state, &mut job, step * fraction, self.config.battery_kwh);
            clean_area(&mut state.soiling, &job, job.elapsed_secs / job.total_secs);
            return Some(job.ack(Outcome::Partial, Some("water exhausted".into())));
        }

        advance_job(state, &mut job, step, self.config.battery_kwh);
        if job.elapsed_secs + f64::EPSILON >= job.total_secs {
            clean_area(&mut state.soiling, &job, 1.0);
            return Some(job.ack(Outcome::Success, None));
        }

        state.job = Some(job);
        None
    }
}

fn advance_job(state: &mut SimState, job: &mut Job, secs: f64, battery_kwh: f64) {
    let water = job.water_rate * secs;
    let energy = job.energy_rate * secs;
    job.elapsed_secs += secs;
    job.water_used += water;
    job.energy_used += energy;
    state.water_l = (state.water_l - water).max(0.0);
    state.battery_pct -= energy / battery_kwh * 100.0;
}

/// Reduce soiling over the job's area in proportion to `done`.
fn clean_area(soiling: &mut SoilingGrid, job: &Job, done: f64) {
    let dims = soiling.dims();
    let row_cells = |row: usize| (0..dims.cols).map(move |col| (row, col));

    let cells: Vec<(usize, usize)> = match (job.action, job.target) {
        (ActionType::FullSweep, _) => (0..dims.rows).flat_map(row_cells).collect(),
        (ActionType::RowClean, Some(Target::Row { row })) => row_cells(row).collect(),
        (ActionType::SpotClean, Some(Target::Cell { row, col })) => vec![(row, col)],
        // Untargeted: the dirtiest row, or the dirtiest cell.
        (ActionType::RowClean, _) => soiling
            .dirtiest_row()
            .map(|row| row_cells(row).collect())
            .unwrap_or_default(),
        (ActionType::SpotClean, _) => dirtiest_cell(soiling).into_iter().collect(),
        _ => Vec::new(),
    };

    let keep = 1.0 - 0.9 * done.clamp(0.0, 1.0);
    for (row, col) in cells {
        if let Some(v) = soiling.get(row, col) {
            soiling.set(row, col, v * keep);
        }
    }
}

fn dirtiest_cell(soiling: &SoilingGrid) -> Option<(usize, usize)> {
    soiling
        .rows()
        .iter()
        .enumerate()
        .flat_map(|(r, cells)| cells.iter().enumerate().map(move |(c, v)| ((r, c), *v)))
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(cell, _)| cell)
}

#[async_trait]
impl DeviceChannel for SimulatedDevice {
    async fn send(&self, command: &Command) -> Result<(), CommandError> {
        let mut state = self.state.lock();
        state.delivered.push(command.action);
        match command.action {
            ActionType::Pause => state.paused = true,
            ActionType::Resume => state.paused = false,
            ActionType::Reset => {
                state.job = None;
                state.paused = false;
                state.fault = None;
            }
            _ => {
                if state.fault.is_some() {
                    return Err(CommandError::Channel("device fault".into()));
                }
                state.job = Some(Job::new(command));
            }
        }
        tracing::debug!(command_id = %command.id, action = %command.action, "Simulated device received command");
        Ok(())
    }
}
