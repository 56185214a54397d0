//! Device session for the cleaning robot.
//!
//! Wires telemetry, the device state machine, both automation engines, the
//! command dispatcher and the history ledger into one control loop, and
//! adds the pieces around it:
//! - [`ControlConfig`]: the session configuration file with seeded rules
//!   and schedules
//! - [`Notifier`]: operator notifications
//! - [`StatusSnapshot`]: the dashboard projection
//! - [`SimulatedDevice`]: a device channel and telemetry source for
//!   running without hardware

pub mod config;
pub mod notify;
pub mod session;
pub mod simulator;
pub mod snapshot;

pub use config::{default_rules, default_schedules, ControlConfig};
pub use notify::Notifier;
pub use session::{DeviceSession, ManualRequest, SessionInputs};
pub use simulator::{SimulatedDevice, SimulationConfig};
pub use snapshot::StatusSnapshot;
