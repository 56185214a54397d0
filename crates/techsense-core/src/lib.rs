//! Core types for the TechSense control core.
//!
//! This crate holds what every other component shares: the error type,
//! configuration, the event bus, the telemetry stream and the device state
//! machine.

pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod telemetry;

pub use config::CoreConfig;
pub use device::{DeviceEvent, DeviceState, DeviceStateMachine, DeviceStatus, Transition};
pub use error::{Error, Result};
pub use event::{ControlEvent, EventMetadata, NotificationKind};
pub use eventbus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventBusReceiver, FilteredReceiver};
pub use telemetry::{
    GridDims, SoilingBand, SoilingGrid, TelemetrySample, TelemetryStream, TelemetrySubscription,
};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::config::{defaults, env_vars, CoreConfig};
    pub use crate::device::{DeviceEvent, DeviceStateMachine, DeviceStatus};
    pub use crate::error::{Error, Result};
    pub use crate::event::{ControlEvent, NotificationKind};
    pub use crate::eventbus::EventBus;
    pub use crate::telemetry::{GridDims, SoilingGrid, TelemetrySample, TelemetryStream};
}
