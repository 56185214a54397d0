//! The device operating state and its transition table.
//!
//! [`DeviceStateMachine`] owns the single authoritative [`DeviceState`].
//! The only way to change it is [`DeviceStateMachine::apply`], which looks
//! the `(status, event)` pair up in the transition table and rejects
//! anything the table does not list.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::ControlEvent;
use crate::eventbus::EventBus;
use crate::telemetry::TelemetrySample;

/// Operating status of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Idle,
    Cleaning,
    Paused,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Idle => "idle",
            DeviceStatus::Cleaning => "cleaning",
            DeviceStatus::Paused => "paused",
            DeviceStatus::Error => "error",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs of the transition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// The dispatcher admitted a command to the device.
    CommandAccepted { command_id: Uuid },
    /// The in-flight command finished with success or partial completion.
    CommandSucceeded { command_id: Uuid },
    /// The in-flight command failed.
    CommandFailed { command_id: Uuid },
    /// No acknowledgement arrived before the deadline.
    AckTimeout { command_id: Uuid },
    Pause,
    Resume,
    Reset,
    /// The device reported a fault in its telemetry.
    FaultReported { fault: String },
}

impl DeviceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceEvent::CommandAccepted { .. } => "command_accepted",
            DeviceEvent::CommandSucceeded { .. } => "command_succeeded",
            DeviceEvent::CommandFailed { .. } => "command_failed",
            DeviceEvent::AckTimeout { .. } => "ack_timeout",
            DeviceEvent::Pause => "pause",
            DeviceEvent::Resume => "resume",
            DeviceEvent::Reset => "reset",
            DeviceEvent::FaultReported { .. } => "fault_reported",
        }
    }

    fn command_id(&self) -> Option<Uuid> {
        match self {
            DeviceEvent::CommandAccepted { command_id }
            | DeviceEvent::CommandSucceeded { command_id }
            | DeviceEvent::CommandFailed { command_id }
            | DeviceEvent::AckTimeout { command_id } => Some(*command_id),
            _ => None,
        }
    }
}

/// Snapshot of the device state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub status: DeviceStatus,
    /// Command currently executing on the device.
    pub active_command: Option<Uuid>,
    /// Status restored by `resume`; only set while paused.
    pub resume_to: Option<DeviceStatus>,
    pub last_transition: DateTime<Utc>,
    /// Fault that put the device into Error, if telemetry reported one.
    pub fault: Option<String>,
}

impl DeviceState {
    fn initial(at: DateTime<Utc>) -> Self {
        Self {
            status: DeviceStatus::Idle,
            active_command: None,
            resume_to: None,
            last_transition: at,
            fault: None,
        }
    }
}

/// Result of an applied event.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: DeviceStatus,
    pub to: DeviceStatus,
    pub event: &'static str,
    pub at: DateTime<Utc>,
}

impl Transition {
    /// Whether the status actually changed.
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Owner of the device state.
pub struct DeviceStateMachine {
    state: RwLock<DeviceState>,
    bus: Option<EventBus>,
}

impl DeviceStateMachine {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// A machine in Idle whose last transition is `at`.
    pub fn starting_at(at: DateTime<Utc>) -> Self {
        Self {
            state: RwLock::new(DeviceState::initial(at)),
            bus: None,
        }
    }

    /// Publish `StateChanged` events on `bus`.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn state(&self) -> DeviceState {
        self.state.read().clone()
    }

    pub fn status(&self) -> DeviceStatus {
        self.state.read().status
    }

    pub fn is_idle(&self) -> bool {
        self.status() == DeviceStatus::Idle
    }

    /// Apply `event` at `at`.
    ///
    /// Fails with [`Error::InvalidTransition`] when the table has no entry
    /// for the current status and event, or when a command event names a
    /// command other than the active one. A failed apply leaves the state
    /// untouched.
    pub fn apply(&self, event: DeviceEvent, at: DateTime<Utc>) -> Result<Transition> {
        let transition = {
            let mut state = self.state.write();
            let from = state.status;
            let next = next_state(&state, &event).ok_or_else(|| Error::InvalidTransition {
                state: from.to_string(),
                event: event.name().to_string(),
            })?;
            let to = next.status;
            let stamp = if to != from { at } else { state.last_transition };
            *state = DeviceState {
                last_transition: stamp,
                ..next
            };
            Transition {
                from,
                to,
                event: event.name(),
                at,
            }
        };

        if transition.changed() {
            tracing::info!(
                from = %transition.from,
                to = %transition.to,
                event = transition.event,
                "Device state changed"
            );
            if let Some(bus) = &self.bus {
                bus.publish(
                    ControlEvent::StateChanged {
                        from: transition.from,
                        to: transition.to,
                        cause: transition.event.to_string(),
                        at,
                    },
                    "device",
                );
            }
        }
        Ok(transition)
    }

    /// Drive the telemetry-side transitions for a newly ingested sample.
    ///
    /// A sample carrying a fault moves any non-Error state to Error.
    pub fn observe_sample(&self, sample: &TelemetrySample) -> Option<Transition> {
        let fault = sample.fault.as_ref()?;
        if self.status() == DeviceStatus::Error {
            return None;
        }
        match self.apply(
            DeviceEvent::FaultReported {
                fault: fault.clone(),
            },
            sample.timestamp,
        ) {
            Ok(transition) => {
                tracing::warn!(fault = %fault, "Device reported a fault");
                Some(transition)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Fault transition not applied");
                None
            }
        }
    }
}

impl Default for DeviceStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// The transition table. `None` means the event is not allowed.
fn next_state(state: &DeviceState, event: &DeviceEvent) -> Option<DeviceState> {
    use DeviceStatus::*;

    // Command results must refer to the command that is actually running.
    if let Some(id) = event.command_id() {
        let expects_active = !matches!(event, DeviceEvent::CommandAccepted { .. });
        if expects_active && state.active_command != Some(id) {
            return None;
        }
    }

    let mut next = state.clone();
    match (state.status, event) {
        (Idle, DeviceEvent::CommandAccepted { command_id }) => {
            next.status = Cleaning;
            next.active_command = Some(*command_id);
        }
        (Cleaning, DeviceEvent::CommandSucceeded { .. }) => {
            next.status = Idle;
            next.active_command = None;
        }
        (Cleaning, DeviceEvent::CommandFailed { .. } | DeviceEvent::AckTimeout { .. }) => {
            next.status = Error;
            next.active_command = None;
        }
        (Idle | Cleaning, DeviceEvent::Pause) => {
            next.status = Paused;
            next.resume_to = Some(state.status);
        }
        (Paused, DeviceEvent::Resume) => {
            next.status = state.resume_to.unwrap_or(Idle);
            next.resume_to = None;
        }
        // A result reported while paused only changes where resume returns to.
        (Paused, DeviceEvent::CommandSucceeded { .. }) => {
            next.active_command = None;
            next.resume_to = Some(Idle);
        }
        (Paused, DeviceEvent::CommandFailed { .. } | DeviceEvent::AckTimeout { .. }) => {
            next.status = Error;
            next.active_command = None;
            next.resume_to = None;
        }
        // The device may still report on a command that was running when it faulted.
        (
            Error,
            DeviceEvent::CommandSucceeded { .. }
            | DeviceEvent::CommandFailed { .. }
            | DeviceEvent::AckTimeout { .. },
        ) => {
            next.active_command = None;
        }
        (Error, DeviceEvent::Reset) => {
            next.status = Idle;
            next.active_command = None;
            next.resume_to = None;
            next.fault = None;
        }
        (Idle | Cleaning | Paused, DeviceEvent::FaultReported { fault }) => {
            next.status = Error;
            next.resume_to = None;
            next.fault = Some(fault.clone());
        }
        _ => return None,
    }
    Some(next)
}
