//! The opaque send-and-acknowledge channel to the device.
//!
//! Delivery and acknowledgement are separate: [`DeviceChannel::send`]
//! returns once the device has the command, and the device later reports a
//! [`DeviceAck`] which is fed to
//! [`CommandDispatcher::acknowledge`](crate::dispatcher::CommandDispatcher::acknowledge).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandId, CommandResult, Outcome};
use crate::error::CommandError;

/// Acknowledgement reported by the device for a finished command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAck {
    pub command_id: CommandId,
    pub outcome: Outcome,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default)]
    pub water_used_l: f64,
    #[serde(default)]
    pub energy_used_kwh: f64,
}

impl DeviceAck {
    pub fn success(command_id: CommandId) -> Self {
        Self {
            command_id,
            outcome: Outcome::Success,
            reason: None,
            duration_secs: 0,
            water_used_l: 0.0,
            energy_used_kwh: 0.0,
        }
    }

    pub fn with_outcome(mut self, outcome: Outcome, reason: Option<String>) -> Self {
        self.outcome = outcome;
        self.reason = reason;
        self
    }

    pub fn with_usage(mut self, duration_secs: u64, water_used_l: f64, energy_used_kwh: f64) -> Self {
        self.duration_secs = duration_secs;
        self.water_used_l = water_used_l;
        self.energy_used_kwh = energy_used_kwh;
        self
    }

    /// Convert into the result recorded for the command.
    pub fn into_result(self, completed_at: DateTime<Utc>) -> CommandResult {
        CommandResult {
            command_id: self.command_id,
            outcome: self.outcome,
            reason: self.reason,
            duration_secs: self.duration_secs,
            water_used_l: self.water_used_l,
            energy_used_kwh: self.energy_used_kwh,
            completed_at,
        }
    }
}

/// Transport to the physical device.
#[async_trait]
pub trait DeviceChannel: Send + Sync {
    /// Deliver `command` to the device.
    ///
    /// An error means the device never received it; the dispatcher records
    /// the command as failed with [`CommandError::Channel`] as reason.
    async fn send(&self, command: &Command) -> Result<(), CommandError>;
}
