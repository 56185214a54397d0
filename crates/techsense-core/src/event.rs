//! Events published on the control event bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::DeviceStatus;

/// Kind of an operator-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// The device entered Error or a command failed.
    Error,
    /// A cleaning command completed.
    Completion,
    /// Water reservoir below the low-water threshold.
    LowWater,
    /// Water quality needs attention.
    Maintenance,
    /// Raised by an alert rule.
    Alert,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Error => "error",
            NotificationKind::Completion => "completion",
            NotificationKind::LowWater => "low_water",
            NotificationKind::Maintenance => "maintenance",
            NotificationKind::Alert => "alert",
        }
    }
}

/// An event of the control core.
///
/// Command fields are carried as their display names so subscribers do not
/// need the command crate's types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlEvent {
    /// The device state machine moved.
    StateChanged {
        from: DeviceStatus,
        to: DeviceStatus,
        cause: String,
        at: DateTime<Utc>,
    },
    /// A rule or schedule produced a trigger event.
    TriggerFired {
        source: String,
        action: String,
        at: DateTime<Utc>,
    },
    /// The dispatcher admitted a command.
    CommandAccepted {
        command_id: Uuid,
        action: String,
        origin: String,
    },
    /// The dispatcher refused a command.
    CommandRejected {
        action: String,
        origin: String,
        kind: String,
        reason: String,
    },
    /// A command reached its final outcome.
    CommandResolved {
        command_id: Uuid,
        action: String,
        outcome: String,
        reason: Option<String>,
    },
    /// A due schedule firing was skipped.
    ScheduleSkipped {
        schedule_id: String,
        name: String,
        due: DateTime<Utc>,
        reason: String,
    },
    /// Operator-facing notification.
    Notification {
        kind: NotificationKind,
        message: String,
        at: DateTime<Utc>,
    },
}

impl ControlEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlEvent::StateChanged { .. } => "StateChanged",
            ControlEvent::TriggerFired { .. } => "TriggerFired",
            ControlEvent::CommandAccepted { .. } => "CommandAccepted",
            ControlEvent::CommandRejected { .. } => "CommandRejected",
            ControlEvent::CommandResolved { .. } => "CommandResolved",
            ControlEvent::ScheduleSkipped { .. } => "ScheduleSkipped",
            ControlEvent::Notification { .. } => "Notification",
        }
    }

    pub fn is_command_event(&self) -> bool {
        matches!(
            self,
            ControlEvent::CommandAccepted { .. }
                | ControlEvent::CommandRejected { .. }
                | ControlEvent::CommandResolved { .. }
        )
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, ControlEvent::Notification { .. })
    }
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Component that published the event.
    pub source: String,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
        }
    }
}
