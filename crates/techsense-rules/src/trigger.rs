//! Trigger events emitted by rules and schedules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use techsense_commands::{CommandOrigin, CommandRequest};

/// What a trigger asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerAction {
    /// Submit a command to the dispatcher.
    Command { request: CommandRequest },
    /// Raise an operator notification; no command is issued.
    Alert { message: String },
}

/// A request to act, not yet admitted to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Rule or schedule that fired.
    pub origin: CommandOrigin,
    pub action: TriggerAction,
    pub fired_at: DateTime<Utc>,
}

impl TriggerEvent {
    /// The command request, for command triggers.
    pub fn request(&self) -> Option<&CommandRequest> {
        match &self.action {
            TriggerAction::Command { request } => Some(request),
            TriggerAction::Alert { .. } => None,
        }
    }

    /// Short label such as `rule:low-battery`.
    pub fn source(&self) -> String {
        self.origin.id()
    }

    /// Display name of the requested action.
    pub fn action_name(&self) -> &'static str {
        match &self.action {
            TriggerAction::Command { request } => request.action.as_str(),
            TriggerAction::Alert { .. } => "alert",
        }
    }
}
