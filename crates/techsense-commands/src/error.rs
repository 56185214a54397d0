//! Command error taxonomy.

use uuid::Uuid;

/// Why a command was refused or did not complete.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    /// Malformed parameters; the command never reaches the device.
    #[error("Invalid command: {0}")]
    Validation(String),

    /// The device is not in a state that accepts this command or origin.
    #[error("State conflict: {0}")]
    StateConflict(String),

    /// No acknowledgement arrived within the deadline.
    #[error("Communication timeout: no acknowledgement for {command_id} within {timeout_secs}s")]
    CommunicationTimeout { command_id: Uuid, timeout_secs: u64 },

    /// The device stopped the action early.
    #[error("Partial completion of {command_id}: {reason}")]
    PartialCompletion { command_id: Uuid, reason: String },

    /// An acknowledgement referenced a command that is not in flight.
    #[error("Unknown command in acknowledgement: {0}")]
    UnknownDevice(Uuid),

    /// A pending command was superseded before dispatch.
    #[error("Canceled: {0}")]
    Canceled(String),

    /// The device channel failed to deliver the command.
    #[error("Device channel error: {0}")]
    Channel(String),
}

impl CommandError {
    /// Stable identifier of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::Validation(_) => "validation",
            CommandError::StateConflict(_) => "state_conflict",
            CommandError::CommunicationTimeout { .. } => "communication_timeout",
            CommandError::PartialCompletion { .. } => "partial_completion",
            CommandError::UnknownDevice(_) => "unknown_device",
            CommandError::Canceled(_) => "canceled",
            CommandError::Channel(_) => "channel",
        }
    }

    /// Whether the error is returned synchronously at submission.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CommandError::Validation(_) | CommandError::StateConflict(_)
        )
    }
}

impl From<CommandError> for techsense_core::Error {
    fn from(e: CommandError) -> Self {
        match e {
            CommandError::Validation(msg) => techsense_core::Error::Validation(msg),
            other => techsense_core::Error::Internal(other.to_string()),
        }
    }
}
