//! Command system for the cleaning robot.
//!
//! Provides:
//! - Command data structures and request validation
//! - Priority arbitration of pending commands
//! - Single-flight dispatch with acknowledgement deadlines
//! - The append-only command history ledger

pub mod channel;
pub mod command;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod queue;

pub use channel::{DeviceAck, DeviceChannel};
pub use command::{
    ActionType, Command, CommandId, CommandOrigin, CommandParams, CommandPriority,
    CommandRequest, CommandResult, Outcome, Position, PowerLevel, Target, TIMEOUT_REASON,
};
pub use dispatcher::{CommandDispatcher, DispatchSettings, PendingCommand};
pub use error::CommandError;
pub use history::{
    DEVICE_BUSY_REASON, ExportRow, HistoryFilter, HistoryLedger, HistoryQuery, HistoryRecord,
};
pub use queue::PendingQueue;
