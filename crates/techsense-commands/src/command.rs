//! Command data structures.
//!
//! A [`CommandRequest`] is the wire shape submitted by the dashboard and
//! produced by rules and schedules. [`Command::new`] validates it against
//! the device grid and stamps origin, priority and submission time.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use techsense_core::telemetry::GridDims;
use uuid::Uuid;

use crate::error::CommandError;

/// Unique command identifier.
pub type CommandId = Uuid;

/// What the device is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    SpotClean,
    RowClean,
    FullSweep,
    Move,
    Pause,
    Resume,
    Reset,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::SpotClean => "spot_clean",
            ActionType::RowClean => "row_clean",
            ActionType::FullSweep => "full_sweep",
            ActionType::Move => "move",
            ActionType::Pause => "pause",
            ActionType::Resume => "resume",
            ActionType::Reset => "reset",
        }
    }

    /// Actions that spray and brush the panels.
    pub fn is_cleaning(&self) -> bool {
        matches!(
            self,
            ActionType::SpotClean | ActionType::RowClean | ActionType::FullSweep
        )
    }

    /// Pause, resume and reset: manual-only and never queued.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            ActionType::Pause | ActionType::Resume | ActionType::Reset
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "spot_clean" => Ok(ActionType::SpotClean),
            "row_clean" => Ok(ActionType::RowClean),
            "full_sweep" => Ok(ActionType::FullSweep),
            "move" => Ok(ActionType::Move),
            "pause" => Ok(ActionType::Pause),
            "resume" => Ok(ActionType::Resume),
            "reset" => Ok(ActionType::Reset),
            other => Err(CommandError::Validation(format!(
                "unknown action type '{}'",
                other
            ))),
        }
    }
}

/// Brush and pump power.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerLevel {
    Eco,
    #[default]
    Normal,
    Max,
}

impl PowerLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerLevel::Eco => "eco",
            PowerLevel::Normal => "normal",
            PowerLevel::Max => "max",
        }
    }
}

/// Target position of a `move`, each axis in percent of travel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    fn validate(&self) -> Result<(), CommandError> {
        for (axis, v) in [("x", self.x), ("y", self.y), ("z", self.z)] {
            if !v.is_finite() || !(0.0..=100.0).contains(&v) {
                return Err(CommandError::Validation(format!(
                    "position.{} = {} outside 0..100",
                    axis, v
                )));
            }
        }
        Ok(())
    }
}

/// Area of the panel a cleaning action is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    Row { row: usize },
    Cell { row: usize, col: usize },
}

/// Command as submitted over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(rename = "type")]
    pub action: ActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_level: Option<PowerLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col: Option<i64>,
}

impl CommandRequest {
    pub fn new(action: ActionType) -> Self {
        Self {
            action,
            power_level: None,
            position: None,
            row: None,
            col: None,
        }
    }

    pub fn with_power_level(mut self, power_level: PowerLevel) -> Self {
        self.power_level = Some(power_level);
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_row(mut self, row: usize) -> Self {
        self.row = Some(row as i64);
        self
    }

    pub fn with_cell(mut self, row: usize, col: usize) -> Self {
        self.row = Some(row as i64);
        self.col = Some(col as i64);
        self
    }

    pub fn with_target(self, target: Option<Target>) -> Self {
        match target {
            Some(Target::Row { row }) => self.with_row(row),
            Some(Target::Cell { row, col }) => self.with_cell(row, col),
            None => self,
        }
    }

    /// Parse a JSON request; any decode failure is a validation error.
    pub fn from_json(json: &str) -> Result<Self, CommandError> {
        serde_json::from_str(json).map_err(|e| CommandError::Validation(e.to_string()))
    }

    /// Check the parameters against the action and the grid.
    pub fn validate(&self, grid: GridDims) -> Result<CommandParams, CommandError> {
        let action = self.action;
        let has_params = self.power_level.is_some()
            || self.position.is_some()
            || self.row.is_some()
            || self.col.is_some();

        if action.is_control() {
            if has_params {
                return Err(CommandError::Validation(format!(
                    "{} takes no parameters",
                    action
                )));
            }
            return Ok(CommandParams::default());
        }

        if action == ActionType::Move {
            if self.row.is_some() || self.col.is_some() {
                return Err(CommandError::Validation("move takes a position, not a row/col".into()));
            }
            let position = self
                .position
                .ok_or_else(|| CommandError::Validation("move requires a position".into()))?;
            position.validate()?;
            return Ok(CommandParams {
                power_level: self.power_level.unwrap_or_default(),
                position: Some(position),
                target: None,
            });
        }

        if self.position.is_some() {
            return Err(CommandError::Validation(format!(
                "{} does not take a position",
                action
            )));
        }

        let target = match (action, self.row, self.col) {
            (_, None, None) => None,
            (_, None, Some(_)) => {
                return Err(CommandError::Validation("col requires row".into()));
            }
            (ActionType::RowClean, Some(row), None) => Some(Target::Row {
                row: check_index("row", row, grid.rows)?,
            }),
            (ActionType::SpotClean, Some(row), Some(col)) => {
                let row = check_index("row", row, grid.rows)?;
                let col = check_index("col", col, grid.cols)?;
                Some(Target::Cell { row, col })
            }
            (ActionType::SpotClean, Some(_), None) => {
                return Err(CommandError::Validation("spot_clean targets a cell; col is missing".into()));
            }
            (other, _, _) => {
                return Err(CommandError::Validation(format!(
                    "{} does not accept this target",
                    other
                )));
            }
        };

        Ok(CommandParams {
            power_level: self.power_level.unwrap_or_default(),
            position: None,
            target,
        })
    }
}

fn check_index(name: &str, value: i64, len: usize) -> Result<usize, CommandError> {
    usize::try_from(value)
        .ok()
        .filter(|v| *v < len)
        .ok_or_else(|| {
            CommandError::Validation(format!("{} {} outside grid (0..{})", name, value, len))
        })
}

/// Validated command parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandParams {
    pub power_level: PowerLevel,
    pub position: Option<Position>,
    pub target: Option<Target>,
}

/// Command priority levels, derived from the origin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CommandPriority {
    /// Schedule-triggered
    Low = 1,
    /// Rule-triggered
    Normal = 2,
    /// Operator-initiated
    High = 3,
}

impl CommandPriority {
    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            CommandPriority::Low => "low",
            CommandPriority::Normal => "normal",
            CommandPriority::High => "high",
        }
    }
}

impl fmt::Display for CommandPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Where a command came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandOrigin {
    /// Operator command from the dashboard.
    Manual { operator: Option<String> },
    /// Fired by an automation rule.
    Rule { rule_id: String, rule_name: String },
    /// Fired by a schedule at its due instant.
    Schedule {
        schedule_id: String,
        schedule_name: String,
        due: DateTime<Utc>,
    },
}

impl CommandOrigin {
    pub fn manual() -> Self {
        CommandOrigin::Manual { operator: None }
    }

    /// Get a string identifier for the origin.
    pub fn id(&self) -> String {
        match self {
            CommandOrigin::Manual { operator } => {
                format!("manual:{}", operator.as_deref().unwrap_or("operator"))
            }
            CommandOrigin::Rule { rule_id, .. } => format!("rule:{}", rule_id),
            CommandOrigin::Schedule { schedule_id, .. } => format!("schedule:{}", schedule_id),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            CommandOrigin::Manual { .. } => "manual",
            CommandOrigin::Rule { .. } => "rule",
            CommandOrigin::Schedule { .. } => "schedule",
        }
    }

    pub fn priority(&self) -> CommandPriority {
        match self {
            CommandOrigin::Manual { .. } => CommandPriority::High,
            CommandOrigin::Rule { .. } => CommandPriority::Normal,
            CommandOrigin::Schedule { .. } => CommandPriority::Low,
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self, CommandOrigin::Manual { .. })
    }
}

/// A validated command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub origin: CommandOrigin,
    pub action: ActionType,
    pub params: CommandParams,
    pub submitted_at: DateTime<Utc>,
    pub priority: CommandPriority,
}

impl Command {
    /// Validate `request` and build a command submitted now.
    pub fn new(
        request: &CommandRequest,
        origin: CommandOrigin,
        grid: GridDims,
    ) -> Result<Self, CommandError> {
        if request.action.is_control() && !origin.is_manual() {
            return Err(CommandError::Validation(format!(
                "{} may only be issued manually",
                request.action
            )));
        }
        let params = request.validate(grid)?;
        Ok(Self {
            id: Uuid::new_v4(),
            priority: origin.priority(),
            origin,
            action: request.action,
            params,
            submitted_at: Utc::now(),
        })
    }

    pub fn with_submitted_at(mut self, at: DateTime<Utc>) -> Self {
        self.submitted_at = at;
        self
    }

    /// Whether the command occupies the device until acknowledged.
    pub fn occupies_device(&self) -> bool {
        !self.action.is_control()
    }
}

/// Final outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Partial,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Partial => "partial",
            Outcome::Failed => "failed",
        }
    }

    /// Success or partial: the device finished and is usable.
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::Partial)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Outcome::Success),
            "partial" => Ok(Outcome::Partial),
            "failed" => Ok(Outcome::Failed),
            other => Err(CommandError::Validation(format!("unknown outcome '{}'", other))),
        }
    }
}

/// Reason recorded for acknowledgement timeouts.
pub const TIMEOUT_REASON: &str = "communication timeout";

/// Command execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: CommandId,
    pub outcome: Outcome,
    pub reason: Option<String>,
    /// Time the device spent on the action.
    pub duration_secs: u64,
    pub water_used_l: f64,
    pub energy_used_kwh: f64,
    pub completed_at: DateTime<Utc>,
}

impl CommandResult {
    /// A result with no resource usage.
    pub fn new(command_id: CommandId, outcome: Outcome, completed_at: DateTime<Utc>) -> Self {
        Self {
            command_id,
            outcome,
            reason: None,
            duration_secs: 0,
            water_used_l: 0.0,
            energy_used_kwh: 0.0,
            completed_at,
        }
    }

    /// A failed result with `reason`.
    pub fn failed(command_id: CommandId, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::new(command_id, Outcome::Failed, at).with_reason(reason)
    }

    /// The result recorded when no acknowledgement arrived.
    pub fn timed_out(command_id: CommandId, at: DateTime<Utc>) -> Self {
        Self::failed(command_id, TIMEOUT_REASON, at)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn is_timeout(&self) -> bool {
        self.outcome == Outcome::Failed && self.reason.as_deref() == Some(TIMEOUT_REASON)
    }

    /// The taxonomy error this result represents, if any.
    pub fn error(&self, timeout_secs: u64) -> Option<CommandError> {
        match self.outcome {
            Outcome::Success => None,
            Outcome::Partial => Some(CommandError::PartialCompletion {
                command_id: self.command_id,
                reason: self.reason.clone().unwrap_or_default(),
            }),
            Outcome::Failed if self.is_timeout() => Some(CommandError::CommunicationTimeout {
                command_id: self.command_id,
                timeout_secs,
            }),
            Outcome::Failed => Some(CommandError::Channel(
                self.reason.clone().unwrap_or_else(|| "device reported failure".into()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> GridDims {
        GridDims::new(6, 8)
    }

    #[test]
    fn test_request_wire_format() {
        let req = CommandRequest::from_json(
            r#"{"type":"spot_clean","power_level":"eco","row":2,"col":5}"#,
        )
        .unwrap();
        assert_eq!(req.action, ActionType::SpotClean);
        assert_eq!(req.power_level, Some(PowerLevel::Eco));

        let params = req.validate(grid()).unwrap();
        assert_eq!(params.target, Some(Target::Cell { row: 2, col: 5 }));
        assert_eq!(params.power_level, PowerLevel::Eco);
    }

    #[test]
    fn test_unknown_type_is_validation_error() {
        let err = CommandRequest::from_json(r#"{"type":"dance"}"#).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_move_requires_position_in_range() {
        let req = CommandRequest::new(ActionType::Move);
        assert!(req.validate(grid()).is_err());

        let req = CommandRequest::new(ActionType::Move).with_position(Position::new(10.0, 50.0, 101.0));
        assert!(req.validate(grid()).is_err());

        let req = CommandRequest::new(ActionType::Move).with_position(Position::new(10.0, 50.0, 100.0));
        assert!(req.validate(grid()).is_ok());
    }

    #[test]
    fn test_target_checks() {
        let out_of_grid = CommandRequest::new(ActionType::SpotClean).with_cell(6, 0);
        assert!(out_of_grid.validate(grid()).is_err());

        let negative = CommandRequest {
            row: Some(-1),
            ..CommandRequest::new(ActionType::RowClean)
        };
        assert!(negative.validate(grid()).is_err());

        let col_only = CommandRequest {
            col: Some(1),
            ..CommandRequest::new(ActionType::SpotClean)
        };
        assert!(col_only.validate(grid()).is_err());

        let sweep_with_row = CommandRequest::new(ActionType::FullSweep).with_row(1);
        assert!(sweep_with_row.validate(grid()).is_err());

        let row = CommandRequest::new(ActionType::RowClean).with_row(5);
        assert_eq!(row.validate(grid()).unwrap().target, Some(Target::Row { row: 5 }));
    }

    #[test]
    fn test_control_commands() {
        let pause = CommandRequest::new(ActionType::Pause);
        assert!(Command::new(&pause, CommandOrigin::manual(), grid()).is_ok());

        let rule = CommandOrigin::Rule {
            rule_id: "r1".into(),
            rule_name: "r".into(),
        };
        assert!(Command::new(&pause, rule, grid()).is_err());

        let with_power = CommandRequest::new(ActionType::Reset).with_power_level(PowerLevel::Max);
        assert!(with_power.validate(grid()).is_err());
    }

    #[test]
    fn test_priority_from_origin() {
        let schedule = CommandOrigin::Schedule {
            schedule_id: "s1".into(),
            schedule_name: "Morning".into(),
            due: Utc::now(),
        };
        let rule = CommandOrigin::Rule {
            rule_id: "r1".into(),
            rule_name: "Soiling".into(),
        };
        assert!(CommandOrigin::manual().priority() > rule.priority());
        assert!(rule.priority() > schedule.priority());
        assert_eq!(schedule.id(), "schedule:s1");
    }

    #[test]
    fn test_result_error_mapping() {
        let id = Uuid::new_v4();
        let timeout = CommandResult::timed_out(id, Utc::now());
        assert!(timeout.is_timeout());
        assert_eq!(timeout.error(30).unwrap().kind(), "communication_timeout");

        let partial = CommandResult::new(id, Outcome::Partial, Utc::now()).with_reason("water exhausted");
        assert_eq!(partial.error(30).unwrap().kind(), "partial_completion");
        assert!(partial.outcome.is_completed());
    }
}
