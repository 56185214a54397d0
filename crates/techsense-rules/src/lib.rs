//! Automation for the cleaning robot.
//!
//! - [`RuleEngine`] turns telemetry into trigger events on rising edges of
//!   condition-based rules, honouring enablement and cooldowns.
//! - [`ScheduleEngine`] fires recurring time-of-day schedules and applies
//!   the device-busy skip policy.
//!
//! Neither engine talks to the device: both return [`TriggerEvent`]s that
//! the session hands to the command dispatcher.

pub mod condition;
pub mod engine;
pub mod error;
pub mod rule;
pub mod schedule;
pub mod trigger;

pub use condition::{ComparisonOperator, Condition, Metric};
pub use engine::{RuleEngine, RuleState};
pub use error::{Result, RuleError};
pub use rule::{Rule, RuleAction, RuleId};
pub use schedule::{Schedule, ScheduleEngine, ScheduleId};
pub use trigger::{TriggerAction, TriggerEvent};
