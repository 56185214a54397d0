//! Rule definitions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use techsense_commands::{ActionType, CommandRequest, PowerLevel, Target};
use techsense_core::telemetry::{GridDims, TelemetrySample};
use uuid::Uuid;

use crate::condition::Condition;
use crate::error::{Result, RuleError};
use crate::trigger::TriggerAction;

/// Unique identifier for a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub String);

impl RuleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a rule does when it fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleAction {
    /// Submit a cleaning command with rule origin.
    Clean {
        action: ActionType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<Target>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        power_level: Option<PowerLevel>,
    },
    /// Publish a notification.
    Alert { message: String },
}

impl RuleAction {
    pub fn clean(action: ActionType) -> Self {
        RuleAction::Clean {
            action,
            target: None,
            power_level: None,
        }
    }

    pub fn alert(message: impl Into<String>) -> Self {
        RuleAction::Alert {
            message: message.into(),
        }
    }

    /// The command request for a clean action.
    pub fn request(&self) -> Option<CommandRequest> {
        match self {
            RuleAction::Clean {
                action,
                target,
                power_level,
            } => Some(clean_request(*action, *target, *power_level)),
            RuleAction::Alert { .. } => None,
        }
    }

    pub(crate) fn to_trigger(&self) -> TriggerAction {
        match self {
            RuleAction::Clean {
                action,
                target,
                power_level,
            } => TriggerAction::Command {
                request: clean_request(*action, *target, *power_level),
            },
            RuleAction::Alert { message } => TriggerAction::Alert {
                message: message.clone(),
            },
        }
    }

    fn validate(&self, grid: GridDims) -> Result<()> {
        match self {
            RuleAction::Clean { action, .. } if !action.is_cleaning() => Err(
                RuleError::Validation(format!("rules may only issue cleaning actions, not {}", action)),
            ),
            RuleAction::Clean { .. } => {
                if let Some(request) = self.request() {
                    request.validate(grid)?;
                }
                Ok(())
            }
            RuleAction::Alert { message } if message.trim().is_empty() => {
                Err(RuleError::Validation("alert message is empty".into()))
            }
            RuleAction::Alert { .. } => Ok(()),
        }
    }
}

fn clean_request(
    action: ActionType,
    target: Option<Target>,
    power_level: Option<PowerLevel>,
) -> CommandRequest {
    let mut request = CommandRequest::new(action).with_target(target);
    request.power_level = power_level;
    request
}

fn default_enabled() -> bool {
    true
}

/// A condition-based automation rule.
///
/// Conditions form a conjunction: the rule is satisfied when every
/// condition holds for a sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub id: RuleId,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub conditions: Vec<Condition>,
    /// Minimum time between firings; the engine default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_secs: Option<u64>,
    /// Set by the engine when the rule fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired: Option<DateTime<Utc>>,
    pub action: RuleAction,
}

impl Rule {
    pub fn new(name: impl Into<String>, conditions: Vec<Condition>, action: RuleAction) -> Self {
        Self {
            id: RuleId::new(),
            name: name.into(),
            enabled: true,
            conditions,
            cooldown_secs: None,
            last_fired: None,
            action,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = RuleId(id.into());
        self
    }

    pub fn with_cooldown_secs(mut self, secs: u64) -> Self {
        self.cooldown_secs = Some(secs);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Whether every condition holds for `sample`.
    pub fn is_satisfied(&self, sample: &TelemetrySample) -> bool {
        self.conditions.iter().all(|c| c.evaluate(sample))
    }

    /// Check the rule against the device grid.
    pub fn validate(&self, grid: GridDims) -> Result<()> {
        if self.id.0.trim().is_empty() {
            return Err(RuleError::Validation("rule id is empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(RuleError::Validation(format!("rule {} has no name", self.id)));
        }
        if self.conditions.is_empty() {
            return Err(RuleError::Validation(format!(
                "rule '{}' has no conditions",
                self.name
            )));
        }
        for condition in &self.conditions {
            condition
                .validate(grid)
                .map_err(|e| RuleError::Validation(format!("rule '{}': {}", self.name, e)))?;
        }
        self.action
            .validate(grid)
            .map_err(|e| RuleError::Validation(format!("rule '{}': {}", self.name, e)))
    }
}
