//! Edge-triggered rule evaluation.
//!
//! Each telemetry sample is evaluated against every enabled rule in
//! insertion order. A rule fires only when its conjunction goes from
//! unsatisfied to satisfied, and only once its cooldown has elapsed since
//! the last firing. An edge that arrives during the cooldown is consumed:
//! the rule has to fall back to unsatisfied before it can fire again.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use techsense_commands::CommandOrigin;
use techsense_core::config::RuleSettings;
use techsense_core::telemetry::{GridDims, TelemetrySample};
use techsense_core::{ControlEvent, EventBus};
use tokio::sync::RwLock;

use crate::error::{Result, RuleError};
use crate::rule::{Rule, RuleId};
use crate::trigger::TriggerEvent;

/// Rule execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleState {
    /// Number of times the rule has been triggered.
    pub trigger_count: u64,
    pub last_fired: Option<DateTime<Utc>>,
    /// Result of the last evaluation.
    pub satisfied: bool,
}

#[derive(Debug)]
struct RuleEntry {
    rule: Rule,
    satisfied: bool,
    trigger_count: u64,
}

impl RuleEntry {
    fn new(rule: Rule) -> Self {
        Self {
            rule,
            satisfied: false,
            trigger_count: 0,
        }
    }
}

/// The rule engine.
pub struct RuleEngine {
    rules: RwLock<Vec<RuleEntry>>,
    default_cooldown: Duration,
    grid: GridDims,
    event_bus: Option<EventBus>,
}

impl RuleEngine {
    pub fn new(settings: &RuleSettings, grid: GridDims) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            default_cooldown: Duration::seconds(settings.default_cooldown_secs as i64),
            grid,
            event_bus: None,
        }
    }

    /// Publish a `TriggerFired` event for every firing.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Add a rule after the existing ones.
    pub async fn add_rule(&self, rule: Rule) -> Result<RuleId> {
        rule.validate(self.grid)?;
        let mut rules = self.rules.write().await;
        if rules.iter().any(|e| e.rule.id == rule.id) {
            return Err(RuleError::Duplicate(rule.id.to_string()));
        }
        let id = rule.id.clone();
        tracing::info!(rule_id = %id, name = %rule.name, enabled = rule.enabled, "Rule added");
        rules.push(RuleEntry::new(rule));
        Ok(id)
    }

    /// Replace a rule's definition, keeping its position and firing history.
    pub async fn update_rule(&self, mut rule: Rule) -> Result<()> {
        rule.validate(self.grid)?;
        let mut rules = self.rules.write().await;
        let entry = rules
            .iter_mut()
            .find(|e| e.rule.id == rule.id)
            .ok_or_else(|| RuleError::NotFound(rule.id.to_string()))?;

        rule.last_fired = entry.rule.last_fired;
        if !rule.enabled {
            entry.satisfied = false;
        }
        tracing::info!(rule_id = %rule.id, name = %rule.name, "Rule updated");
        entry.rule = rule;
        Ok(())
    }

    pub async fn remove_rule(&self, id: &RuleId) -> Result<Rule> {
        let mut rules = self.rules.write().await;
        let pos = rules
            .iter()
            .position(|e| &e.rule.id == id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        tracing::info!(rule_id = %id, "Rule removed");
        Ok(rules.remove(pos).rule)
    }

    /// Enable or disable a rule. Disabling clears the edge state.
    pub async fn set_enabled(&self, id: &RuleId, enabled: bool) -> Result<()> {
        let mut rules = self.rules.write().await;
        let entry = rules
            .iter_mut()
            .find(|e| &e.rule.id == id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        entry.rule.enabled = enabled;
        if !enabled {
            entry.satisfied = false;
        }
        tracing::debug!(rule_id = %id, enabled, "Rule enablement changed");
        Ok(())
    }

    pub async fn get_rule(&self, id: &RuleId) -> Option<Rule> {
        self.rules
            .read()
            .await
            .iter()
            .find(|e| &e.rule.id == id)
            .map(|e| e.rule.clone())
    }

    /// All rules in evaluation order.
    pub async fn list_rules(&self) -> Vec<Rule> {
        self.rules.read().await.iter().map(|e| e.rule.clone()).collect()
    }

    pub async fn rule_state(&self, id: &RuleId) -> Option<RuleState> {
        self.rules
            .read()
            .await
            .iter()
            .find(|e| &e.rule.id == id)
            .map(|e| RuleState {
                trigger_count: e.trigger_count,
                last_fired: e.rule.last_fired,
                satisfied: e.satisfied,
            })
    }

    pub async fn len(&self) -> usize {
        self.rules.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rules.read().await.is_empty()
    }

    /// Evaluate every enabled rule against `sample`.
    ///
    /// Returns one trigger event per rule that fired, in insertion order.
    /// The sample timestamp is the clock for cooldowns.
    pub async fn evaluate(&self, sample: &TelemetrySample) -> Vec<TriggerEvent> {
        let now = sample.timestamp;
        let mut fired = Vec::new();
        let mut rules = self.rules.write().await;

        for entry in rules.iter_mut() {
            if !entry.rule.enabled {
                entry.satisfied = false;
                continue;
            }

            let satisfied = entry.rule.is_satisfied(sample);
            let rising = satisfied && !entry.satisfied;
            entry.satisfied = satisfied;
            if !rising {
                continue;
            }

            let cooldown = entry
                .rule
                .cooldown_secs
                .map(|s| Duration::seconds(s as i64))
                .unwrap_or(self.default_cooldown);
            if let Some(last) = entry.rule.last_fired {
                if now < last + cooldown {
                    tracing::debug!(
                        rule_id = %entry.rule.id,
                        last_fired = %last,
                        "Rule edge suppressed by cooldown"
                    );
                    continue;
                }
            }

            entry.rule.last_fired = Some(now);
            entry.trigger_count += 1;

            let event = TriggerEvent {
                origin: CommandOrigin::Rule {
                    rule_id: entry.rule.id.to_string(),
                    rule_name: entry.rule.name.clone(),
                },
                action: entry.rule.action.to_trigger(),
                fired_at: now,
            };
            tracing::info!(
                rule_id = %entry.rule.id,
                name = %entry.rule.name,
                action = event.action_name(),
                "Rule fired"
            );
            if let Some(bus) = &self.event_bus {
                bus.publish(
                    ControlEvent::TriggerFired {
                        source: event.source(),
                        action: event.action_name().to_string(),
                        at: now,
                    },
                    "rules",
                );
            }
            fired.push(event);
        }

        fired
    }
}
