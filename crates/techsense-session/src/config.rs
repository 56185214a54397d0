//! Session configuration.
//!
//! [`ControlConfig`] is the file a session is started from: the scalar
//! core sections plus the initial rule and schedule definitions. When a
//! file declares no rules or schedules the dashboard defaults are seeded.

use std::path::Path;

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use techsense_commands::ActionType;
use techsense_core::{config_err, CoreConfig, Error, Result};
use techsense_rules::{ComparisonOperator, Condition, Metric, Rule, RuleAction, Schedule};

/// Full configuration of a device session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlConfig {
    #[serde(flatten)]
    pub core: CoreConfig,
    #[serde(default = "default_rules")]
    pub rules: Vec<Rule>,
    #[serde(default = "default_schedules")]
    pub schedules: Vec<Schedule>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            core: CoreConfig::default(),
            rules: default_rules(),
            schedules: default_schedules(),
        }
    }
}

impl ControlConfig {
    /// Load from a TOML file, apply environment overrides and validate.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(
            path = %path.display(),
            rules = config.rules.len(),
            schedules = config.schedules.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse TOML, apply environment overrides and validate.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: ControlConfig = toml::from_str(content)?;
        config.core.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Check the core sections and every rule and schedule.
    pub fn validate(&self) -> Result<()> {
        self.core.validate()?;
        let grid = self.core.device.grid();

        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            rule.validate(grid)?;
            if !seen.insert(rule.id.as_str()) {
                return Err(config_err!("duplicate rule id '{}'", rule.id));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for schedule in &self.schedules {
            schedule.validate(grid)?;
            if !seen.insert(schedule.id.as_str()) {
                return Err(config_err!("duplicate schedule id '{}'", schedule.id));
            }
        }
        Ok(())
    }
}

fn time(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

/// Schedules seeded when a configuration declares none.
pub fn default_schedules() -> Vec<Schedule> {
    vec![
        Schedule::new(
            "Morning Auto-Clean",
            time(6, 30),
            vec![Weekday::Mon, Weekday::Wed, Weekday::Fri],
            ActionType::FullSweep,
        )
        .with_id("morning-auto-clean"),
        Schedule::new(
            "Midday Spot Check",
            time(12, 0),
            vec![Weekday::Tue, Weekday::Thu],
            ActionType::SpotClean,
        )
        .with_id("midday-spot-check")
        .disabled(),
    ]
}

/// Rules seeded when a configuration declares none.
pub fn default_rules() -> Vec<Rule> {
    vec![
        Rule::new(
            "High Soiling Auto-Clean",
            vec![
                Condition::new(Metric::MaxCellSoiling, ComparisonOperator::GreaterThan, 0.35),
                Condition::new(Metric::BatteryPct, ComparisonOperator::GreaterThan, 50.0),
            ],
            RuleAction::clean(ActionType::FullSweep),
        )
        .with_id("high-soiling-auto-clean"),
        Rule::new(
            "Low Battery Protection",
            vec![Condition::new(
                Metric::BatteryPct,
                ComparisonOperator::LessThan,
                30.0,
            )],
            RuleAction::alert("Battery below 30%, automatic cleaning is held back"),
        )
        .with_id("low-battery-protection"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_seeds() {
        let config = ControlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.schedules.len(), 2);
        assert!(config.schedules[0].enabled);
        assert!(!config.schedules[1].enabled);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: ControlConfig = toml::from_str("").unwrap();
        assert_eq!(config, ControlConfig::default());
    }

    #[test]
    fn test_sections_and_definitions() {
        let config: ControlConfig = toml::from_str(
            r#"
            [device]
            grid_rows = 4
            grid_cols = 4
            timezone = "Europe/Berlin"

            [rule_engine]
            default_cooldown_secs = 900

            [[schedules]]
            id = "evening"
            name = "Evening Sweep"
            time_of_day = "19:15"
            weekdays = ["Sat", "Sun"]
            action = "full_sweep"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.core.device.grid_rows, 4);
        assert_eq!(config.core.rule_engine.default_cooldown_secs, 900);
        assert_eq!(config.schedules.len(), 1);
        assert_eq!(config.schedules[0].name, "Evening Sweep");
        // Rules were not declared: defaults are seeded.
        assert_eq!(config.rules.len(), 2);
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut config = ControlConfig::default();
        let copy = config.rules[0].clone();
        config.rules.push(copy);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_against_grid() {
        let result = ControlConfig::from_toml_str(
            r#"
            [device]
            grid_rows = 2
            grid_cols = 2

            [[rules]]
            name = "Far corner"
            conditions = [{ metric = "cell_soiling", row = 3, col = 3, operator = ">", threshold = 0.5 }]
            action = { kind = "alert", message = "dirty" }
            "#,
        );
        assert!(result.is_err());
    }
}
