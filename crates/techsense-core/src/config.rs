//! Configuration sections, defaults and environment overrides.
//!
//! Every tunable of the control core lives here so the session, the CLI
//! and the tests agree on the same defaults. The sections deserialize from
//! TOML; missing keys fall back to [`defaults`].

use std::path::PathBuf;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::telemetry::GridDims;

/// Default values.
pub mod defaults {
    pub const GRID_ROWS: usize = 6;
    pub const GRID_COLS: usize = 8;
    pub const TIMEZONE: &str = "UTC";
    pub const HISTORY_WINDOW: usize = 120;
    pub const STALE_AFTER_SECS: u64 = 120;
    pub const ACK_TIMEOUT_SECS: u64 = 30;
    pub const RULE_COOLDOWN_SECS: u64 = 600;
    pub const SCHEDULE_TICK_SECS: u64 = 60;
    pub const MIN_BATTERY_PCT: f64 = 30.0;
    pub const MIN_WATER_PCT: f64 = 5.0;
    pub const LOW_WATER_PCT: f64 = 20.0;
    pub const MAX_TDS_PPM: f64 = 500.0;
}

/// Environment variable names.
pub mod env_vars {
    pub const TIMEZONE: &str = "TECHSENSE_TIMEZONE";
    pub const STALE_AFTER_SECS: &str = "TECHSENSE_STALE_AFTER_SECS";
    pub const ACK_TIMEOUT_SECS: &str = "TECHSENSE_ACK_TIMEOUT_SECS";
    pub const RULE_COOLDOWN_SECS: &str = "TECHSENSE_RULE_COOLDOWN_SECS";
    pub const SCHEDULE_TICK_SECS: &str = "TECHSENSE_SCHEDULE_TICK_SECS";
    pub const HISTORY_DB: &str = "TECHSENSE_HISTORY_DB";
    pub const LOG_JSON: &str = "TECHSENSE_LOG_JSON";

    /// Read a numeric override, ignoring unset or unparsable values.
    pub fn secs(name: &str) -> Option<u64> {
        std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
    }

    /// Read a string override, ignoring empty values.
    pub fn string(name: &str) -> Option<String> {
        std::env::var(name)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// Physical device layout and locale.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Rows of panel cells in the soiling grid.
    pub grid_rows: usize,
    /// Columns of panel cells in the soiling grid.
    pub grid_cols: usize,
    /// IANA time zone used for schedules and history export.
    pub timezone: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            grid_rows: defaults::GRID_ROWS,
            grid_cols: defaults::GRID_COLS,
            timezone: defaults::TIMEZONE.to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn grid(&self) -> GridDims {
        GridDims::new(self.grid_rows, self.grid_cols)
    }

    /// Parse the configured time zone.
    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| Error::Config(format!("invalid timezone '{}': {}", self.timezone, e)))
    }
}

/// Telemetry retention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Number of recent samples kept besides the latest.
    pub history_window: usize,
    /// Age after which the latest sample is considered stale.
    pub stale_after_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            history_window: defaults::HISTORY_WINDOW,
            stale_after_secs: defaults::STALE_AFTER_SECS,
        }
    }
}

impl TelemetryConfig {
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs as i64)
    }
}

/// Command dispatch tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Deadline for a device acknowledgement.
    pub ack_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: defaults::ACK_TIMEOUT_SECS,
        }
    }
}

impl DispatcherConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

/// Rule evaluation tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuleSettings {
    /// Cooldown applied to rules that do not declare their own.
    pub default_cooldown_secs: u64,
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            default_cooldown_secs: defaults::RULE_COOLDOWN_SECS,
        }
    }
}

/// Scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Interval between scheduler ticks.
    pub tick_secs: u64,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            tick_secs: defaults::SCHEDULE_TICK_SECS,
        }
    }
}

impl ScheduleSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}

/// Guards applied before a cleaning command is admitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SafetyConfig {
    /// Automatic (rule/schedule) cleaning needs at least this battery level.
    pub min_battery_pct: f64,
    /// Any cleaning needs at least this water level.
    pub min_water_pct: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            min_battery_pct: defaults::MIN_BATTERY_PCT,
            min_water_pct: defaults::MIN_WATER_PCT,
        }
    }
}

/// Which notifications are published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationSettings {
    pub errors: bool,
    pub completion: bool,
    pub low_water: bool,
    pub maintenance: bool,
    /// Water level below which a low-water notification is raised.
    pub low_water_pct: f64,
    /// TDS above which a maintenance notification is raised.
    pub max_tds_ppm: f64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            errors: true,
            completion: true,
            low_water: true,
            maintenance: false,
            low_water_pct: defaults::LOW_WATER_PCT,
            max_tds_ppm: defaults::MAX_TDS_PPM,
        }
    }
}

/// History persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// redb file holding the history ledger; in-memory when unset.
    pub history_db: Option<PathBuf>,
}

/// The scalar settings of a control session.
///
/// Rule and schedule definitions are layered on top of this by the session
/// crate, which owns their types.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoreConfig {
    pub device: DeviceConfig,
    pub telemetry: TelemetryConfig,
    pub dispatcher: DispatcherConfig,
    pub rule_engine: RuleSettings,
    pub scheduler: ScheduleSettings,
    pub safety: SafetyConfig,
    pub notifications: NotificationSettings,
    pub storage: StorageConfig,
}

impl CoreConfig {
    /// Apply `TECHSENSE_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(tz) = env_vars::string(env_vars::TIMEZONE) {
            self.device.timezone = tz;
        }
        if let Some(secs) = env_vars::secs(env_vars::STALE_AFTER_SECS) {
            self.telemetry.stale_after_secs = secs;
        }
        if let Some(secs) = env_vars::secs(env_vars::ACK_TIMEOUT_SECS) {
            self.dispatcher.ack_timeout_secs = secs;
        }
        if let Some(secs) = env_vars::secs(env_vars::RULE_COOLDOWN_SECS) {
            self.rule_engine.default_cooldown_secs = secs;
        }
        if let Some(secs) = env_vars::secs(env_vars::SCHEDULE_TICK_SECS) {
            self.scheduler.tick_secs = secs;
        }
        if let Some(path) = env_vars::string(env_vars::HISTORY_DB) {
            self.storage.history_db = Some(PathBuf::from(path));
        }
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.device.grid_rows == 0 || self.device.grid_cols == 0 {
            return Err(Error::Config(format!(
                "soiling grid must be non-empty, got {}x{}",
                self.device.grid_rows, self.device.grid_cols
            )));
        }
        self.device.tz()?;
        if self.telemetry.history_window == 0 {
            return Err(Error::Config("telemetry.history_window must be > 0".into()));
        }
        if self.dispatcher.ack_timeout_secs == 0 {
            return Err(Error::Config("dispatcher.ack_timeout_secs must be > 0".into()));
        }
        if self.scheduler.tick_secs == 0 {
            return Err(Error::Config("scheduler.tick_secs must be > 0".into()));
        }
        for (name, pct) in [
            ("safety.min_battery_pct", self.safety.min_battery_pct),
            ("safety.min_water_pct", self.safety.min_water_pct),
            ("notifications.low_water_pct", self.notifications.low_water_pct),
        ] {
            if !(0.0..=100.0).contains(&pct) {
                return Err(Error::Config(format!("{} must be within 0..=100, got {}", name, pct)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.device.grid(), GridDims::new(6, 8));
        assert_eq!(config.dispatcher.ack_timeout(), Duration::from_secs(30));
        assert_eq!(config.rule_engine.default_cooldown_secs, 600);
        assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(60));
        assert!(config.notifications.errors);
        assert!(!config.notifications.maintenance);
        assert!(config.storage.history_db.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: CoreConfig = toml::from_str(
            r#"
            [device]
            timezone = "Europe/Berlin"

            [dispatcher]
            ack_timeout_secs = 45
            "#,
        )
        .unwrap();

        assert_eq!(config.device.grid_rows, 6);
        assert_eq!(config.device.tz().unwrap(), chrono_tz::Europe::Berlin);
        assert_eq!(config.dispatcher.ack_timeout_secs, 45);
        assert_eq!(config.telemetry.history_window, 120);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CoreConfig::default();
        config.device.timezone = "Mars/Olympus_Mons".to_string();
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = CoreConfig::default();
        config.device.grid_cols = 0;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.dispatcher.ack_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = CoreConfig::default();
        config.safety.min_battery_pct = 120.0;
        assert!(config.validate().is_err());
    }
}
