//! Recurring time-of-day schedules.
//!
//! A schedule is due at its local time of day on each of its weekdays, in
//! the device time zone. The engine is ticked by the session; each tick
//! looks at the window since the previous tick and fires the latest due
//! instant of every enabled schedule at most once. The first tick only
//! looks at the current minute, so due times that passed while the
//! scheduler was not running are never back-filled.
//!
//! A schedule that comes due while the device is not idle is skipped: no
//! trigger is emitted and the ledger records a failed "device busy" entry.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use techsense_commands::{
    ActionType, Command, CommandOrigin, CommandRequest, HistoryLedger, PowerLevel, Target,
    DEVICE_BUSY_REASON,
};
use techsense_core::telemetry::GridDims;
use techsense_core::{ControlEvent, DeviceStatus, EventBus};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{Result, RuleError};
use crate::trigger::{TriggerAction, TriggerEvent};

/// Unique identifier for a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(pub String);

impl ScheduleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ScheduleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `"HH:MM"` serde format for times of day.
mod time_of_day {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(d)?;
        NaiveTime::parse_from_str(&s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&s, "%H:%M:%S"))
            .map_err(|e| serde::de::Error::custom(format!("invalid time '{}': {}", s, e)))
    }
}

fn default_enabled() -> bool {
    true
}

/// A recurring cleaning schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub id: ScheduleId,
    pub name: String,
    /// Local time of day, minute resolution.
    #[serde(with = "time_of_day")]
    pub time_of_day: NaiveTime,
    pub weekdays: Vec<Weekday>,
    pub action: ActionType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Target>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_level: Option<PowerLevel>,
    /// Due instant of the last firing, skipped or not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn new(
        name: impl Into<String>,
        time_of_day: NaiveTime,
        weekdays: Vec<Weekday>,
        action: ActionType,
    ) -> Self {
        Self {
            id: ScheduleId::new(),
            name: name.into(),
            time_of_day,
            weekdays,
            action,
            enabled: true,
            target: None,
            power_level: None,
            last_fired: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = ScheduleId(id.into());
        self
    }

    pub fn with_target(mut self, target: Target) -> Self {
        self.target = Some(target);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The command request issued when the schedule fires.
    pub fn request(&self) -> CommandRequest {
        let mut request = CommandRequest::new(self.action).with_target(self.target);
        request.power_level = self.power_level;
        request
    }

    pub fn validate(&self, grid: GridDims) -> Result<()> {
        if self.id.0.trim().is_empty() {
            return Err(RuleError::Validation("schedule id is empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(RuleError::Validation(format!(
                "schedule {} has no name",
                self.id
            )));
        }
        if self.weekdays.is_empty() {
            return Err(RuleError::Validation(format!(
                "schedule '{}' has no weekdays",
                self.name
            )));
        }
        if self.time_of_day.second() != 0 || self.time_of_day.nanosecond() != 0 {
            return Err(RuleError::Validation(format!(
                "schedule '{}' time must be a whole minute",
                self.name
            )));
        }
        if !self.action.is_cleaning() {
            return Err(RuleError::Validation(format!(
                "schedule '{}' action must be a cleaning action, not {}",
                self.name, self.action
            )));
        }
        self.request()
            .validate(grid)
            .map_err(|e| RuleError::Validation(format!("schedule '{}': {}", self.name, e)))?;
        Ok(())
    }

    fn runs_on(&self, day: Weekday) -> bool {
        self.weekdays.contains(&day)
    }

    /// The due instant on local `date`, if the schedule runs that day.
    ///
    /// A time that falls in a DST gap does not exist and is skipped; an
    /// ambiguous time resolves to its first occurrence.
    fn due_on(&self, date: NaiveDate, tz: Tz) -> Option<DateTime<Utc>> {
        if !self.runs_on(date.weekday()) {
            return None;
        }
        date.and_time(self.time_of_day)
            .and_local_timezone(tz)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// The latest due instant in `(start, end]`, or `[start, end]` when
    /// `inclusive`.
    fn latest_due(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        inclusive: bool,
        tz: Tz,
    ) -> Option<DateTime<Utc>> {
        let first = start.with_timezone(&tz).date_naive();
        let mut date = end.with_timezone(&tz).date_naive();
        loop {
            if let Some(due) = self.due_on(date, tz) {
                let after_start = if inclusive { due >= start } else { due > start };
                if due <= end && after_start {
                    return Some(due);
                }
            }
            if date <= first {
                return None;
            }
            date = date.pred_opt()?;
        }
    }

    /// The first due instant strictly after `after`.
    pub fn next_due(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        let mut date = after.with_timezone(&tz).date_naive();
        // A full week plus one day covers every weekday and a DST gap.
        for _ in 0..9 {
            if let Some(due) = self.due_on(date, tz) {
                if due > after {
                    return Some(due);
                }
            }
            date = date.succ_opt()?;
        }
        None
    }
}

struct ScheduleState {
    schedules: Vec<Schedule>,
    last_check: Option<DateTime<Utc>>,
}

/// The schedule engine.
pub struct ScheduleEngine {
    state: RwLock<ScheduleState>,
    tz: Tz,
    grid: GridDims,
    ledger: Arc<HistoryLedger>,
    event_bus: Option<EventBus>,
}

impl ScheduleEngine {
    pub fn new(tz: Tz, grid: GridDims, ledger: Arc<HistoryLedger>) -> Self {
        Self {
            state: RwLock::new(ScheduleState {
                schedules: Vec::new(),
                last_check: None,
            }),
            tz,
            grid,
            ledger,
            event_bus: None,
        }
    }

    /// Publish `TriggerFired` and `ScheduleSkipped` events.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    pub async fn add_schedule(&self, schedule: Schedule) -> Result<ScheduleId> {
        schedule.validate(self.grid)?;
        let mut state = self.state.write().await;
        if state.schedules.iter().any(|s| s.id == schedule.id) {
            return Err(RuleError::Duplicate(schedule.id.to_string()));
        }
        let id = schedule.id.clone();
        tracing::info!(
            schedule_id = %id,
            name = %schedule.name,
            time = %schedule.time_of_day.format("%H:%M"),
            enabled = schedule.enabled,
            "Schedule added"
        );
        state.schedules.push(schedule);
        Ok(id)
    }

    /// Replace a schedule's definition, keeping its firing history.
    pub async fn update_schedule(&self, mut schedule: Schedule) -> Result<()> {
        schedule.validate(self.grid)?;
        let mut state = self.state.write().await;
        let existing = state
            .schedules
            .iter_mut()
            .find(|s| s.id == schedule.id)
            .ok_or_else(|| RuleError::NotFound(schedule.id.to_string()))?;
        schedule.last_fired = existing.last_fired;
        tracing::info!(schedule_id = %schedule.id, name = %schedule.name, "Schedule updated");
        *existing = schedule;
        Ok(())
    }

    pub async fn remove_schedule(&self, id: &ScheduleId) -> Result<Schedule> {
        let mut state = self.state.write().await;
        let pos = state
            .schedules
            .iter()
            .position(|s| &s.id == id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        tracing::info!(schedule_id = %id, "Schedule removed");
        Ok(state.schedules.remove(pos))
    }

    pub async fn set_enabled(&self, id: &ScheduleId, enabled: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let schedule = state
            .schedules
            .iter_mut()
            .find(|s| &s.id == id)
            .ok_or_else(|| RuleError::NotFound(id.to_string()))?;
        schedule.enabled = enabled;
        tracing::debug!(schedule_id = %id, enabled, "Schedule enablement changed");
        Ok(())
    }

    pub async fn get_schedule(&self, id: &ScheduleId) -> Option<Schedule> {
        self.state
            .read()
            .await
            .schedules
            .iter()
            .find(|s| &s.id == id)
            .cloned()
    }

    pub async fn list_schedules(&self) -> Vec<Schedule> {
        self.state.read().await.schedules.clone()
    }

    /// Next due instant of an enabled schedule after `after`.
    pub async fn next_due(&self, id: &ScheduleId, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let state = self.state.read().await;
        state
            .schedules
            .iter()
            .find(|s| &s.id == id && s.enabled)
            .and_then(|s| s.next_due(after, self.tz))
    }

    /// Run one scheduler tick at `now` with the device in `status`.
    ///
    /// Returns the trigger events of schedules that came due. Re-running a
    /// tick for the same instant returns nothing.
    pub async fn tick(&self, now: DateTime<Utc>, status: DeviceStatus) -> Vec<TriggerEvent> {
        let mut state = self.state.write().await;

        let (start, inclusive) = match state.last_check {
            Some(last) if now <= last => return Vec::new(),
            Some(last) => (last, false),
            None => (floor_minute(now), true),
        };
        state.last_check = Some(now);

        let mut fired = Vec::new();
        for schedule in state.schedules.iter_mut().filter(|s| s.enabled) {
            let Some(due) = schedule.latest_due(start, now, inclusive, self.tz) else {
                continue;
            };
            if schedule.last_fired.is_some_and(|last| last >= due) {
                continue;
            }
            schedule.last_fired = Some(due);

            let origin = CommandOrigin::Schedule {
                schedule_id: schedule.id.to_string(),
                schedule_name: schedule.name.clone(),
                due,
            };

            if status != DeviceStatus::Idle {
                self.record_skip(schedule, origin, due, now, status);
                continue;
            }

            let event = TriggerEvent {
                origin,
                action: TriggerAction::Command {
                    request: schedule.request(),
                },
                fired_at: now,
            };
            tracing::info!(
                schedule_id = %schedule.id,
                name = %schedule.name,
                due = %due,
                action = %schedule.action,
                "Schedule fired"
            );
            if let Some(bus) = &self.event_bus {
                bus.publish(
                    ControlEvent::TriggerFired {
                        source: event.source(),
                        action: event.action_name().to_string(),
                        at: now,
                    },
                    "schedule",
                );
            }
            fired.push(event);
        }
        fired
    }

    fn record_skip(
        &self,
        schedule: &Schedule,
        origin: CommandOrigin,
        due: DateTime<Utc>,
        now: DateTime<Utc>,
        status: DeviceStatus,
    ) {
        tracing::info!(
            schedule_id = %schedule.id,
            name = %schedule.name,
            due = %due,
            state = %status,
            "Schedule skipped, device busy"
        );

        match Command::new(&schedule.request(), origin, self.grid) {
            Ok(command) => {
                self.ledger.append_skipped(command.with_submitted_at(due), now);
            }
            Err(e) => {
                tracing::warn!(schedule_id = %schedule.id, error = %e, "Cannot record skipped firing");
            }
        }

        if let Some(bus) = &self.event_bus {
            bus.publish(
                ControlEvent::ScheduleSkipped {
                    schedule_id: schedule.id.to_string(),
                    name: schedule.name.clone(),
                    due,
                    reason: DEVICE_BUSY_REASON.to_string(),
                },
                "schedule",
            );
        }
    }
}

fn floor_minute(t: DateTime<Utc>) -> DateTime<Utc> {
    t - Duration::seconds(t.second() as i64) - Duration::nanoseconds(t.nanosecond() as i64)
}
