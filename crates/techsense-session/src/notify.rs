//! Operator notifications.
//!
//! Sample-driven notifications (low water, maintenance) fire once when the
//! level crosses its threshold and re-arm when it recovers. Event-driven
//! ones (errors, completions) are derived from the control events on the
//! bus. Each kind can be switched off in [`NotificationSettings`].

use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use techsense_commands::{ActionType, Outcome};
use techsense_core::config::NotificationSettings;
use techsense_core::telemetry::TelemetrySample;
use techsense_core::{ControlEvent, DeviceStatus, EventBus, NotificationKind};
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Levels {
    low_water: bool,
    maintenance: bool,
}

pub struct Notifier {
    settings: NotificationSettings,
    bus: EventBus,
    levels: Mutex<Levels>,
}

impl Notifier {
    pub fn new(settings: NotificationSettings, bus: EventBus) -> Self {
        Self {
            settings,
            bus,
            levels: Mutex::new(Levels::default()),
        }
    }

    pub fn settings(&self) -> &NotificationSettings {
        &self.settings
    }

    /// Publish a notification of `kind`.
    pub fn notify(&self, kind: NotificationKind, message: impl Into<String>, at: DateTime<Utc>) {
        let message = message.into();
        tracing::info!(kind = kind.as_str(), message = %message, "Notification");
        self.bus.publish(
            ControlEvent::Notification { kind, message, at },
            "notifier",
        );
    }

    /// Check the water level and quality of a fresh sample.
    pub fn observe_sample(&self, sample: &TelemetrySample) {
        let low_water = sample.water_level_pct < self.settings.low_water_pct;
        let maintenance = sample.tds_ppm > self.settings.max_tds_ppm;

        let (water_edge, tds_edge) = {
            let mut levels = self.levels.lock();
            let edges = (
                low_water && !levels.low_water,
                maintenance && !levels.maintenance,
            );
            levels.low_water = low_water;
            levels.maintenance = maintenance;
            edges
        };

        if water_edge && self.settings.low_water {
            self.notify(
                NotificationKind::LowWater,
                format!("Water level at {:.0}%, refill the reservoir", sample.water_level_pct),
                sample.timestamp,
            );
        }
        if tds_edge && self.settings.maintenance {
            self.notify(
                NotificationKind::Maintenance,
                format!(
                    "Water TDS at {:.0} ppm exceeds {:.0} ppm, check the filter",
                    sample.tds_ppm, self.settings.max_tds_ppm
                ),
                sample.timestamp,
            );
        }
    }

    /// The notification a control event calls for, if any.
    pub fn notification_for(&self, event: &ControlEvent) -> Option<(NotificationKind, String)> {
        match event {
            ControlEvent::CommandResolved {
                action,
                outcome,
                reason,
                ..
            } => {
                let outcome = Outcome::from_str(outcome).ok()?;
                match outcome {
                    Outcome::Failed if self.settings.errors => Some((
                        NotificationKind::Error,
                        format!("{} failed: {}", action, reason.as_deref().unwrap_or("unknown")),
                    )),
                    Outcome::Success | Outcome::Partial if self.settings.completion => {
                        let cleaning = ActionType::from_str(action)
                            .map(|a| a.is_cleaning())
                            .unwrap_or(false);
                        if !cleaning {
                            return None;
                        }
                        let message = match (outcome, reason) {
                            (Outcome::Partial, Some(reason)) => {
                                format!("{} stopped early: {}", action, reason)
                            }
                            (Outcome::Partial, None) => format!("{} stopped early", action),
                            _ => format!("{} completed", action),
                        };
                        Some((NotificationKind::Completion, message))
                    }
                    _ => None,
                }
            }
            ControlEvent::StateChanged { to, cause, .. }
                if *to == DeviceStatus::Error && cause == "fault_reported" && self.settings.errors =>
            {
                Some((
                    NotificationKind::Error,
                    "Device reported a fault; reset required".to_string(),
                ))
            }
            _ => None,
        }
    }

    /// Forward event-driven notifications until the bus closes.
    pub fn spawn(self: std::sync::Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            while let Some((event, meta)) = rx.recv().await {
                if let Some((kind, message)) = self.notification_for(&event) {
                    self.notify(kind, message, meta.timestamp);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use techsense_core::telemetry::{GridDims, SoilingGrid};
    use uuid::Uuid;

    fn sample(water: f64, tds: f64) -> TelemetrySample {
        TelemetrySample {
            timestamp: Utc::now(),
            battery_pct: 80.0,
            pv_input_w: 300.0,
            water_level_pct: water,
            tds_ppm: tds,
            soiling: SoilingGrid::uniform(GridDims::new(2, 2), 0.1),
            fault: None,
        }
    }

    fn notifier(settings: NotificationSettings) -> (Notifier, EventBus) {
        let bus = EventBus::new();
        (Notifier::new(settings, bus.clone()), bus)
    }

    #[test]
    fn test_low_water_fires_on_crossing() {
        let (notifier, bus) = notifier(NotificationSettings::default());
        let mut rx = bus.subscribe();

        notifier.observe_sample(&sample(50.0, 100.0));
        notifier.observe_sample(&sample(15.0, 100.0));
        notifier.observe_sample(&sample(14.0, 100.0));
        notifier.observe_sample(&sample(60.0, 100.0));
        notifier.observe_sample(&sample(10.0, 100.0));

        let kinds: Vec<_> = rx
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                ControlEvent::Notification { kind, .. } => Some(kind),
                _ => None,
            })
            .collect();
        assert_eq!(kinds, vec![NotificationKind::LowWater, NotificationKind::LowWater]);
    }

    #[test]
    fn test_maintenance_respects_setting() {
        let (notifier, bus) = notifier(NotificationSettings::default());
        let mut rx = bus.subscribe();
        notifier.observe_sample(&sample(80.0, 900.0));
        assert!(rx.drain().is_empty());

        let settings = NotificationSettings {
            maintenance: true,
            ..NotificationSettings::default()
        };
        let (notifier, bus) = self::notifier(settings);
        let mut rx = bus.subscribe();
        notifier.observe_sample(&sample(80.0, 900.0));
        assert_eq!(rx.drain().len(), 1);
    }

    #[test]
    fn test_event_mapping() {
        let (notifier, _bus) = notifier(NotificationSettings::default());

        let failed = ControlEvent::CommandResolved {
            command_id: Uuid::new_v4(),
            action: "full_sweep".into(),
            outcome: "failed".into(),
            reason: Some("communication timeout".into()),
        };
        let (kind, message) = notifier.notification_for(&failed).unwrap();
        assert_eq!(kind, NotificationKind::Error);
        assert_eq!(message, "full_sweep failed: communication timeout");

        let partial = ControlEvent::CommandResolved {
            command_id: Uuid::new_v4(),
            action: "spot_clean".into(),
            outcome: "partial".into(),
            reason: Some("water exhausted".into()),
        };
        let (kind, _) = notifier.notification_for(&partial).unwrap();
        assert_eq!(kind, NotificationKind::Completion);

        let paused = ControlEvent::CommandResolved {
            command_id: Uuid::new_v4(),
            action: "pause".into(),
            outcome: "success".into(),
            reason: None,
        };
        assert!(notifier.notification_for(&paused).is_none());
    }

    #[test]
    fn test_disabled_kinds() {
        let settings = NotificationSettings {
            errors: false,
            completion: false,
            ..NotificationSettings::default()
        };
        let (notifier, _bus) = notifier(settings);
        let failed = ControlEvent::CommandResolved {
            command_id: Uuid::new_v4(),
            action: "full_sweep".into(),
            outcome: "failed".into(),
            reason: None,
        };
        assert!(notifier.notification_for(&failed).is_none());
    }
}
