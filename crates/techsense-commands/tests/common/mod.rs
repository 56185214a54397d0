//! Shared fixtures for dispatcher tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use techsense_commands::{
    ActionType, Command, CommandDispatcher, CommandError, CommandOrigin, CommandRequest,
    DeviceChannel, DispatchSettings, HistoryLedger,
};
use techsense_core::{
    config::{SafetyConfig, TelemetryConfig},
    device::DeviceStateMachine,
    eventbus::EventBus,
    telemetry::{GridDims, SoilingGrid, TelemetrySample, TelemetryStream},
};

/// Channel that records every delivered command.
#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<Command>>,
    fail: Mutex<bool>,
    stall: Mutex<bool>,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<Command> {
        self.sent.lock().clone()
    }

    pub fn sent_actions(&self) -> Vec<ActionType> {
        self.sent.lock().iter().map(|c| c.action).collect()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    /// Make every later delivery hang without completing.
    pub fn set_stalled(&self, stall: bool) {
        *self.stall.lock() = stall;
    }
}

#[async_trait]
impl DeviceChannel for RecordingChannel {
    async fn send(&self, command: &Command) -> Result<(), CommandError> {
        let stalled = *self.stall.lock();
        if stalled {
            std::future::pending::<()>().await;
        }
        if *self.fail.lock() {
            return Err(CommandError::Channel("link down".into()));
        }
        self.sent.lock().push(command.clone());
        Ok(())
    }
}

pub struct Harness {
    pub dispatcher: CommandDispatcher,
    pub device: Arc<DeviceStateMachine>,
    pub telemetry: Arc<TelemetryStream>,
    pub ledger: Arc<HistoryLedger>,
    pub channel: Arc<RecordingChannel>,
    pub bus: EventBus,
}

pub fn grid() -> GridDims {
    GridDims::new(6, 8)
}

pub fn harness() -> Harness {
    harness_with_timeout(Duration::from_secs(30))
}

pub fn harness_with_timeout(ack_timeout: Duration) -> Harness {
    let bus = EventBus::new();
    let device = Arc::new(DeviceStateMachine::new().with_event_bus(bus.clone()));
    let telemetry = Arc::new(TelemetryStream::new(&TelemetryConfig::default(), grid()));
    let ledger = Arc::new(HistoryLedger::new());
    let channel = Arc::new(RecordingChannel::default());
    let settings = DispatchSettings {
        ack_timeout,
        safety: SafetyConfig::default(),
    };
    let dispatcher = CommandDispatcher::new(
        device.clone(),
        telemetry.clone(),
        ledger.clone(),
        channel.clone(),
        bus.clone(),
        settings,
    );
    Harness {
        dispatcher,
        device,
        telemetry,
        ledger,
        channel,
        bus,
    }
}

/// Helper to create a sample stamped now.
pub fn sample(battery: f64, water: f64) -> TelemetrySample {
    TelemetrySample {
        timestamp: Utc::now(),
        battery_pct: battery,
        pv_input_w: 350.0,
        water_level_pct: water,
        tds_ppm: 120.0,
        soiling: SoilingGrid::uniform(grid(), 0.2),
        fault: None,
    }
}

pub fn manual(action: ActionType) -> Command {
    Command::new(&CommandRequest::new(action), CommandOrigin::manual(), grid()).unwrap()
}

pub fn from_rule(action: ActionType) -> Command {
    let origin = CommandOrigin::Rule {
        rule_id: "rule-1".into(),
        rule_name: "High Soiling Auto-Clean".into(),
    };
    Command::new(&CommandRequest::new(action), origin, grid()).unwrap()
}

pub fn from_schedule(action: ActionType) -> Command {
    let origin = CommandOrigin::Schedule {
        schedule_id: "schedule-1".into(),
        schedule_name: "Midday Spot Check".into(),
        due: Utc::now(),
    };
    Command::new(&CommandRequest::new(action), origin, grid()).unwrap()
}
