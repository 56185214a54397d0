//! The per-device control loop.
//!
//! A [`DeviceSession`] owns one instance of every control component and
//! wires them together:
//!
//! ```text
//! telemetry ─► device state ─► rule engine ─┐
//!                                            ├─► dispatcher ─► device channel
//! scheduler tick ─► schedule engine ─────────┘        │
//!                                                     └─► history ledger
//! ```
//!
//! Handlers run one at a time from [`DeviceSession::run`]; they can also be
//! called directly, which is how the tests drive a session.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use techsense_commands::{
    CommandDispatcher, CommandError, CommandOrigin, CommandRequest, DeviceAck, DeviceChannel,
    DispatchSettings, HistoryLedger, PendingCommand,
};
use techsense_core::telemetry::{TelemetrySample, TelemetryStream};
use techsense_core::{DeviceStateMachine, EventBus, NotificationKind, Result};
use techsense_rules::{RuleEngine, ScheduleEngine, TriggerAction, TriggerEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ControlConfig;
use crate::notify::Notifier;
use crate::snapshot::StatusSnapshot;

/// A manual command request from the presentation layer.
#[derive(Debug)]
pub struct ManualRequest {
    pub request: CommandRequest,
    pub reply: oneshot::Sender<std::result::Result<PendingCommand, CommandError>>,
}

impl ManualRequest {
    pub fn new(
        request: CommandRequest,
    ) -> (
        Self,
        oneshot::Receiver<std::result::Result<PendingCommand, CommandError>>,
    ) {
        let (reply, rx) = oneshot::channel();
        (Self { request, reply }, rx)
    }
}

/// Inputs consumed by [`DeviceSession::run`].
///
/// The session stops when the telemetry sender is dropped.
pub struct SessionInputs {
    pub samples: mpsc::Receiver<TelemetrySample>,
    pub acks: mpsc::Receiver<DeviceAck>,
    pub manual: mpsc::Receiver<ManualRequest>,
}

/// Control session for one device.
pub struct DeviceSession {
    telemetry: Arc<TelemetryStream>,
    device: Arc<DeviceStateMachine>,
    ledger: Arc<HistoryLedger>,
    dispatcher: CommandDispatcher,
    rules: RuleEngine,
    schedules: ScheduleEngine,
    notifier: Arc<Notifier>,
    bus: EventBus,
    tick_interval: Duration,
}

impl DeviceSession {
    /// Build a session from `config`, talking to the device over `channel`.
    pub async fn new(config: &ControlConfig, channel: Arc<dyn DeviceChannel>) -> Result<Self> {
        config.validate()?;
        let core = &config.core;
        let grid = core.device.grid();
        let tz = core.device.tz()?;
        let bus = EventBus::new();

        let ledger = Arc::new(match &core.storage.history_db {
            Some(path) => HistoryLedger::open(path)?,
            None => HistoryLedger::new(),
        });
        let telemetry = Arc::new(TelemetryStream::new(&core.telemetry, grid));
        let device = Arc::new(DeviceStateMachine::new().with_event_bus(bus.clone()));
        let dispatcher = CommandDispatcher::new(
            device.clone(),
            telemetry.clone(),
            ledger.clone(),
            channel,
            bus.clone(),
            DispatchSettings::from_config(core),
        );

        let rules = RuleEngine::new(&core.rule_engine, grid).with_event_bus(bus.clone());
        for rule in &config.rules {
            rules.add_rule(rule.clone()).await?;
        }
        let schedules = ScheduleEngine::new(tz, grid, ledger.clone()).with_event_bus(bus.clone());
        for schedule in &config.schedules {
            schedules.add_schedule(schedule.clone()).await?;
        }

        let notifier = Arc::new(Notifier::new(core.notifications.clone(), bus.clone()));

        tracing::info!(
            grid = %format!("{}x{}", grid.rows, grid.cols),
            timezone = %tz,
            rules = config.rules.len(),
            schedules = config.schedules.len(),
            history = ledger.len(),
            "Device session created"
        );

        Ok(Self {
            telemetry,
            device,
            ledger,
            dispatcher,
            rules,
            schedules,
            notifier,
            bus,
            tick_interval: core.scheduler.tick_interval(),
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn telemetry(&self) -> &Arc<TelemetryStream> {
        &self.telemetry
    }

    pub fn device(&self) -> &Arc<DeviceStateMachine> {
        &self.device
    }

    pub fn ledger(&self) -> &Arc<HistoryLedger> {
        &self.ledger
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn rules(&self) -> &RuleEngine {
        &self.rules
    }

    pub fn schedules(&self) -> &ScheduleEngine {
        &self.schedules
    }

    /// Current dashboard snapshot, once a sample has arrived.
    pub fn snapshot(&self) -> Option<StatusSnapshot> {
        self.telemetry
            .latest()
            .map(|sample| StatusSnapshot::new(&sample, self.device.status(), &self.ledger))
    }

    /// Start forwarding event-driven notifications.
    pub fn spawn_notifier(&self) -> JoinHandle<()> {
        self.notifier.clone().spawn()
    }

    /// Ingest a telemetry sample and react to it.
    ///
    /// Returns the trigger events raised by rules. A rejected sample changes
    /// nothing.
    pub async fn handle_sample(&self, sample: TelemetrySample) -> Result<Vec<TriggerEvent>> {
        let sample = self.telemetry.ingest(sample)?;
        self.dispatcher.observe_sample(&sample).await;
        self.notifier.observe_sample(&sample);

        let triggers = self.rules.evaluate(&sample).await;
        self.dispatch_triggers(&triggers).await;
        Ok(triggers)
    }

    /// Run a scheduler tick at `now`.
    pub async fn handle_tick(&self, now: DateTime<Utc>) -> Vec<TriggerEvent> {
        let triggers = self.schedules.tick(now, self.device.status()).await;
        self.dispatch_triggers(&triggers).await;
        triggers
    }

    /// Submit an operator command.
    pub async fn submit_manual(
        &self,
        request: &CommandRequest,
    ) -> std::result::Result<PendingCommand, CommandError> {
        let command = self.dispatcher.prepare(request, CommandOrigin::manual())?;
        self.dispatcher.submit(command).await
    }

    /// Feed a device acknowledgement.
    pub async fn handle_ack(&self, ack: DeviceAck) -> std::result::Result<(), CommandError> {
        self.dispatcher.acknowledge(ack).await
    }

    /// Admit every trigger first, then dispatch once, so triggers raised
    /// together are arbitrated by priority.
    async fn dispatch_triggers(&self, triggers: &[TriggerEvent]) {
        let mut admitted = false;
        for trigger in triggers {
            match &trigger.action {
                TriggerAction::Alert { message } => {
                    self.notifier
                        .notify(NotificationKind::Alert, message.clone(), trigger.fired_at);
                }
                TriggerAction::Command { request } => {
                    let command = match self.dispatcher.prepare(request, trigger.origin.clone()) {
                        Ok(command) => command,
                        Err(e) => {
                            tracing::warn!(source = %trigger.source(), error = %e, "Invalid trigger request");
                            continue;
                        }
                    };
                    match self.dispatcher.enqueue(command).await {
                        Ok(_) => admitted = true,
                        Err(e) => {
                            tracing::info!(
                                source = %trigger.source(),
                                action = trigger.action_name(),
                                kind = e.kind(),
                                reason = %e,
                                "Trigger not admitted"
                            );
                        }
                    }
                }
            }
        }
        if admitted {
            self.dispatcher.pump().await;
        }
    }

    /// Drive the session until the telemetry feed closes.
    pub async fn run(&self, mut inputs: SessionInputs) {
        let notifier = self.spawn_notifier();
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(tick_secs = self.tick_interval.as_secs(), "Device session started");
        loop {
            tokio::select! {
                sample = inputs.samples.recv() => match sample {
                    Some(sample) => {
                        if let Err(e) = self.handle_sample(sample).await {
                            tracing::warn!(error = %e, "Telemetry sample rejected");
                        }
                    }
                    None => break,
                },
                Some(ack) = inputs.acks.recv() => {
                    // Unknown acknowledgements are logged by the dispatcher.
                    let _ = self.handle_ack(ack).await;
                }
                Some(manual) = inputs.manual.recv() => {
                    let result = self.submit_manual(&manual.request).await;
                    if let Err(e) = &result {
                        tracing::info!(action = %manual.request.action, error = %e, "Manual command rejected");
                    }
                    let _ = manual.reply.send(result);
                }
                _ = ticker.tick() => {
                    self.handle_tick(Utc::now()).await;
                }
            }
        }

        notifier.abort();
        tracing::info!(history = self.ledger.len(), "Device session stopped");
    }
}
