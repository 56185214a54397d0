//! The single gateway for outgoing commands.
//!
//! [`CommandDispatcher`] admits commands from the operator, rules and
//! schedules, resolves priority conflicts between pending ones and keeps at
//! most one command in flight. The in-flight slot is a tokio mutex; every
//! path that changes device state or records a result holds it.
//!
//! A dispatched command resolves in exactly one of three ways: the device
//! acknowledges it, the acknowledgement deadline passes, or a reset clears a
//! device that faulted mid-command. Each resolution appends one history
//! record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use techsense_core::config::{CoreConfig, SafetyConfig};
use techsense_core::device::{DeviceEvent, DeviceStateMachine, DeviceStatus};
use techsense_core::event::ControlEvent;
use techsense_core::eventbus::EventBus;
use techsense_core::telemetry::{GridDims, TelemetrySample, TelemetryStream};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::channel::{DeviceAck, DeviceChannel};
use crate::command::{
    ActionType, Command, CommandId, CommandOrigin, CommandRequest, CommandResult, Outcome,
};
use crate::error::CommandError;
use crate::history::HistoryLedger;
use crate::queue::{PendingQueue, QueueItem, Responder};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Deadline for a device acknowledgement.
    pub ack_timeout: Duration,
    pub safety: SafetyConfig,
}

impl DispatchSettings {
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            ack_timeout: config.dispatcher.ack_timeout(),
            safety: config.safety.clone(),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&CoreConfig::default())
    }
}

/// Handle returned for an admitted command.
#[derive(Debug)]
pub struct PendingCommand {
    command: Command,
    rx: oneshot::Receiver<Result<CommandResult, CommandError>>,
}

impl PendingCommand {
    pub fn id(&self) -> CommandId {
        self.command.id
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Wait for the final result.
    ///
    /// Timeouts and partial completions arrive as an `Ok` result with the
    /// corresponding outcome. `Err` means the command never ran: it was
    /// superseded while pending, or refused when its turn came.
    pub async fn outcome(self) -> Result<CommandResult, CommandError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(CommandError::Canceled("dispatcher shut down".into())),
        }
    }

    /// The result, if it is already available.
    pub fn try_outcome(&mut self) -> Option<Result<CommandResult, CommandError>> {
        self.rx.try_recv().ok()
    }
}

struct InFlight {
    command: Command,
    responder: Responder,
    /// Dropping or firing this stops the deadline timer.
    cancel_timer: oneshot::Sender<()>,
}

struct Inner {
    device: Arc<DeviceStateMachine>,
    telemetry: Arc<TelemetryStream>,
    ledger: Arc<HistoryLedger>,
    channel: Arc<dyn DeviceChannel>,
    bus: EventBus,
    settings: DispatchSettings,
    pending: Mutex<PendingQueue>,
    slot: tokio::sync::Mutex<Option<InFlight>>,
}

/// Command dispatcher. Cloning shares the same dispatcher.
#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<Inner>,
}

impl CommandDispatcher {
    pub fn new(
        device: Arc<DeviceStateMachine>,
        telemetry: Arc<TelemetryStream>,
        ledger: Arc<HistoryLedger>,
        channel: Arc<dyn DeviceChannel>,
        bus: EventBus,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                device,
                telemetry,
                ledger,
                channel,
                bus,
                settings,
                pending: Mutex::new(PendingQueue::new()),
                slot: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn grid(&self) -> GridDims {
        self.inner.telemetry.grid()
    }

    pub fn ledger(&self) -> &Arc<HistoryLedger> {
        &self.inner.ledger
    }

    pub fn device(&self) -> &Arc<DeviceStateMachine> {
        &self.inner.device
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.inner.settings
    }

    /// Validate `request` for `origin`, reporting a rejection on failure.
    pub fn prepare(
        &self,
        request: &CommandRequest,
        origin: CommandOrigin,
    ) -> Result<Command, CommandError> {
        let origin_name = origin.type_name();
        Command::new(request, origin, self.grid()).inspect_err(|e| {
            self.publish_rejection(request.action, origin_name, e);
        })
    }

    /// Admit `command` and dispatch it as soon as the slot is free.
    pub async fn submit(&self, command: Command) -> Result<PendingCommand, CommandError> {
        let pending = self.enqueue(command).await?;
        self.pump().await;
        Ok(pending)
    }

    /// Admit `command` without dispatching it.
    ///
    /// Control commands (pause, resume, reset) are delivered right away and
    /// come back already resolved. Other commands wait in the pending queue
    /// until [`pump`](Self::pump) runs, so a burst of triggers can be
    /// arbitrated by priority before any of them reaches the device.
    pub async fn enqueue(&self, command: Command) -> Result<PendingCommand, CommandError> {
        if let Err(e) = self.check_admission(&command, Utc::now()) {
            self.publish_rejection(command.action, command.origin.type_name(), &e);
            return Err(e);
        }

        if command.action.is_control() {
            return Ok(self.execute_control(command).await);
        }

        let (tx, rx) = oneshot::channel();
        let admitted = self.inner.pending.lock().admit(command.clone(), tx);
        let superseded = match admitted {
            Ok(superseded) => superseded,
            Err((e, _responder)) => {
                self.publish_rejection(command.action, command.origin.type_name(), &e);
                return Err(e);
            }
        };

        for item in superseded {
            let reason = format!(
                "superseded by {} {}",
                command.origin.type_name(),
                command.action
            );
            let canceled = item.respond(Err(CommandError::Canceled(reason.clone())));
            tracing::info!(
                command_id = %canceled.id,
                action = %canceled.action,
                origin = canceled.origin.type_name(),
                reason = %reason,
                "Pending command canceled"
            );
            self.publish_rejection(
                canceled.action,
                canceled.origin.type_name(),
                &CommandError::Canceled(reason),
            );
        }

        tracing::info!(
            command_id = %command.id,
            action = %command.action,
            origin = command.origin.type_name(),
            priority = %command.priority,
            "Command accepted"
        );
        self.inner.bus.publish(
            ControlEvent::CommandAccepted {
                command_id: command.id,
                action: command.action.to_string(),
                origin: command.origin.id(),
            },
            "dispatcher",
        );

        Ok(PendingCommand { command, rx })
    }

    /// Dispatch the best pending command if nothing is in flight.
    pub async fn pump(&self) {
        let mut slot = self.inner.slot.lock().await;
        if slot.is_some() {
            return;
        }

        while let Some(item) = self.next_pending() {
            let now = Utc::now();
            // The device may have changed state since admission.
            if let Err(e) = self.check_admission(&item.command, now) {
                self.publish_rejection(item.command.action, item.command.origin.type_name(), &e);
                item.respond(Err(e));
                continue;
            }

            let (command, responder) = item.into_parts();
            let id = command.id;
            if let Err(e) = self
                .inner
                .device
                .apply(DeviceEvent::CommandAccepted { command_id: id }, now)
            {
                let err = CommandError::StateConflict(e.to_string());
                self.publish_rejection(command.action, command.origin.type_name(), &err);
                let _ = responder.send(Err(err));
                continue;
            }

            // The acknowledgement deadline also bounds delivery.
            let deadline = Instant::now() + self.inner.settings.ack_timeout;
            match tokio::time::timeout_at(deadline, self.inner.channel.send(&command)).await {
                Ok(Ok(())) => {
                    tracing::info!(
                        command_id = %id,
                        action = %command.action,
                        origin = command.origin.type_name(),
                        "Command dispatched"
                    );
                    let (cancel_timer, cancel_rx) = oneshot::channel();
                    self.spawn_deadline(id, deadline, cancel_rx);
                    *slot = Some(InFlight {
                        command,
                        responder,
                        cancel_timer,
                    });
                    return;
                }
                Ok(Err(e)) => {
                    tracing::warn!(command_id = %id, error = %e, "Command delivery failed");
                    let result = CommandResult::failed(id, e.to_string(), Utc::now());
                    self.finish(command, responder, result, true);
                }
                Err(_) => {
                    tracing::warn!(
                        command_id = %id,
                        timeout_secs = self.inner.settings.ack_timeout.as_secs(),
                        "Command delivery did not complete before deadline"
                    );
                    let result = CommandResult::timed_out(id, Utc::now());
                    self.finish(command, responder, result, true);
                }
            }
        }
    }

    /// Feed a device acknowledgement.
    ///
    /// An acknowledgement that does not match the in-flight command is
    /// logged and ignored with [`CommandError::UnknownDevice`].
    pub async fn acknowledge(&self, ack: DeviceAck) -> Result<(), CommandError> {
        let mut slot = self.inner.slot.lock().await;
        let inflight = match slot.take() {
            Some(inflight) if inflight.command.id == ack.command_id => inflight,
            other => {
                *slot = other;
                tracing::warn!(
                    command_id = %ack.command_id,
                    "Acknowledgement for unknown command ignored"
                );
                return Err(CommandError::UnknownDevice(ack.command_id));
            }
        };

        let _ = inflight.cancel_timer.send(());
        let result = ack.into_result(Utc::now());
        if result.outcome == Outcome::Partial {
            tracing::info!(
                command_id = %result.command_id,
                reason = result.reason.as_deref().unwrap_or(""),
                "Command partially completed"
            );
        }
        self.finish(inflight.command, inflight.responder, result, true);
        drop(slot);

        self.pump().await;
        Ok(())
    }

    /// Apply the telemetry-driven device transitions for `sample`.
    pub async fn observe_sample(&self, sample: &TelemetrySample) {
        let _slot = self.inner.slot.lock().await;
        self.inner.device.observe_sample(sample);
    }

    /// The command currently awaiting acknowledgement.
    pub async fn in_flight(&self) -> Option<Command> {
        self.inner
            .slot
            .lock()
            .await
            .as_ref()
            .map(|inflight| inflight.command.clone())
    }

    /// Commands admitted but not yet dispatched, highest priority first.
    pub fn pending(&self) -> Vec<Command> {
        self.inner.pending.lock().snapshot()
    }

    fn next_pending(&self) -> Option<QueueItem> {
        self.inner.pending.lock().pop()
    }

    async fn execute_control(&self, command: Command) -> PendingCommand {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.inner.slot.lock().await;

        let result = self.deliver_control(&command).await;

        // A reset abandons whatever the device was running when it faulted.
        if command.action == ActionType::Reset && result.outcome == Outcome::Success {
            if let Some(inflight) = slot.take() {
                let _ = inflight.cancel_timer.send(());
                let abandoned =
                    CommandResult::failed(inflight.command.id, "device reset", Utc::now());
                self.finish(inflight.command, inflight.responder, abandoned, false);
            }
        }

        let pending_command = command.clone();
        self.finish(command, tx, result, false);
        drop(slot);

        PendingCommand {
            command: pending_command,
            rx,
        }
    }

    /// Deliver a control command and apply its device transition.
    async fn deliver_control(&self, command: &Command) -> CommandResult {
        let event = match control_event(command.action) {
            Some(event) => event,
            None => {
                return CommandResult::failed(
                    command.id,
                    format!("{} is not a control action", command.action),
                    Utc::now(),
                )
            }
        };

        let delivery =
            tokio::time::timeout(self.inner.settings.ack_timeout, self.inner.channel.send(command))
                .await;
        let now = Utc::now();
        match delivery {
            Ok(Ok(())) => match self.inner.device.apply(event, now) {
                Ok(_) => CommandResult::new(command.id, Outcome::Success, now),
                Err(e) => CommandResult::failed(command.id, e.to_string(), now),
            },
            Ok(Err(e)) => CommandResult::failed(command.id, e.to_string(), now),
            Err(_) => {
                tracing::warn!(
                    command_id = %command.id,
                    action = %command.action,
                    "Control command delivery did not complete before deadline"
                );
                CommandResult::timed_out(command.id, now)
            }
        }
    }

    fn spawn_deadline(
        &self,
        id: CommandId,
        mut deadline: Instant,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let dispatcher = self.clone();
        let timeout = self.inner.settings.ack_timeout;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => return,
                    _ = tokio::time::sleep_until(deadline) => {
                        if dispatcher.inner.device.status() == DeviceStatus::Paused {
                            tracing::debug!(command_id = %id, "Acknowledgement deadline re-armed while paused");
                            deadline = Instant::now() + timeout;
                            continue;
                        }
                        dispatcher.expire(id).await;
                        return;
                    }
                }
            }
        });
    }

    async fn expire(&self, id: CommandId) {
        let mut slot = self.inner.slot.lock().await;
        let inflight = match slot.take() {
            Some(inflight) if inflight.command.id == id => inflight,
            other => {
                *slot = other;
                return;
            }
        };

        tracing::warn!(
            command_id = %id,
            timeout_secs = self.inner.settings.ack_timeout.as_secs(),
            "No acknowledgement before deadline"
        );
        let result = CommandResult::timed_out(id, Utc::now());
        self.finish(inflight.command, inflight.responder, result, true);
        drop(slot);

        self.pump().await;
    }

    /// Record a resolved command. Callers hold the slot.
    fn finish(
        &self,
        command: Command,
        responder: Responder,
        result: CommandResult,
        apply_state: bool,
    ) {
        if apply_state {
            let event = if result.outcome.is_completed() {
                DeviceEvent::CommandSucceeded {
                    command_id: command.id,
                }
            } else if result.is_timeout() {
                DeviceEvent::AckTimeout {
                    command_id: command.id,
                }
            } else {
                DeviceEvent::CommandFailed {
                    command_id: command.id,
                }
            };
            if let Err(e) = self.inner.device.apply(event, result.completed_at) {
                tracing::warn!(
                    command_id = %command.id,
                    error = %e,
                    "Device state not updated for resolved command"
                );
            }
        }

        tracing::info!(
            command_id = %command.id,
            action = %command.action,
            origin = command.origin.type_name(),
            outcome = %result.outcome,
            reason = result.reason.as_deref().unwrap_or(""),
            "Command resolved"
        );
        self.inner.bus.publish(
            ControlEvent::CommandResolved {
                command_id: command.id,
                action: command.action.to_string(),
                outcome: result.outcome.to_string(),
                reason: result.reason.clone(),
            },
            "dispatcher",
        );
        self.inner.ledger.append(command, result.clone());
        let _ = responder.send(Ok(result));
    }

    fn check_admission(&self, command: &Command, now: DateTime<Utc>) -> Result<(), CommandError> {
        use ActionType::{Pause, Reset, Resume};
        use DeviceStatus::{Cleaning, Error, Idle, Paused};

        let conflict = |msg: String| Err(CommandError::StateConflict(msg));
        match (self.inner.device.status(), command.action) {
            (Error, Reset) => Ok(()),
            (Error, _) => conflict("device is in error; only reset is accepted".into()),
            (_, Reset) => conflict("reset is only accepted while the device is in error".into()),
            (Paused, Resume) => Ok(()),
            (_, Resume) => conflict("device is not paused".into()),
            (Paused, Pause) => conflict("device is already paused".into()),
            (_, Pause) => Ok(()),
            (Cleaning, _) if !command.origin.is_manual() => conflict(format!(
                "device is cleaning; {} commands are not accepted",
                command.origin.type_name()
            )),
            (Cleaning, _) => {
                conflict("device is cleaning; only control commands may interrupt".into())
            }
            (Paused, _) => conflict("device is paused".into()),
            (Idle, _) => self.check_safety(command, now),
        }
    }

    fn check_safety(&self, command: &Command, now: DateTime<Utc>) -> Result<(), CommandError> {
        if !command.action.is_cleaning() {
            return Ok(());
        }
        let safety = &self.inner.settings.safety;
        let latest = self.inner.telemetry.latest();

        if !command.origin.is_manual() {
            if self.inner.telemetry.is_stale(now) {
                return Err(CommandError::StateConflict(
                    "telemetry is stale; automatic cleaning suspended".into(),
                ));
            }
            if let Some(sample) = &latest {
                if sample.battery_pct < safety.min_battery_pct {
                    return Err(CommandError::StateConflict(format!(
                        "battery {:.0}% below {:.0}% required for automatic cleaning",
                        sample.battery_pct, safety.min_battery_pct
                    )));
                }
            }
        }

        if let Some(sample) = &latest {
            if sample.water_level_pct < safety.min_water_pct {
                return Err(CommandError::StateConflict(format!(
                    "water level {:.0}% below {:.0}% required for cleaning",
                    sample.water_level_pct, safety.min_water_pct
                )));
            }
        }
        Ok(())
    }

    fn publish_rejection(&self, action: ActionType, origin: &str, err: &CommandError) {
        tracing::info!(
            action = %action,
            origin = origin,
            kind = err.kind(),
            reason = %err,
            "Command rejected"
        );
        self.inner.bus.publish(
            ControlEvent::CommandRejected {
                action: action.to_string(),
                origin: origin.to_string(),
                kind: err.kind().to_string(),
                reason: err.to_string(),
            },
            "dispatcher",
        );
    }
}

fn control_event(action: ActionType) -> Option<DeviceEvent> {
    match action {
        ActionType::Pause => Some(DeviceEvent::Pause),
        ActionType::Resume => Some(DeviceEvent::Resume),
        ActionType::Reset => Some(DeviceEvent::Reset),
        ActionType::SpotClean | ActionType::RowClean | ActionType::FullSweep | ActionType::Move => {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_event_only_for_control_actions() {
        assert!(matches!(control_event(ActionType::Pause), Some(DeviceEvent::Pause)));
        assert!(matches!(control_event(ActionType::Resume), Some(DeviceEvent::Resume)));
        assert!(matches!(control_event(ActionType::Reset), Some(DeviceEvent::Reset)));
        for action in [
            ActionType::SpotClean,
            ActionType::RowClean,
            ActionType::FullSweep,
            ActionType::Move,
        ] {
            assert!(control_event(action).is_none());
            assert!(!action.is_control());
        }
    }
}
