//! Command dispatcher tests.
//!
//! Covers priority arbitration, single-flight dispatch, acknowledgement
//! deadlines and the device state guard.

mod common;

use std::time::Duration;

use techsense_commands::{
    ActionType, CommandError, DeviceAck, HistoryFilter, Outcome, TIMEOUT_REASON,
};
use techsense_core::device::DeviceStatus;

use common::{from_rule, from_schedule, harness, harness_with_timeout, manual, sample};

#[tokio::test]
async fn test_manual_cancels_pending_schedule_command() {
    let h = harness();
    h.telemetry.ingest(sample(80.0, 60.0)).unwrap();

    let scheduled = h
        .dispatcher
        .enqueue(from_schedule(ActionType::SpotClean))
        .await
        .unwrap();
    assert_eq!(h.dispatcher.pending().len(), 1);

    let sweep = h
        .dispatcher
        .submit(manual(ActionType::FullSweep))
        .await
        .unwrap();

    assert!(matches!(
        scheduled.outcome().await,
        Err(CommandError::Canceled(_))
    ));
    assert_eq!(h.channel.sent_actions(), vec![ActionType::FullSweep]);
    assert_eq!(h.dispatcher.in_flight().await.unwrap().id, sweep.id());
    assert_eq!(h.device.status(), DeviceStatus::Cleaning);
    // Canceled commands never ran and are not in the history.
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn test_equal_priority_first_submitted_wins() {
    let h = harness();
    h.telemetry.ingest(sample(80.0, 60.0)).unwrap();

    let first = h
        .dispatcher
        .enqueue(from_rule(ActionType::RowClean))
        .await
        .unwrap();
    let second = h.dispatcher.enqueue(from_rule(ActionType::FullSweep)).await;
    assert!(matches!(second, Err(CommandError::StateConflict(_))));

    // A lower priority arrival is refused too.
    let third = h.dispatcher.enqueue(from_schedule(ActionType::FullSweep)).await;
    assert!(matches!(third, Err(CommandError::StateConflict(_))));

    h.dispatcher.pump().await;
    assert_eq!(h.channel.sent_actions(), vec![ActionType::RowClean]);
    assert_eq!(h.dispatcher.in_flight().await.unwrap().id, first.id());
}

#[tokio::test]
async fn test_ack_resolves_and_records() {
    let h = harness();
    let pending = h
        .dispatcher
        .submit(manual(ActionType::FullSweep))
        .await
        .unwrap();
    let id = pending.id();

    h.dispatcher
        .acknowledge(DeviceAck::success(id).with_usage(45 * 60, 12.5, 2.3))
        .await
        .unwrap();

    let result = pending.outcome().await.unwrap();
    assert_eq!(result.outcome, Outcome::Success);
    assert_eq!(result.water_used_l, 12.5);
    assert_eq!(h.device.status(), DeviceStatus::Idle);
    assert!(h.dispatcher.in_flight().await.is_none());

    let records: Vec<_> = h.ledger.query(HistoryFilter::all()).collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].command.id, id);
}

#[tokio::test]
async fn test_partial_completion_returns_to_idle() {
    let h = harness();
    let pending = h
        .dispatcher
        .submit(manual(ActionType::FullSweep))
        .await
        .unwrap();
    let id = pending.id();

    h.dispatcher
        .acknowledge(
            DeviceAck::success(id).with_outcome(Outcome::Partial, Some("Low water level".into())),
        )
        .await
        .unwrap();

    let result = pending.outcome().await.unwrap();
    assert_eq!(result.outcome, Outcome::Partial);
    assert_eq!(result.error(30).unwrap().kind(), "partial_completion");
    assert_eq!(h.device.status(), DeviceStatus::Idle);
    assert_eq!(h.ledger.len(), 1);
}

#[tokio::test]
async fn test_failed_ack_moves_device_to_error() {
    let h = harness();
    let pending = h
        .dispatcher
        .submit(manual(ActionType::RowClean))
        .await
        .unwrap();
    let id = pending.id();

    h.dispatcher
        .acknowledge(
            DeviceAck::success(id).with_outcome(Outcome::Failed, Some("brush jammed".into())),
        )
        .await
        .unwrap();

    assert_eq!(pending.outcome().await.unwrap().outcome, Outcome::Failed);
    assert_eq!(h.device.status(), DeviceStatus::Error);
}

#[tokio::test]
async fn test_unknown_ack_is_ignored() {
    let h = harness();
    let pending = h
        .dispatcher
        .submit(manual(ActionType::SpotClean))
        .await
        .unwrap();

    let stray = uuid::Uuid::new_v4();
    let err = h
        .dispatcher
        .acknowledge(DeviceAck::success(stray))
        .await
        .unwrap_err();
    assert_eq!(err, CommandError::UnknownDevice(stray));

    assert_eq!(h.device.status(), DeviceStatus::Cleaning);
    assert_eq!(h.dispatcher.in_flight().await.unwrap().id, pending.id());
    assert!(h.ledger.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_command_and_blocks_until_reset() {
    let h = harness_with_timeout(Duration::from_secs(30));
    let pending = h
        .dispatcher
        .submit(manual(ActionType::FullSweep))
        .await
        .unwrap();

    let result = pending.outcome().await.unwrap();
    assert_eq!(result.outcome, Outcome::Failed);
    assert_eq!(result.reason.as_deref(), Some(TIMEOUT_REASON));
    assert_eq!(result.error(30).unwrap().kind(), "communication_timeout");
    assert_eq!(h.device.status(), DeviceStatus::Error);
    assert!(h.dispatcher.in_flight().await.is_none());

    for command in [
        manual(ActionType::SpotClean),
        manual(ActionType::Pause),
        from_rule(ActionType::FullSweep),
    ] {
        let err = h.dispatcher.submit(command).await.unwrap_err();
        assert!(matches!(err, CommandError::StateConflict(_)));
    }
    // Rejections are not history.
    assert_eq!(h.ledger.len(), 1);

    let reset = h.dispatcher.submit(manual(ActionType::Reset)).await.unwrap();
    assert_eq!(reset.outcome().await.unwrap().outcome, Outcome::Success);
    assert_eq!(h.device.status(), DeviceStatus::Idle);
    assert_eq!(h.ledger.len(), 2);

    // No automatic retry happened.
    assert_eq!(
        h.channel.sent_actions(),
        vec![ActionType::FullSweep, ActionType::Reset]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stalled_delivery_times_out_to_error() {
    let h = harness_with_timeout(Duration::from_secs(30));
    h.channel.set_stalled(true);

    let submit = {
        let dispatcher = h.dispatcher.clone();
        tokio::spawn(async move { dispatcher.submit(manual(ActionType::FullSweep)).await })
    };
    tokio::time::sleep(Duration::from_secs(600)).await;

    let pending = submit.await.unwrap().unwrap();
    let result = pending.outcome().await.unwrap();
    assert!(result.is_timeout());
    assert_eq!(h.device.status(), DeviceStatus::Error);
    assert_eq!(h.ledger.len(), 1);

    // The slot was released.
    let in_flight = tokio::time::timeout(Duration::from_secs(5), h.dispatcher.in_flight()).await;
    assert!(matches!(in_flight, Ok(None)));

    h.channel.set_stalled(false);
    let reset = h.dispatcher.submit(manual(ActionType::Reset)).await.unwrap();
    assert_eq!(reset.outcome().await.unwrap().outcome, Outcome::Success);
    assert_eq!(h.device.status(), DeviceStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_control_delivery_times_out() {
    let h = harness_with_timeout(Duration::from_secs(30));
    let pending = h
        .dispatcher
        .submit(manual(ActionType::FullSweep))
        .await
        .unwrap();

    h.channel.set_stalled(true);
    let pause = h.dispatcher.submit(manual(ActionType::Pause)).await.unwrap();
    let pause_id = pause.id();
    let result = pause.outcome().await.unwrap();
    assert!(result.is_timeout());
    assert_eq!(result.command_id, pause_id);

    // The sweep keeps its own deadline and still resolves.
    let sweep = pending.outcome().await.unwrap();
    assert!(sweep.is_timeout());
    assert_eq!(h.device.status(), DeviceStatus::Error);
    assert_eq!(h.ledger.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_pause_rearms_deadline() {
    let h = harness_with_timeout(Duration::from_secs(30));
    let mut pending = h
        .dispatcher
        .submit(manual(ActionType::FullSweep))
        .await
        .unwrap();

    let pause = h.dispatcher.submit(manual(ActionType::Pause)).await.unwrap();
    assert_eq!(pause.outcome().await.unwrap().outcome, Outcome::Success);
    assert_eq!(h.device.status(), DeviceStatus::Paused);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert!(pending.try_outcome().is_none());
    assert!(h.dispatcher.in_flight().await.is_some());

    h.dispatcher.submit(manual(ActionType::Resume)).await.unwrap();
    assert_eq!(h.device.status(), DeviceStatus::Cleaning);

    let result = pending.outcome().await.unwrap();
    assert!(result.is_timeout());
    assert_eq!(h.device.status(), DeviceStatus::Error);
}

#[tokio::test]
async fn test_result_while_paused_resumes_to_idle() {
    let h = harness();
    let pending = h
        .dispatcher
        .submit(manual(ActionType::SpotClean))
        .await
        .unwrap();
    h.dispatcher.submit(manual(ActionType::Pause)).await.unwrap();

    h.dispatcher
        .acknowledge(DeviceAck::success(pending.id()))
        .await
        .unwrap();
    assert_eq!(h.device.status(), DeviceStatus::Paused);

    h.dispatcher.submit(manual(ActionType::Resume)).await.unwrap();
    assert_eq!(h.device.status(), DeviceStatus::Idle);
}

#[tokio::test]
async fn test_state_guard_while_cleaning() {
    let h = harness();
    h.telemetry.ingest(sample(80.0, 60.0)).unwrap();
    h.dispatcher
        .submit(manual(ActionType::FullSweep))
        .await
        .unwrap();

    let rule = h.dispatcher.submit(from_rule(ActionType::SpotClean)).await;
    assert!(matches!(rule, Err(CommandError::StateConflict(_))));

    let operator = h.dispatcher.submit(manual(ActionType::RowClean)).await;
    assert!(matches!(operator, Err(CommandError::StateConflict(_))));

    assert_eq!(h.channel.sent().len(), 1);
}

#[tokio::test]
async fn test_single_flight_under_concurrent_submissions() {
    let h = harness();
    h.telemetry.ingest(sample(80.0, 60.0)).unwrap();

    let d1 = h.dispatcher.clone();
    let d2 = h.dispatcher.clone();
    let d3 = h.dispatcher.clone();
    let (a, b, c) = tokio::join!(
        d1.submit(from_schedule(ActionType::SpotClean)),
        d2.submit(from_rule(ActionType::RowClean)),
        d3.submit(manual(ActionType::FullSweep)),
    );

    let admitted = [a.is_ok(), b.is_ok(), c.is_ok()];
    assert!(admitted.iter().any(|ok| *ok));
    assert_eq!(h.channel.sent().len(), 1);
    assert!(h.dispatcher.in_flight().await.is_some());
    assert!(h.dispatcher.pending().is_empty());
}

#[tokio::test]
async fn test_safety_guards() {
    let h = harness();

    // Automatic commands need fresh telemetry.
    let err = h
        .dispatcher
        .submit(from_rule(ActionType::FullSweep))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("stale"));

    h.telemetry.ingest(sample(20.0, 60.0)).unwrap();
    let err = h
        .dispatcher
        .submit(from_schedule(ActionType::FullSweep))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("battery"));

    // The battery floor only applies to automatic cleaning.
    let manual_low_battery = h.dispatcher.submit(manual(ActionType::SpotClean)).await;
    assert!(manual_low_battery.is_ok());
}

#[tokio::test]
async fn test_low_water_blocks_manual_cleaning() {
    let h = harness();
    h.telemetry.ingest(sample(90.0, 2.0)).unwrap();

    let err = h
        .dispatcher
        .submit(manual(ActionType::FullSweep))
        .await
        .unwrap_err();
    assert!(matches!(err, CommandError::StateConflict(_)));
    assert!(err.to_string().contains("water"));

    // Moving does not use water.
    let mv = techsense_commands::Command::new(
        &techsense_commands::CommandRequest::new(ActionType::Move)
            .with_position(techsense_commands::Position::new(10.0, 20.0, 30.0)),
        techsense_commands::CommandOrigin::manual(),
        common::grid(),
    )
    .unwrap();
    assert!(h.dispatcher.submit(mv).await.is_ok());
}

#[tokio::test]
async fn test_channel_failure_records_failed_command() {
    let h = harness();
    h.channel.set_failing(true);

    let pending = h
        .dispatcher
        .submit(manual(ActionType::SpotClean))
        .await
        .unwrap();
    let result = pending.outcome().await.unwrap();
    assert_eq!(result.outcome, Outcome::Failed);
    assert!(result.reason.unwrap().contains("link down"));
    assert_eq!(h.device.status(), DeviceStatus::Error);
    assert_eq!(h.ledger.len(), 1);
}

#[tokio::test]
async fn test_reset_abandons_command_after_fault() {
    let h = harness();
    let pending = h
        .dispatcher
        .submit(manual(ActionType::FullSweep))
        .await
        .unwrap();

    let mut faulted = sample(70.0, 50.0);
    faulted.fault = Some("wheel slip".into());
    h.dispatcher.observe_sample(&faulted).await;
    assert_eq!(h.device.status(), DeviceStatus::Error);

    h.dispatcher.submit(manual(ActionType::Reset)).await.unwrap();
    assert_eq!(h.device.status(), DeviceStatus::Idle);

    let abandoned = pending.outcome().await.unwrap();
    assert_eq!(abandoned.outcome, Outcome::Failed);
    assert_eq!(abandoned.reason.as_deref(), Some("device reset"));
    assert!(h.dispatcher.in_flight().await.is_none());
    assert_eq!(h.ledger.len(), 2);
}

#[tokio::test]
async fn test_every_resolution_recorded_once_in_order() {
    let h = harness();
    let mut ids = Vec::new();

    for action in [ActionType::SpotClean, ActionType::RowClean, ActionType::FullSweep] {
        let pending = h.dispatcher.submit(manual(action)).await.unwrap();
        ids.push(pending.id());
        h.dispatcher
            .acknowledge(DeviceAck::success(pending.id()))
            .await
            .unwrap();
    }
    let pause = h.dispatcher.submit(manual(ActionType::Pause)).await.unwrap();
    ids.push(pause.id());

    let recorded: Vec<_> = h
        .ledger
        .query(HistoryFilter::all())
        .map(|r| r.command.id)
        .collect();
    assert_eq!(recorded, ids);
}

#[tokio::test]
async fn test_events_published() {
    let h = harness();
    let mut rx = h.bus.subscribe();

    let pending = h
        .dispatcher
        .submit(manual(ActionType::SpotClean))
        .await
        .unwrap();
    h.dispatcher
        .acknowledge(DeviceAck::success(pending.id()))
        .await
        .unwrap();
    let _ = h.dispatcher.submit(manual(ActionType::Resume)).await;

    let names: Vec<_> = rx.drain().iter().map(|e| e.type_name()).collect();
    assert_eq!(
        names,
        vec![
            "CommandAccepted",
            "StateChanged",
            "StateChanged",
            "CommandResolved",
            "CommandRejected",
        ]
    );
}
