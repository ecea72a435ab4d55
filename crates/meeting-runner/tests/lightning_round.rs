//! End-to-end lightning round through the runner, observed over the change
//! feed.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use meeting_runner::errors::RunnerError;
use meeting_runner::model::{Phase, PriorityTier, TurnExtras};
use meeting_runner::sync::{ApplyOutcome, ChangePayload, StreamItem};
use runner_test_utils::{
    assert_no_p1_skipped, assert_overtime_consistent, assert_single_open_turn, drain,
    drain_into, participant_logs, MeetingHarness, TestMeeting,
};

async fn three_p1_one_p2() -> MeetingHarness {
    TestMeeting::new()
        .with_member(Some(PriorityTier::P1))
        .with_member(None)
        .with_member(Some(PriorityTier::P1))
        .with_member(Some(PriorityTier::P1))
        .spawn()
        .await
}

fn round_complete_signals(items: &[StreamItem], section: Phase) -> usize {
    items
        .iter()
        .filter(|item| {
            matches!(
                item,
                StreamItem::Event(event)
                    if event.payload == ChangePayload::RoundComplete { section }
            )
        })
        .count()
}

#[tokio::test]
async fn test_lightning_round_end_to_end() {
    let h = three_p1_one_p2().await;
    h.advance_to(Phase::LightningRound).await;

    let (mut view, mut stream) = h.observer(h.scribe).await;
    let queue = h.meeting().await.queue;
    assert_eq!(queue.len(), 4);

    // P1 members lead the lightning queue.
    let p2 = h.member(1);
    assert_eq!(queue.last(), Some(&p2));

    let mut signals = 0;
    for member in &queue {
        assert!(!view.round_complete(Phase::LightningRound));
        if *member == p2 {
            h.handle.skip_turn(h.ctx(), *member).await.unwrap();
        } else {
            h.handle.start_timer(h.ctx(), *member).await.unwrap();
            h.clock.advance(Duration::from_secs(75));
            let log = h
                .handle
                .complete_turn(h.ctx(), *member, TurnExtras::default(), Some(15))
                .await
                .unwrap();
            assert_eq!(log.duration_seconds, Some(75));
            assert_eq!(log.overtime_seconds, Some(15));
        }
        let items = drain_into(&mut stream, &mut view).await;
        signals += round_complete_signals(&items, Phase::LightningRound);
    }

    assert_eq!(signals, 1);
    assert!(view.round_complete(Phase::LightningRound));

    let snapshot = h.snapshot().await;
    let turns = participant_logs(&snapshot.turn_logs, Phase::LightningRound);
    assert_eq!(turns.iter().filter(|l| l.is_finalized() && !l.skipped).count(), 3);
    assert_eq!(turns.iter().filter(|l| l.skipped).count(), 1);
    assert_no_p1_skipped(&snapshot.turn_logs);
    assert_single_open_turn(&snapshot.turn_logs);
    assert_overtime_consistent(&snapshot.turn_logs);

    let view_turns = view
        .turn_logs()
        .into_iter()
        .filter(|l| l.section == Phase::LightningRound && !l.is_phase_level())
        .count();
    assert_eq!(view_turns, 4);
    assert_eq!(view.meeting(), Some(&snapshot.meeting));

    // The round is complete; nothing is left to log.
    let again = h.handle.skip_turn(h.ctx(), p2).await.unwrap_err();
    assert!(matches!(again, RunnerError::InvalidTransition(_)));
    assert_eq!(round_complete_signals(&drain(&mut stream).await, Phase::LightningRound), 0);
}

#[tokio::test]
async fn test_redelivered_events_leave_view_unchanged() {
    let h = three_p1_one_p2().await;
    h.advance_to(Phase::LightningRound).await;
    let (mut view, mut stream) = h.observer(h.scribe).await;

    for member in h.meeting().await.queue {
        if member == h.member(1) {
            h.handle.skip_turn(h.ctx(), member).await.unwrap();
        } else {
            h.take_turn(member).await;
        }
    }
    let items = drain_into(&mut stream, &mut view).await;
    assert!(!items.is_empty());

    let meeting = view.meeting().cloned();
    let logs: Vec<_> = view.turn_logs().into_iter().cloned().collect();

    for item in &items {
        assert_eq!(view.on_stream_item(item), ApplyOutcome::Ignored);
    }

    assert_eq!(view.meeting().cloned(), meeting);
    let replayed: Vec<_> = view.turn_logs().into_iter().cloned().collect();
    assert_eq!(replayed, logs);
    assert!(view.round_complete(Phase::LightningRound));
}

#[tokio::test]
async fn test_lightning_priority_sets_full_checkin_order() {
    let h = TestMeeting::new()
        .with_member(None)
        .with_member(None)
        .with_member(None)
        .spawn()
        .await;
    h.advance_to(Phase::LightningRound).await;
    let promoted = h.member(2);

    for member in h.meeting().await.queue {
        h.handle.start_timer(h.ctx(), member).await.unwrap();
        let extras = TurnExtras {
            priority: (member == promoted).then_some(PriorityTier::P1),
            ..TurnExtras::default()
        };
        h.handle
            .complete_turn(h.ctx(), member, extras, None)
            .await
            .unwrap();
    }

    h.advance_to(Phase::FullCheckins).await;
    let queue = h.meeting().await.queue;
    assert_eq!(queue.len(), 3);
    assert_eq!(queue.first(), Some(&promoted));

    // Once full check-ins begin the tier is frozen, so P1 cannot be skipped.
    let err = h.handle.skip_turn(h.ctx(), promoted).await.unwrap_err();
    assert!(matches!(err, RunnerError::InvalidTransition(_)));
    let err = h
        .handle
        .set_priority(h.ctx(), promoted, PriorityTier::P2)
        .await
        .unwrap_err();
    assert!(matches!(err, RunnerError::InvalidTransition(_)));
}
