//! State verification helpers.

use std::collections::HashSet;
use std::time::Duration;

use meeting_runner::clock::elapsed_seconds;
use meeting_runner::model::{Phase, PriorityTier, TurnLog};
use meeting_runner::sync::{ChangeStream, ObserverView, StreamItem};

/// How long [`drain_into`] waits for the next event before giving up.
pub const DRAIN_IDLE: Duration = Duration::from_millis(100);

/// No P1 member was ever skipped.
pub fn assert_no_p1_skipped(logs: &[TurnLog]) {
    for log in logs {
        assert!(
            !(log.skipped && log.priority == Some(PriorityTier::P1)),
            "P1 turn {} was skipped",
            log.id
        );
    }
}

/// At most one unfinalized turn per (section, user).
pub fn assert_single_open_turn(logs: &[TurnLog]) {
    let mut open = HashSet::new();
    for log in logs.iter().filter(|l| !l.is_phase_level() && !l.is_finalized()) {
        assert!(
            open.insert((log.section, log.user_id)),
            "more than one open turn for {:?} in {}",
            log.user_id,
            log.section.as_str()
        );
    }
}

/// Every measured turn has `overtime == max(0, duration - allotted)`, and
/// its duration matches its timestamps.
pub fn assert_overtime_consistent(logs: &[TurnLog]) {
    for log in logs.iter().filter(|l| l.is_finalized() && !l.skipped) {
        let (Some(duration), Some(allotted), Some(overtime)) = (
            log.duration_seconds,
            log.allotted_seconds,
            log.overtime_seconds,
        ) else {
            continue;
        };
        assert_eq!(
            overtime,
            duration.saturating_sub(allotted),
            "turn {} overtime does not match its duration",
            log.id
        );
        let measured_until = log.stopped_at.or(log.end_time).expect("finalized");
        assert_eq!(
            duration,
            elapsed_seconds(log.start_time, measured_until),
            "turn {} duration does not match its timestamps",
            log.id
        );
    }
}

/// Turn logs for `section` that belong to a participant.
#[must_use]
pub fn participant_logs(logs: &[TurnLog], section: Phase) -> Vec<&TurnLog> {
    logs.iter()
        .filter(|l| l.section == section && !l.is_phase_level())
        .collect()
}

/// Pull every event already queued on `stream`, stopping after
/// [`DRAIN_IDLE`] of silence or when the stream ends.
pub async fn drain(stream: &mut ChangeStream) -> Vec<StreamItem> {
    let mut items = Vec::new();
    while let Ok(Some(item)) = tokio::time::timeout(DRAIN_IDLE, stream.next()).await {
        items.push(item);
    }
    items
}

/// Drain `stream` into `view`. Returns the drained items.
pub async fn drain_into(stream: &mut ChangeStream, view: &mut ObserverView) -> Vec<StreamItem> {
    let items = drain(stream).await;
    for item in &items {
        view.on_stream_item(item);
    }
    items
}
