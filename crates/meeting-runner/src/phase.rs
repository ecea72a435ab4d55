//! Phase state machine.
//!
//! Validates `advance(expected, target)` requests and computes the
//! phase-level bookkeeping a legal transition produces. Queue building is
//! left to the caller since it needs attendance.

use crate::authority;
use crate::errors::{RunnerError, StaleReason};
use crate::model::{Meeting, Phase, TurnLog};
use chrono::{DateTime, Utc};
use common::types::UserId;

/// The single legal successor of `current`, if any.
///
/// With the curriculum ditched, `full_checkins` goes straight to `closing`.
#[must_use]
pub fn next_phase(current: Phase, curriculum_ditched: bool) -> Option<Phase> {
    match current {
        Phase::NotStarted => Some(Phase::OpeningMeditation),
        Phase::OpeningMeditation => Some(Phase::OpeningEthos),
        Phase::OpeningEthos => Some(Phase::LightningRound),
        Phase::LightningRound => Some(Phase::FullCheckins),
        Phase::FullCheckins if curriculum_ditched => Some(Phase::Closing),
        Phase::FullCheckins => Some(Phase::Curriculum),
        Phase::Curriculum => Some(Phase::Closing),
        Phase::Closing => Some(Phase::Ended),
        Phase::Ended => None,
    }
}

/// Check an advance request against the authoritative meeting.
///
/// Rules are applied in order: authority, direction, staleness, adjacency,
/// then the running timer.
///
/// # Errors
///
/// `NotAuthorized`, `InvalidTransition`, or `StaleState` per the first rule
/// that fails.
pub fn validate_advance(
    meeting: &Meeting,
    caller: UserId,
    expected: Phase,
    target: Phase,
) -> Result<(), RunnerError> {
    authority::authorize(meeting, caller)?;

    let current = meeting.phase;
    if target <= current {
        return Err(RunnerError::InvalidTransition(format!(
            "cannot move from {current} to {target}"
        )));
    }

    if expected != current {
        return Err(StaleReason::PhaseMismatch {
            expected,
            actual: current,
        }
        .into());
    }

    if next_phase(current, meeting.curriculum_ditched) != Some(target) {
        return Err(RunnerError::InvalidTransition(format!(
            "{target} does not follow {current}"
        )));
    }

    if meeting.active_timer.is_some() {
        return Err(RunnerError::InvalidTransition(
            "stop the running turn before advancing".to_string(),
        ));
    }

    Ok(())
}

/// Records produced by a validated transition.
#[derive(Debug, Clone)]
pub struct PhaseTransition {
    /// Meeting with the new phase applied and the queue cleared.
    pub meeting: Meeting,
    /// Outgoing phase-level log, now finalized.
    pub closed: Option<TurnLog>,
    /// Incoming phase-level log. `None` when entering `ended`.
    pub opened: Option<TurnLog>,
}

/// Apply an already validated transition to `meeting`.
#[must_use]
pub fn transition(
    meeting: &Meeting,
    turn_logs: &[TurnLog],
    target: Phase,
    now: DateTime<Utc>,
) -> PhaseTransition {
    let mut next = meeting.clone();
    next.phase = target;
    next.queue.clear();

    if meeting.phase == Phase::NotStarted && next.started_at.is_none() {
        next.started_at = Some(now);
    }
    if target == Phase::Ended {
        next.completed_at = Some(now);
    }

    let closed = turn_logs
        .iter()
        .find(|log| log.is_phase_level() && log.section == meeting.phase && !log.is_finalized())
        .map(|log| {
            let mut log = log.clone();
            log.end_time = Some(now);
            log.duration_seconds = Some(crate::clock::elapsed_seconds(log.start_time, now));
            log
        });

    let opened = (target != Phase::Ended).then(|| TurnLog::phase_opened(meeting.id, target, now));

    PhaseTransition {
        meeting: next,
        closed,
        opened,
    }
}
