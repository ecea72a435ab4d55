//! Turn queue ordering and per-person time budgeting.
//!
//! The budget formula is a pure function of the meeting end time, the
//! trusted "now", the reserved curriculum seconds, and the remaining head
//! count. It is recomputed on every read, so extending the meeting or
//! ditching the curriculum is reflected for every turn that has not started.
//! A running turn keeps the allotment captured on its [`ActiveTimer`].
//!
//! [`ActiveTimer`]: crate::model::ActiveTimer

use crate::model::{Attendee, Meeting, Phase, TurnLog};
use chrono::{DateTime, Utc};
use common::types::UserId;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Budgeting constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationPolicy {
    /// Fixed lightning-round turn length.
    pub lightning_seconds: u32,
    /// Time held back for the curriculum unless ditched.
    pub curriculum_reserve_seconds: u32,
    /// Floor for a full check-in turn.
    pub min_turn_seconds: u32,
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            lightning_seconds: 60,
            curriculum_reserve_seconds: 1800,
            min_turn_seconds: 60,
        }
    }
}

impl AllocationPolicy {
    /// Reserved seconds given the ditch flag.
    #[must_use]
    pub fn reserved_seconds(&self, curriculum_ditched: bool) -> u32 {
        if curriculum_ditched {
            0
        } else {
            self.curriculum_reserve_seconds
        }
    }
}

/// `max(0, end - now) - reserved`. May be negative.
#[must_use]
pub fn available_seconds(end_time: DateTime<Utc>, now: DateTime<Utc>, reserved_seconds: u32) -> i64 {
    (end_time - now).num_seconds().max(0) - i64::from(reserved_seconds)
}

/// Per-person budget for not-yet-started full check-in turns.
///
/// Zero when nobody remains; otherwise `floor(available / remaining)`
/// clamped up to `min_turn_seconds`.
#[must_use]
pub fn per_person_seconds(
    end_time: DateTime<Utc>,
    now: DateTime<Utc>,
    reserved_seconds: u32,
    remaining: usize,
    min_turn_seconds: u32,
) -> u32 {
    let Ok(remaining) = i64::try_from(remaining) else {
        return min_turn_seconds;
    };
    if remaining == 0 {
        return 0;
    }
    let share = available_seconds(end_time, now, reserved_seconds) / remaining;
    let share = share.max(i64::from(min_turn_seconds));
    u32::try_from(share).unwrap_or(u32::MAX)
}

/// Where a queue member's turn stands in a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    Running,
    Stopped,
    Logged,
    Skipped,
}

impl TurnState {
    /// Logged or skipped.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self, TurnState::Logged | TurnState::Skipped)
    }
}

/// Turn log for `user` in `section`, preferring the finalized one.
#[must_use]
pub fn turn_log_for<'a>(logs: &'a [TurnLog], section: Phase, user: UserId) -> Option<&'a TurnLog> {
    let mut matching = logs
        .iter()
        .filter(|log| log.section == section && log.user_id == Some(user));
    let first = matching.next()?;
    if first.is_finalized() {
        return Some(first);
    }
    Some(matching.find(|log| log.is_finalized()).unwrap_or(first))
}

/// Derive a member's turn state from the logs.
#[must_use]
pub fn turn_state(logs: &[TurnLog], section: Phase, user: UserId) -> TurnState {
    match turn_log_for(logs, section, user) {
        None => TurnState::Idle,
        Some(log) if log.is_finalized() && log.skipped => TurnState::Skipped,
        Some(log) if log.is_finalized() => TurnState::Logged,
        Some(log) if log.stopped_at.is_some() => TurnState::Stopped,
        Some(_) => TurnState::Running,
    }
}

/// Queue members neither logged nor skipped.
#[must_use]
pub fn remaining_count(queue: &[UserId], logs: &[TurnLog], section: Phase) -> usize {
    queue
        .iter()
        .filter(|user| !turn_state(logs, section, **user).is_done())
        .count()
}

/// Every queue member is accounted for.
#[must_use]
pub fn round_complete(queue: &[UserId], logs: &[TurnLog], section: Phase) -> bool {
    !queue.is_empty() && remaining_count(queue, logs, section) == 0
}

fn checked_in(attendees: &[Attendee]) -> impl Iterator<Item = &Attendee> {
    attendees.iter().filter(|a| a.is_checked_in())
}

/// Lightning-round order: checked-in attendees shuffled, then stably grouped
/// by tier.
pub fn lightning_queue<R: Rng + ?Sized>(attendees: &[Attendee], rng: &mut R) -> Vec<UserId> {
    let mut members: Vec<&Attendee> = checked_in(attendees).collect();
    members.shuffle(rng);
    members.sort_by_key(|a| a.effective_priority());
    members.into_iter().map(|a| a.user_id).collect()
}

/// Full check-in order: P1 before P2, keeping lightning-round order within a
/// tier. Members who missed the lightning round go last in their tier.
#[must_use]
pub fn full_checkin_queue(lightning_order: &[UserId], attendees: &[Attendee]) -> Vec<UserId> {
    let mut members: Vec<(usize, &Attendee)> = checked_in(attendees)
        .map(|a| {
            let rank = lightning_order
                .iter()
                .position(|id| *id == a.user_id)
                .unwrap_or(usize::MAX);
            (rank, a)
        })
        .collect();
    members.sort_by_key(|(rank, _)| *rank);
    members.sort_by_key(|(_, a)| a.effective_priority());
    members.into_iter().map(|(_, a)| a.user_id).collect()
}

/// Ways out of an exhausted budget. Neither is applied automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    ExtendMeeting,
    DitchCurriculum,
}

/// Budget as seen at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allotment {
    pub section: Phase,
    pub available_seconds: i64,
    pub remaining: usize,
    pub per_person_seconds: u32,
    pub exhausted: bool,
    pub recovery_actions: Vec<RecoveryAction>,
}

/// Recovery actions currently on offer for `meeting`.
#[must_use]
pub fn recovery_actions(meeting: &Meeting) -> Vec<RecoveryAction> {
    let mut actions = vec![RecoveryAction::ExtendMeeting];
    if !meeting.curriculum_ditched && meeting.phase < Phase::Curriculum {
        actions.push(RecoveryAction::DitchCurriculum);
    }
    actions
}

/// Compute the allotment for the meeting's current phase.
#[must_use]
pub fn allotment(
    meeting: &Meeting,
    logs: &[TurnLog],
    now: DateTime<Utc>,
    policy: &AllocationPolicy,
) -> Allotment {
    let section = meeting.phase;
    let reserved = policy.reserved_seconds(meeting.curriculum_ditched);
    let available = available_seconds(meeting.end_time(), now, reserved);
    let remaining = if section.has_turns() {
        remaining_count(&meeting.queue, logs, section)
    } else {
        0
    };

    let per_person = match section {
        Phase::LightningRound if remaining > 0 => policy.lightning_seconds,
        Phase::FullCheckins => per_person_seconds(
            meeting.end_time(),
            now,
            reserved,
            remaining,
            policy.min_turn_seconds,
        ),
        _ => 0,
    };

    let exhausted = section == Phase::FullCheckins && available <= 0 && remaining > 0;
    let recovery_actions = if exhausted {
        recovery_actions(meeting)
    } else {
        Vec::new()
    };

    Allotment {
        section,
        available_seconds: available,
        remaining,
        per_person_seconds: per_person,
        exhausted,
        recovery_actions,
    }
}
