//! Meeting aggregate and the records hanging off it.
//!
//! These are the authoritative shapes written to the store and replicated to
//! observers in change events, so every type here is `Serialize` +
//! `Deserialize` and compares by value.

use chrono::{DateTime, Duration, Utc};
use common::types::{FeedbackId, MeetingId, StretchGoalId, TurnLogId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Meeting phases in their only legal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    NotStarted,
    OpeningMeditation,
    OpeningEthos,
    LightningRound,
    FullCheckins,
    Curriculum,
    Closing,
    Ended,
}

impl Phase {
    /// Every phase, in order.
    pub const ALL: [Phase; 8] = [
        Phase::NotStarted,
        Phase::OpeningMeditation,
        Phase::OpeningEthos,
        Phase::LightningRound,
        Phase::FullCheckins,
        Phase::Curriculum,
        Phase::Closing,
        Phase::Ended,
    ];

    /// Stable name used in logs, metrics, and store keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Phase::NotStarted => "not_started",
            Phase::OpeningMeditation => "opening_meditation",
            Phase::OpeningEthos => "opening_ethos",
            Phase::LightningRound => "lightning_round",
            Phase::FullCheckins => "full_checkins",
            Phase::Curriculum => "curriculum",
            Phase::Closing => "closing",
            Phase::Ended => "ended",
        }
    }

    /// Whether this phase allocates per-person speaking turns.
    #[must_use]
    pub const fn has_turns(&self) -> bool {
        matches!(self, Phase::LightningRound | Phase::FullCheckins)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Urgency tier assigned during the lightning round.
///
/// P1 sorts before P2. P1 members can never be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PriorityTier {
    #[serde(rename = "1")]
    P1,
    #[serde(rename = "2")]
    P2,
}

impl PriorityTier {
    /// Tier used when none was assigned.
    pub const DEFAULT: PriorityTier = PriorityTier::P2;

    /// Resolve an optional tier to the tier that governs ordering and skips.
    #[must_use]
    pub fn effective(tier: Option<PriorityTier>) -> PriorityTier {
        tier.unwrap_or(Self::DEFAULT)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            PriorityTier::P1 => "p1",
            PriorityTier::P2 => "p2",
        }
    }
}

/// The single running turn on a meeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTimer {
    pub participant_id: UserId,
    pub section: Phase,
    pub started_at: DateTime<Utc>,
    /// Allotment shown when the turn started; later budget changes do not
    /// touch it.
    pub allotted_seconds: u32,
    pub turn_log_id: TurnLogId,
}

/// Metadata for a meeting recording. The audio itself lives elsewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingMetadata {
    pub storage_key: String,
    pub mime_type: String,
    pub duration_seconds: u32,
    pub saved_at: DateTime<Utc>,
}

/// The meeting aggregate root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meeting {
    pub id: MeetingId,
    pub phase: Phase,
    /// Single-writer capability: only this user may mutate the meeting.
    pub scribe_id: UserId,
    pub active_timer: Option<ActiveTimer>,
    pub scheduled_start: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_minutes: u32,
    pub curriculum_ditched: bool,
    /// Turn order for the current phase; empty outside turn phases.
    pub queue: Vec<UserId>,
    /// Sections whose round-complete signal has already fired.
    pub completed_sections: Vec<Phase>,
    pub recording: Option<RecordingMetadata>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Bumped on every committed write.
    pub version: u64,
}

impl Meeting {
    /// A freshly scheduled meeting.
    #[must_use]
    pub fn scheduled(
        id: MeetingId,
        scribe_id: UserId,
        scheduled_start: DateTime<Utc>,
        duration_minutes: u32,
    ) -> Self {
        Self {
            id,
            phase: Phase::NotStarted,
            scribe_id,
            active_timer: None,
            scheduled_start,
            started_at: None,
            duration_minutes,
            curriculum_ditched: false,
            queue: Vec::new(),
            completed_sections: Vec::new(),
            recording: None,
            completed_at: None,
            version: 0,
        }
    }

    /// Hard deadline for the whole session.
    #[must_use]
    pub fn end_time(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.scheduled_start)
            + Duration::minutes(i64::from(self.duration_minutes))
    }

    /// Whether the round-complete signal already fired for `section`.
    #[must_use]
    pub fn section_completed(&self, section: Phase) -> bool {
        self.completed_sections.contains(&section)
    }
}

/// A checked-in (or expected) participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attendee {
    pub user_id: UserId,
    pub display_name: String,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub priority: Option<PriorityTier>,
    #[serde(default)]
    pub requested_support: bool,
}

impl Attendee {
    #[must_use]
    pub fn is_checked_in(&self) -> bool {
        self.checked_in_at.is_some()
    }

    #[must_use]
    pub fn effective_priority(&self) -> PriorityTier {
        PriorityTier::effective(self.priority)
    }
}

/// What happened to a member's stretch goal during their full check-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StretchGoalAction {
    /// Goal carried forward unchanged.
    Kept,
    /// Current goal completed; no replacement.
    Completed,
    /// Current goal retired and a new one set.
    Replaced { description: String },
    /// First goal for a member who had none.
    Created { description: String },
}

/// Append-only record of a phase or a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnLog {
    pub id: TurnLogId,
    pub meeting_id: MeetingId,
    pub section: Phase,
    /// `None` for phase-level logs.
    pub user_id: Option<UserId>,
    pub start_time: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub allotted_seconds: Option<u32>,
    pub duration_seconds: Option<u32>,
    pub overtime_seconds: Option<u32>,
    pub skipped: bool,
    pub priority: Option<PriorityTier>,
    pub stretch_goal_action: Option<StretchGoalAction>,
    pub requested_support: bool,
}

impl TurnLog {
    /// Opens a phase-level log.
    #[must_use]
    pub fn phase_opened(meeting_id: MeetingId, section: Phase, at: DateTime<Utc>) -> Self {
        Self {
            id: TurnLogId::new(),
            meeting_id,
            section,
            user_id: None,
            start_time: at,
            stopped_at: None,
            end_time: None,
            allotted_seconds: None,
            duration_seconds: None,
            overtime_seconds: None,
            skipped: false,
            priority: None,
            stretch_goal_action: None,
            requested_support: false,
        }
    }

    /// Opens a participant turn log.
    #[must_use]
    pub fn turn_started(
        meeting_id: MeetingId,
        section: Phase,
        user_id: UserId,
        at: DateTime<Utc>,
        allotted_seconds: u32,
        priority: PriorityTier,
    ) -> Self {
        Self {
            user_id: Some(user_id),
            allotted_seconds: Some(allotted_seconds),
            priority: Some(priority),
            ..Self::phase_opened(meeting_id, section, at)
        }
    }

    /// Finalized logs are immutable.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.end_time.is_some()
    }

    #[must_use]
    pub fn is_phase_level(&self) -> bool {
        self.user_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StretchGoalStatus {
    Active,
    Completed,
    Replaced,
}

/// A member's standing personal commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StretchGoal {
    pub id: StretchGoalId,
    pub owner_id: UserId,
    pub description: String,
    pub status: StretchGoalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Closing-round feedback recorded by the scribe on a member's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: FeedbackId,
    pub meeting_id: MeetingId,
    pub user_id: UserId,
    /// 1 to 10.
    pub rating: u8,
    pub comment: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Optional details captured when a turn is completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnExtras {
    /// Full check-ins only.
    pub stretch_goal_action: Option<StretchGoalAction>,
    /// Overrides the attendee's standing support flag for this turn.
    pub requested_support: Option<bool>,
    /// Lightning round only: assigns the member's tier.
    pub priority: Option<PriorityTier>,
}

/// Everything an observer needs to rebuild its view from scratch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingSnapshot {
    pub meeting: Meeting,
    pub attendance: Vec<Attendee>,
    pub turn_logs: Vec<TurnLog>,
    pub stretch_goals: Vec<StretchGoal>,
    pub feedback: Vec<Feedback>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_phase_order_is_declaration_order() {
        let mut sorted = Phase::ALL;
        sorted.sort();
        assert_eq!(sorted, Phase::ALL);
        assert!(Phase::LightningRound < Phase::FullCheckins);
    }

    #[test]
    fn test_phase_serializes_snake_case() {
        let json = serde_json::to_string(&Phase::FullCheckins).unwrap();
        assert_eq!(json, "\"full_checkins\"");
    }

    #[test]
    fn test_priority_default_is_p2() {
        assert_eq!(PriorityTier::effective(None), PriorityTier::P2);
        assert!(PriorityTier::P1 < PriorityTier::P2);
    }

    #[test]
    fn test_end_time_uses_actual_start_once_started() {
        let scheduled = Utc.with_ymd_and_hms(2026, 3, 4, 19, 0, 0).unwrap();
        let mut meeting = Meeting::scheduled(MeetingId::new(), UserId::new(), scheduled, 90);
        assert_eq!(meeting.end_time(), scheduled + Duration::minutes(90));

        meeting.started_at = Some(scheduled + Duration::minutes(7));
        assert_eq!(meeting.end_time(), scheduled + Duration::minutes(97));
    }

    #[test]
    fn test_stretch_goal_action_tagged_encoding() {
        let action = StretchGoalAction::Replaced {
            description: "Run a half marathon".to_string(),
        };
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"action\":\"replaced\""));
    }
}
