//! Message types for actor communication.
//!
//! Every request carries a `tokio::sync::oneshot` sender for its reply.
//! Mutations also carry a [`MutationContext`] so the resulting change events
//! can be matched back to the caller's optimistic edit.

use super::meeting::MeetingRunnerHandle;
use crate::allocator::Allotment;
use crate::errors::RunnerError;
use crate::model::{
    Attendee, Feedback, Meeting, MeetingSnapshot, Phase, PriorityTier, RecordingMetadata,
    TurnExtras, TurnLog,
};
use crate::timer::{StoppedTurn, TimerReading};
use chrono::{DateTime, Utc};
use common::types::{MeetingId, MutationId, UserId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::oneshot;

/// Reply channel for a fallible request.
pub type Reply<T> = oneshot::Sender<Result<T, RunnerError>>;

/// Who is asking, and which client mutation this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationContext {
    pub caller: UserId,
    pub mutation_id: MutationId,
}

impl MutationContext {
    /// Context with a freshly generated mutation id.
    #[must_use]
    pub fn new(caller: UserId) -> Self {
        Self {
            caller,
            mutation_id: MutationId::new(),
        }
    }
}

/// Recording metadata as uploaded; the runner stamps `saved_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingUpload {
    pub storage_key: String,
    pub mime_type: String,
    pub duration_seconds: u32,
}

/// End-of-meeting roll-up handed to the reporting collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeetingSummary {
    pub meeting_id: MeetingId,
    pub phase: Phase,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attendees_checked_in: usize,
    pub turns_logged: usize,
    pub turns_skipped: usize,
    pub total_overtime_seconds: u64,
    pub support_requests: usize,
    pub p1_members: usize,
    pub feedback_count: usize,
    pub average_rating: Option<f64>,
    pub recording: Option<RecordingMetadata>,
}

impl MeetingSummary {
    #[must_use]
    pub fn from_snapshot(snapshot: &MeetingSnapshot) -> Self {
        let turns = snapshot
            .turn_logs
            .iter()
            .filter(|log| !log.is_phase_level() && log.is_finalized());

        let mut turns_logged = 0;
        let mut turns_skipped = 0;
        let mut total_overtime_seconds = 0u64;
        for log in turns {
            if log.skipped {
                turns_skipped += 1;
            } else {
                turns_logged += 1;
            }
            total_overtime_seconds += u64::from(log.overtime_seconds.unwrap_or(0));
        }

        let ratings: Vec<f64> = snapshot
            .feedback
            .iter()
            .map(|f| f64::from(f.rating))
            .collect();
        #[allow(clippy::cast_precision_loss)]
        let average_rating =
            (!ratings.is_empty()).then(|| ratings.iter().sum::<f64>() / ratings.len() as f64);

        Self {
            meeting_id: snapshot.meeting.id,
            phase: snapshot.meeting.phase,
            started_at: snapshot.meeting.started_at,
            completed_at: snapshot.meeting.completed_at,
            attendees_checked_in: snapshot
                .attendance
                .iter()
                .filter(|a| a.is_checked_in())
                .count(),
            turns_logged,
            turns_skipped,
            total_overtime_seconds,
            support_requests: snapshot
                .attendance
                .iter()
                .filter(|a| a.requested_support)
                .count(),
            p1_members: snapshot
                .attendance
                .iter()
                .filter(|a| a.effective_priority() == PriorityTier::P1)
                .count(),
            feedback_count: snapshot.feedback.len(),
            average_rating,
            recording: snapshot.meeting.recording.clone(),
        }
    }
}

/// Messages sent to `RunnerControllerActor`.
#[derive(Debug)]
pub enum ControllerMessage {
    /// Start a runner for the meeting, or return the running one.
    OpenMeeting {
        meeting_id: MeetingId,
        respond_to: Reply<MeetingRunnerHandle>,
    },

    GetMeeting {
        meeting_id: MeetingId,
        respond_to: Reply<MeetingRunnerHandle>,
    },

    /// Stop and forget a runner (meeting over, or moved elsewhere).
    RemoveMeeting {
        meeting_id: MeetingId,
        respond_to: Reply<()>,
    },

    GetStatus {
        respond_to: oneshot::Sender<ControllerStatus>,
    },

    /// Stop accepting meetings and cancel every runner.
    Shutdown {
        deadline: Duration,
        respond_to: Reply<()>,
    },
}

/// Controller status for health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStatus {
    pub meeting_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Messages sent to a `MeetingRunner`.
#[derive(Debug)]
pub enum MeetingMessage {
    StartTimer {
        ctx: MutationContext,
        participant_id: UserId,
        respond_to: Reply<TimerReading>,
    },

    StopTimer {
        ctx: MutationContext,
        respond_to: Reply<StoppedTurn>,
    },

    /// Finalize a member's turn, stopping it first if still running.
    CompleteTurn {
        ctx: MutationContext,
        participant_id: UserId,
        extras: TurnExtras,
        /// Overtime the client displayed; rejected if it disagrees.
        overtime_seconds: Option<u32>,
        respond_to: Reply<TurnLog>,
    },

    SkipTurn {
        ctx: MutationContext,
        participant_id: UserId,
        respond_to: Reply<TurnLog>,
    },

    AdvancePhase {
        ctx: MutationContext,
        expected: Phase,
        target: Phase,
        respond_to: Reply<Meeting>,
    },

    ChangeScribe {
        ctx: MutationContext,
        new_scribe: UserId,
        respond_to: Reply<Meeting>,
    },

    AddMeetingTime {
        ctx: MutationContext,
        minutes: u32,
        respond_to: Reply<Allotment>,
    },

    DitchCurriculum {
        ctx: MutationContext,
        respond_to: Reply<Allotment>,
    },

    CompleteMeeting {
        ctx: MutationContext,
        respond_to: Reply<MeetingSummary>,
    },

    SetPriority {
        ctx: MutationContext,
        participant_id: UserId,
        priority: PriorityTier,
        respond_to: Reply<Attendee>,
    },

    SetSupportFlag {
        ctx: MutationContext,
        participant_id: UserId,
        requested_support: bool,
        respond_to: Reply<Attendee>,
    },

    RecordFeedback {
        ctx: MutationContext,
        participant_id: UserId,
        rating: u8,
        comment: Option<String>,
        respond_to: Reply<Feedback>,
    },

    SaveRecording {
        ctx: MutationContext,
        recording: RecordingUpload,
        respond_to: Reply<RecordingMetadata>,
    },

    /// Full state for an observer resync.
    GetSnapshot {
        respond_to: Reply<MeetingSnapshot>,
    },

    GetAllotment {
        respond_to: Reply<Allotment>,
    },

    /// `None` when no turn is running.
    GetTimerStatus {
        respond_to: Reply<Option<TimerReading>>,
    },

    GetSummary {
        respond_to: Reply<MeetingSummary>,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{Attendee, Feedback, TurnLog};
    use chrono::TimeZone;
    use common::types::FeedbackId;

    #[test]
    fn test_summary_counts_turns_and_ratings() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 19, 0, 0).unwrap();
        let scribe = UserId::new();
        let meeting = Meeting::scheduled(MeetingId::new(), scribe, at, 120);
        let member = UserId::new();

        let mut logged =
            TurnLog::turn_started(meeting.id, Phase::LightningRound, member, at, 60, PriorityTier::P1);
        logged.end_time = Some(at);
        logged.overtime_seconds = Some(12);
        let mut skipped =
            TurnLog::turn_started(meeting.id, Phase::LightningRound, scribe, at, 60, PriorityTier::P2);
        skipped.end_time = Some(at);
        skipped.skipped = true;
        let phase_log = TurnLog::phase_opened(meeting.id, Phase::LightningRound, at);

        let feedback = |rating| Feedback {
            id: FeedbackId::new(),
            meeting_id: meeting.id,
            user_id: member,
            rating,
            comment: None,
            recorded_at: at,
        };

        let snapshot = MeetingSnapshot {
            meeting: meeting.clone(),
            attendance: vec![Attendee {
                user_id: member,
                display_name: "Sam".to_string(),
                checked_in_at: Some(at),
                priority: Some(PriorityTier::P1),
                requested_support: true,
            }],
            turn_logs: vec![phase_log, logged, skipped],
            stretch_goals: Vec::new(),
            feedback: vec![feedback(8), feedback(9)],
        };

        let summary = MeetingSummary::from_snapshot(&snapshot);
        assert_eq!(summary.turns_logged, 1);
        assert_eq!(summary.turns_skipped, 1);
        assert_eq!(summary.total_overtime_seconds, 12);
        assert_eq!(summary.support_requests, 1);
        assert_eq!(summary.p1_members, 1);
        assert_eq!(summary.average_rating, Some(8.5));
    }

    #[test]
    fn test_summary_without_feedback_has_no_rating() {
        let at = Utc.with_ymd_and_hms(2026, 3, 4, 19, 0, 0).unwrap();
        let meeting = Meeting::scheduled(MeetingId::new(), UserId::new(), at, 90);
        let snapshot = MeetingSnapshot {
            meeting,
            attendance: Vec::new(),
            turn_logs: Vec::new(),
            stretch_goals: Vec::new(),
            feedback: Vec::new(),
        };
        assert_eq!(MeetingSummary::from_snapshot(&snapshot).average_rating, None);
    }
}
