//! Change events emitted after each committed write.

use crate::model::{Attendee, Feedback, Meeting, Phase, StretchGoal, TurnLog};
use common::types::{MeetingId, MutationId};
use serde::{Deserialize, Serialize};

/// Aggregates a subscriber can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateKind {
    Meeting,
    Attendance,
    TurnLogs,
    StretchGoals,
    Feedback,
}

impl AggregateKind {
    pub const ALL: [AggregateKind; 5] = [
        AggregateKind::Meeting,
        AggregateKind::Attendance,
        AggregateKind::TurnLogs,
        AggregateKind::StretchGoals,
        AggregateKind::Feedback,
    ];
}

/// What changed. Collections carry only the records touched by the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ChangePayload {
    Meeting(Meeting),
    Attendance(Vec<Attendee>),
    TurnLogs(Vec<TurnLog>),
    StretchGoals(Vec<StretchGoal>),
    Feedback(Vec<Feedback>),
    /// Every queue member of `section` is logged or skipped. Sent once.
    RoundComplete { section: Phase },
}

impl ChangePayload {
    /// Aggregate this payload belongs to. Signals have none and reach every
    /// subscriber.
    #[must_use]
    pub fn aggregate(&self) -> Option<AggregateKind> {
        match self {
            ChangePayload::Meeting(_) => Some(AggregateKind::Meeting),
            ChangePayload::Attendance(_) => Some(AggregateKind::Attendance),
            ChangePayload::TurnLogs(_) => Some(AggregateKind::TurnLogs),
            ChangePayload::StretchGoals(_) => Some(AggregateKind::StretchGoals),
            ChangePayload::Feedback(_) => Some(AggregateKind::Feedback),
            ChangePayload::RoundComplete { .. } => None,
        }
    }
}

/// One authoritative change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub meeting_id: MeetingId,
    /// Meeting version after the write that produced this event.
    pub version: u64,
    /// Mutation that caused the write.
    pub mutation_id: MutationId,
    pub payload: ChangePayload,
}

impl ChangeEvent {
    /// Whether a subscriber filtering on `kinds` should see this event.
    #[must_use]
    pub fn matches(&self, kinds: &[AggregateKind]) -> bool {
        self.payload
            .aggregate()
            .map_or(true, |kind| kinds.contains(&kind))
    }
}
