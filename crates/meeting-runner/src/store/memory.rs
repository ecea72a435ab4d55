//! In-process meeting store.

use super::{upsert, CommitBatch, MeetingStore, StoreError};
use crate::model::{Attendee, Feedback, Meeting, StretchGoal, TurnLog};
use async_trait::async_trait;
use common::types::{MeetingId, StretchGoalId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct MeetingRecord {
    meeting: Meeting,
    attendance: Vec<Attendee>,
    turn_logs: Vec<TurnLog>,
    feedback: Vec<Feedback>,
}

#[derive(Debug, Default)]
struct Inner {
    meetings: HashMap<MeetingId, MeetingRecord>,
    stretch_goals: HashMap<StretchGoalId, StretchGoal>,
}

/// Store backed by process memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a stretch goal outside any meeting write.
    pub async fn seed_stretch_goal(&self, goal: StretchGoal) {
        self.inner.write().await.stretch_goals.insert(goal.id, goal);
    }

    /// Check an attendee in (or update them) outside the version sequence,
    /// the way an external RSVP workflow would.
    ///
    /// # Errors
    ///
    /// `MeetingNotFound` if the meeting was never created.
    pub async fn upsert_attendee(
        &self,
        meeting_id: MeetingId,
        attendee: Attendee,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .meetings
            .get_mut(&meeting_id)
            .ok_or(StoreError::MeetingNotFound(meeting_id))?;
        upsert(&mut record.attendance, attendee, |a| a.user_id);
        Ok(())
    }

    /// Number of meetings held.
    pub async fn len(&self) -> usize {
        self.inner.read().await.meetings.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl MeetingStore for InMemoryStore {
    async fn create_meeting(
        &self,
        meeting: Meeting,
        attendance: Vec<Attendee>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.meetings.contains_key(&meeting.id) {
            return Err(StoreError::MeetingExists(meeting.id));
        }
        let mut meeting = meeting;
        meeting.version = 0;
        inner.meetings.insert(
            meeting.id,
            MeetingRecord {
                meeting,
                attendance,
                turn_logs: Vec::new(),
                feedback: Vec::new(),
            },
        );
        Ok(())
    }

    async fn read_meeting(&self, id: MeetingId) -> Result<Meeting, StoreError> {
        let inner = self.inner.read().await;
        inner
            .meetings
            .get(&id)
            .map(|r| r.meeting.clone())
            .ok_or(StoreError::MeetingNotFound(id))
    }

    async fn list_attendance(&self, id: MeetingId) -> Result<Vec<Attendee>, StoreError> {
        let inner = self.inner.read().await;
        inner
            .meetings
            .get(&id)
            .map(|r| r.attendance.clone())
            .ok_or(StoreError::MeetingNotFound(id))
    }

    async fn list_turn_logs(&self, id: MeetingId) -> Result<Vec<TurnLog>, StoreError> {
        let inner = self.inner.read().await;
        inner
            .meetings
            .get(&id)
            .map(|r| r.turn_logs.clone())
            .ok_or(StoreError::MeetingNotFound(id))
    }

    async fn list_stretch_goals(&self, id: MeetingId) -> Result<Vec<StretchGoal>, StoreError> {
        let inner = self.inner.read().await;
        let record = inner
            .meetings
            .get(&id)
            .ok_or(StoreError::MeetingNotFound(id))?;
        let mut goals: Vec<StretchGoal> = inner
            .stretch_goals
            .values()
            .filter(|g| record.attendance.iter().any(|a| a.user_id == g.owner_id))
            .cloned()
            .collect();
        goals.sort_by_key(|g| (g.created_at, g.id));
        Ok(goals)
    }

    async fn list_feedback(&self, id: MeetingId) -> Result<Vec<Feedback>, StoreError> {
        let inner = self.inner.read().await;
        inner
            .meetings
            .get(&id)
            .map(|r| r.feedback.clone())
            .ok_or(StoreError::MeetingNotFound(id))
    }

    async fn commit(&self, batch: CommitBatch) -> Result<u64, StoreError> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let meeting_id = batch.meeting_id();
        let record = inner
            .meetings
            .get_mut(&meeting_id)
            .ok_or(StoreError::MeetingNotFound(meeting_id))?;

        if record.meeting.version != batch.expected_version {
            return Err(StoreError::VersionConflict {
                expected: batch.expected_version,
                actual: record.meeting.version,
            });
        }
        if let Some(log) = batch.turn_logs.iter().find(|log| {
            record
                .turn_logs
                .iter()
                .any(|existing| existing.id == log.id && existing.is_finalized())
        }) {
            return Err(StoreError::FinalizedLog(log.id));
        }

        let version = batch.expected_version + 1;
        let mut meeting = batch.meeting;
        meeting.version = version;
        record.meeting = meeting;
        for log in batch.turn_logs {
            upsert(&mut record.turn_logs, log, |l| l.id);
        }
        for attendee in batch.attendance {
            upsert(&mut record.attendance, attendee, |a| a.user_id);
        }
        for entry in batch.feedback {
            upsert(&mut record.feedback, entry, |f| f.id);
        }
        for goal in batch.stretch_goals {
            inner.stretch_goals.insert(goal.id, goal);
        }

        Ok(version)
    }
}
