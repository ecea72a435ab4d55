//! Persistence collaborator.
//!
//! [`MeetingStore`] is the narrow interface the runner needs from whatever
//! holds meeting records. Every write goes through [`MeetingStore::commit`],
//! an atomic multi-record batch guarded by the meeting version; the
//! single-record helpers are defined on top of it.
//!
//! # Adapters
//!
//! - [`memory::InMemoryStore`] - single process, tests and local dev
//! - [`redis::RedisMeetingStore`] - Lua-scripted version-checked commits

pub mod lua_scripts;
pub mod memory;
pub mod redis;

use crate::errors::{NotFoundKind, RunnerError, StaleReason};
use crate::model::{
    ActiveTimer, Attendee, Feedback, Meeting, MeetingSnapshot, Phase, PriorityTier,
    RecordingMetadata, StretchGoal, TurnLog,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{MeetingId, TurnLogId, UserId};
use thiserror::Error;

/// Store failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("meeting {0} not found")]
    MeetingNotFound(MeetingId),

    #[error("meeting {0} already exists")]
    MeetingExists(MeetingId),

    /// Compare-and-set lost: someone else wrote first.
    #[error("version conflict: expected {expected}, store has {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    #[error("turn log {0} is already finalized")]
    FinalizedLog(TurnLogId),

    #[error("no matching turn log")]
    TurnLogNotFound,

    #[error("backend error: {0}")]
    Backend(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<StoreError> for RunnerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MeetingNotFound(_) => RunnerError::NotFound(NotFoundKind::Meeting),
            StoreError::TurnLogNotFound => RunnerError::NotFound(NotFoundKind::Turn),
            StoreError::VersionConflict { expected, actual } => {
                RunnerError::StaleState(StaleReason::VersionMismatch { expected, actual })
            }
            StoreError::FinalizedLog(id) => {
                RunnerError::InvalidTransition(format!("turn {id} is already logged"))
            }
            StoreError::MeetingExists(_) | StoreError::Backend(_) | StoreError::Codec(_) => {
                RunnerError::Persistence(err.to_string())
            }
        }
    }
}

/// One atomic write.
///
/// The meeting record is always written; its `version` is set by the store
/// to `expected_version + 1`. Other collections are upserted by id.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub expected_version: u64,
    pub meeting: Meeting,
    pub turn_logs: Vec<TurnLog>,
    pub attendance: Vec<Attendee>,
    pub stretch_goals: Vec<StretchGoal>,
    pub feedback: Vec<Feedback>,
}

impl CommitBatch {
    /// Batch writing `meeting` guarded by its current version.
    #[must_use]
    pub fn for_meeting(meeting: Meeting) -> Self {
        Self {
            expected_version: meeting.version,
            meeting,
            turn_logs: Vec::new(),
            attendance: Vec::new(),
            stretch_goals: Vec::new(),
            feedback: Vec::new(),
        }
    }

    #[must_use]
    pub fn meeting_id(&self) -> MeetingId {
        self.meeting.id
    }

    /// Upsert a turn log, replacing an earlier copy in this batch.
    pub fn put_turn_log(&mut self, log: TurnLog) {
        self.turn_logs.retain(|l| l.id != log.id);
        self.turn_logs.push(log);
    }

    pub fn put_attendee(&mut self, attendee: Attendee) {
        self.attendance.retain(|a| a.user_id != attendee.user_id);
        self.attendance.push(attendee);
    }

    pub fn put_stretch_goal(&mut self, goal: StretchGoal) {
        self.stretch_goals.retain(|g| g.id != goal.id);
        self.stretch_goals.push(goal);
    }

    pub fn put_feedback(&mut self, entry: Feedback) {
        self.feedback.retain(|f| f.id != entry.id);
        self.feedback.push(entry);
    }
}

/// Partial update to the meeting record.
#[derive(Debug, Clone, Default)]
pub struct MeetingPatch {
    pub phase: Option<Phase>,
    pub scribe_id: Option<UserId>,
    pub active_timer: Option<Option<ActiveTimer>>,
    pub duration_minutes: Option<u32>,
    pub curriculum_ditched: Option<bool>,
    pub recording: Option<RecordingMetadata>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MeetingPatch {
    /// Apply set fields onto `meeting`.
    pub fn apply(self, meeting: &mut Meeting) {
        if let Some(phase) = self.phase {
            meeting.phase = phase;
        }
        if let Some(scribe_id) = self.scribe_id {
            meeting.scribe_id = scribe_id;
        }
        if let Some(timer) = self.active_timer {
            meeting.active_timer = timer;
        }
        if let Some(minutes) = self.duration_minutes {
            meeting.duration_minutes = minutes;
        }
        if let Some(ditched) = self.curriculum_ditched {
            meeting.curriculum_ditched = ditched;
        }
        if let Some(recording) = self.recording {
            meeting.recording = Some(recording);
        }
        if let Some(at) = self.completed_at {
            meeting.completed_at = Some(at);
        }
    }
}

/// Selects turn logs within one meeting.
#[derive(Debug, Clone, Default)]
pub struct TurnLogFilter {
    pub id: Option<TurnLogId>,
    pub section: Option<Phase>,
    pub user_id: Option<UserId>,
    /// Only logs without an end time.
    pub open_only: bool,
}

impl TurnLogFilter {
    #[must_use]
    pub fn matches(&self, log: &TurnLog) -> bool {
        self.id.map_or(true, |id| log.id == id)
            && self.section.map_or(true, |s| log.section == s)
            && self.user_id.map_or(true, |u| log.user_id == Some(u))
            && (!self.open_only || !log.is_finalized())
    }
}

/// Partial update to open turn logs.
#[derive(Debug, Clone, Default)]
pub struct TurnLogPatch {
    pub stopped_at: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u32>,
    pub overtime_seconds: Option<u32>,
    pub skipped: Option<bool>,
    pub priority: Option<PriorityTier>,
    pub requested_support: Option<bool>,
}

impl TurnLogPatch {
    pub fn apply(&self, log: &mut TurnLog) {
        if let Some(at) = self.stopped_at {
            log.stopped_at = Some(at);
        }
        if let Some(at) = self.end_time {
            log.end_time = Some(at);
        }
        if let Some(secs) = self.duration_seconds {
            log.duration_seconds = Some(secs);
        }
        if let Some(secs) = self.overtime_seconds {
            log.overtime_seconds = Some(secs);
        }
        if let Some(skipped) = self.skipped {
            log.skipped = skipped;
        }
        if let Some(priority) = self.priority {
            log.priority = Some(priority);
        }
        if let Some(flag) = self.requested_support {
            log.requested_support = flag;
        }
    }
}

/// Replace the row with the same key, or append.
pub(crate) fn upsert<T, K: PartialEq>(rows: &mut Vec<T>, row: T, key: impl Fn(&T) -> K) {
    let k = key(&row);
    match rows.iter_mut().find(|r| key(r) == k) {
        Some(existing) => *existing = row,
        None => rows.push(row),
    }
}

/// Persistence collaborator interface.
#[async_trait]
pub trait MeetingStore: Send + Sync + std::fmt::Debug {
    /// Register a scheduled meeting and its expected attendance.
    async fn create_meeting(
        &self,
        meeting: Meeting,
        attendance: Vec<Attendee>,
    ) -> Result<(), StoreError>;

    async fn read_meeting(&self, id: MeetingId) -> Result<Meeting, StoreError>;

    async fn list_attendance(&self, id: MeetingId) -> Result<Vec<Attendee>, StoreError>;

    /// Turn logs in insertion order.
    async fn list_turn_logs(&self, id: MeetingId) -> Result<Vec<TurnLog>, StoreError>;

    /// Stretch goals owned by the meeting's attendees.
    async fn list_stretch_goals(&self, id: MeetingId) -> Result<Vec<StretchGoal>, StoreError>;

    async fn list_feedback(&self, id: MeetingId) -> Result<Vec<Feedback>, StoreError>;

    /// Atomically apply `batch` if the meeting is still at
    /// `batch.expected_version`. Returns the new version.
    ///
    /// # Errors
    ///
    /// `VersionConflict` when the version moved; `FinalizedLog` when the
    /// batch rewrites a finalized turn log. Nothing is written on error.
    async fn commit(&self, batch: CommitBatch) -> Result<u64, StoreError>;

    /// Version-guarded partial update of the meeting record.
    async fn update_meeting(
        &self,
        id: MeetingId,
        patch: MeetingPatch,
        expected_version: u64,
    ) -> Result<Meeting, StoreError> {
        let mut meeting = self.read_meeting(id).await?;
        if meeting.version != expected_version {
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual: meeting.version,
            });
        }
        patch.apply(&mut meeting);
        let version = self.commit(CommitBatch::for_meeting(meeting.clone())).await?;
        meeting.version = version;
        Ok(meeting)
    }

    /// Append a new turn log.
    async fn insert_turn_log(&self, entry: TurnLog) -> Result<u64, StoreError> {
        let meeting = self.read_meeting(entry.meeting_id).await?;
        let mut batch = CommitBatch::for_meeting(meeting);
        batch.put_turn_log(entry);
        self.commit(batch).await
    }

    /// Patch every log matching `filter`. Returns how many were updated.
    ///
    /// # Errors
    ///
    /// `TurnLogNotFound` when nothing matches.
    async fn update_turn_log(
        &self,
        meeting_id: MeetingId,
        filter: TurnLogFilter,
        patch: TurnLogPatch,
    ) -> Result<usize, StoreError> {
        let meeting = self.read_meeting(meeting_id).await?;
        let mut batch = CommitBatch::for_meeting(meeting);
        for mut log in self.list_turn_logs(meeting_id).await? {
            if filter.matches(&log) {
                patch.apply(&mut log);
                batch.put_turn_log(log);
            }
        }
        if batch.turn_logs.is_empty() {
            return Err(StoreError::TurnLogNotFound);
        }
        let updated = batch.turn_logs.len();
        self.commit(batch).await?;
        Ok(updated)
    }

    async fn upsert_stretch_goal(
        &self,
        meeting_id: MeetingId,
        goal: StretchGoal,
    ) -> Result<u64, StoreError> {
        let meeting = self.read_meeting(meeting_id).await?;
        let mut batch = CommitBatch::for_meeting(meeting);
        batch.put_stretch_goal(goal);
        self.commit(batch).await
    }

    /// Everything an observer needs for a full resync.
    async fn snapshot(&self, id: MeetingId) -> Result<MeetingSnapshot, StoreError> {
        Ok(MeetingSnapshot {
            meeting: self.read_meeting(id).await?,
            attendance: self.list_attendance(id).await?,
            turn_logs: self.list_turn_logs(id).await?,
            stretch_goals: self.list_stretch_goals(id).await?,
            feedback: self.list_feedback(id).await?,
        })
    }
}
