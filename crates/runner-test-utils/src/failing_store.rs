//! Store wrapper that fails commits on demand.
//!
//! Reads always pass through. While commit failure is armed, every
//! [`MeetingStore::commit`] returns a backend error and writes nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::types::MeetingId;
use meeting_runner::model::{Attendee, Feedback, Meeting, StretchGoal, TurnLog};
use meeting_runner::store::{CommitBatch, MeetingStore, StoreError};

/// Fault-injecting [`MeetingStore`].
///
/// Clones share the toggle, so a test can keep one and hand the other to the
/// runner.
#[derive(Debug, Clone)]
pub struct FailingStore {
    inner: Arc<dyn MeetingStore>,
    fail_commits: Arc<AtomicBool>,
}

impl FailingStore {
    #[must_use]
    pub fn new(inner: Arc<dyn MeetingStore>) -> Self {
        Self {
            inner,
            fail_commits: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every following commit fail.
    pub fn fail_commits(&self) {
        self.fail_commits.store(true, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.fail_commits.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_failing(&self) -> bool {
        self.fail_commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MeetingStore for FailingStore {
    async fn create_meeting(
        &self,
        meeting: Meeting,
        attendance: Vec<Attendee>,
    ) -> Result<(), StoreError> {
        self.inner.create_meeting(meeting, attendance).await
    }

    async fn read_meeting(&self, id: MeetingId) -> Result<Meeting, StoreError> {
        self.inner.read_meeting(id).await
    }

    async fn list_attendance(&self, id: MeetingId) -> Result<Vec<Attendee>, StoreError> {
        self.inner.list_attendance(id).await
    }

    async fn list_turn_logs(&self, id: MeetingId) -> Result<Vec<TurnLog>, StoreError> {
        self.inner.list_turn_logs(id).await
    }

    async fn list_stretch_goals(&self, id: MeetingId) -> Result<Vec<StretchGoal>, StoreError> {
        self.inner.list_stretch_goals(id).await
    }

    async fn list_feedback(&self, id: MeetingId) -> Result<Vec<Feedback>, StoreError> {
        self.inner.list_feedback(id).await
    }

    async fn commit(&self, batch: CommitBatch) -> Result<u64, StoreError> {
        if self.is_failing() {
            return Err(StoreError::Backend("injected commit failure".to_string()));
        }
        self.inner.commit(batch).await
    }
}
