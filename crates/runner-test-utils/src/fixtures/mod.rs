//! Pre-configured meetings for runner testing.
//!
//! Provides:
//! - [`TestMeeting`], a builder for a scheduled meeting and its attendance
//! - [`MeetingHarness`], a spawned runner over the in-memory store with a
//!   manual clock

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use common::types::{MeetingId, UserId};
use meeting_runner::actors::{
    ActorMetrics, MeetingRunner, MeetingRunnerHandle, MutationContext, RunnerContext,
    RunnerSettings,
};
use meeting_runner::clock::ManualClock;
use meeting_runner::model::{Attendee, Meeting, MeetingSnapshot, Phase, PriorityTier};
use meeting_runner::phase;
use meeting_runner::store::memory::InMemoryStore;
use meeting_runner::store::MeetingStore;
use meeting_runner::sync::{AggregateKind, ChangeStream, ObserverView};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default scheduled start used by fixtures: 2026-03-04 19:00 UTC.
#[must_use]
pub fn default_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 4, 19, 0, 0)
        .single()
        .expect("valid fixture timestamp")
}

/// Test member fixture.
#[derive(Debug, Clone)]
pub struct TestMember {
    pub user_id: UserId,
    pub display_name: String,
    pub priority: Option<PriorityTier>,
    pub checked_in: bool,
    pub requested_support: bool,
}

impl TestMember {
    #[must_use]
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(),
            display_name: display_name.into(),
            priority: None,
            checked_in: true,
            requested_support: false,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: PriorityTier) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Expected but never checked in.
    #[must_use]
    pub fn absent(mut self) -> Self {
        self.checked_in = false;
        self
    }

    #[must_use]
    pub fn requesting_support(mut self) -> Self {
        self.requested_support = true;
        self
    }

    fn attendee(&self, start: DateTime<Utc>) -> Attendee {
        Attendee {
            user_id: self.user_id,
            display_name: self.display_name.clone(),
            checked_in_at: self.checked_in.then_some(start),
            priority: self.priority,
            requested_support: self.requested_support,
        }
    }
}

/// Test meeting fixture.
///
/// The scribe is not an attendee, so queues contain only the members added
/// here.
#[derive(Debug, Clone)]
pub struct TestMeeting {
    pub id: MeetingId,
    pub scribe: UserId,
    pub start: DateTime<Utc>,
    pub duration_minutes: u32,
    pub members: Vec<TestMember>,
    pub settings: RunnerSettings,
}

impl Default for TestMeeting {
    fn default() -> Self {
        Self::new()
    }
}

impl TestMeeting {
    /// A 120-minute meeting at [`default_start`] with no members.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: MeetingId::new(),
            scribe: UserId::new(),
            start: default_start(),
            duration_minutes: 120,
            members: Vec::new(),
            settings: RunnerSettings::default(),
        }
    }

    #[must_use]
    pub fn with_duration_minutes(mut self, minutes: u32) -> Self {
        self.duration_minutes = minutes;
        self
    }

    #[must_use]
    pub fn with_start(mut self, start: DateTime<Utc>) -> Self {
        self.start = start;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: RunnerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Add a checked-in member with an optional tier.
    #[must_use]
    pub fn with_member(self, priority: Option<PriorityTier>) -> Self {
        let name = format!("Member {}", self.members.len());
        let member = match priority {
            Some(tier) => TestMember::new(name).with_priority(tier),
            None => TestMember::new(name),
        };
        self.with(member)
    }

    #[must_use]
    pub fn with(mut self, member: TestMember) -> Self {
        self.members.push(member);
        self
    }

    /// The meeting record as it is first stored.
    #[must_use]
    pub fn meeting(&self) -> Meeting {
        Meeting::scheduled(self.id, self.scribe, self.start, self.duration_minutes)
    }

    #[must_use]
    pub fn attendance(&self) -> Vec<Attendee> {
        self.members.iter().map(|m| m.attendee(self.start)).collect()
    }

    /// Seed an in-memory store and spawn a runner over it.
    pub async fn spawn(self) -> MeetingHarness {
        self.spawn_with(|store| Arc::new(store) as Arc<dyn MeetingStore>)
            .await
    }

    /// Seed an in-memory store, then spawn a runner over whatever `wrap`
    /// builds around it.
    pub async fn spawn_with<F>(self, wrap: F) -> MeetingHarness
    where
        F: FnOnce(InMemoryStore) -> Arc<dyn MeetingStore>,
    {
        let store = InMemoryStore::new();
        store
            .create_meeting(self.meeting(), self.attendance())
            .await
            .expect("seed meeting");

        let clock = ManualClock::new(self.start);
        let metrics = ActorMetrics::new();
        let cancel_token = CancellationToken::new();
        let context = RunnerContext {
            store: wrap(store.clone()),
            clock: Arc::new(clock.clone()),
            settings: self.settings,
            metrics: Arc::clone(&metrics),
        };

        let (handle, task) = MeetingRunner::spawn(self.id, context, cancel_token.clone())
            .await
            .expect("spawn runner");

        MeetingHarness {
            store,
            clock,
            handle,
            task,
            metrics,
            cancel_token,
            scribe: self.scribe,
            members: self.members.iter().map(|m| m.user_id).collect(),
            meeting_id: self.id,
        }
    }
}

/// A running meeting and the collaborators behind it.
#[derive(Debug)]
pub struct MeetingHarness {
    /// The backing store, bypassing any wrapper given to `spawn_with`.
    pub store: InMemoryStore,
    pub clock: ManualClock,
    pub handle: MeetingRunnerHandle,
    pub task: JoinHandle<()>,
    pub metrics: Arc<ActorMetrics>,
    pub cancel_token: CancellationToken,
    pub scribe: UserId,
    /// Member ids in the order they were added.
    pub members: Vec<UserId>,
    pub meeting_id: MeetingId,
}

impl MeetingHarness {
    /// Context for a mutation issued by the current fixture scribe.
    #[must_use]
    pub fn ctx(&self) -> MutationContext {
        MutationContext::new(self.scribe)
    }

    #[must_use]
    pub fn ctx_as(&self, caller: UserId) -> MutationContext {
        MutationContext::new(caller)
    }

    #[must_use]
    pub fn member(&self, index: usize) -> UserId {
        *self.members.get(index).expect("member index in range")
    }

    pub async fn snapshot(&self) -> MeetingSnapshot {
        self.handle.snapshot().await.expect("snapshot")
    }

    pub async fn meeting(&self) -> Meeting {
        self.snapshot().await.meeting
    }

    /// Advance one phase at a time until `target`, as the scribe recorded
    /// on the meeting.
    pub async fn advance_to(&self, target: Phase) {
        loop {
            let meeting = self.meeting().await;
            if meeting.phase == target {
                return;
            }
            let next = phase::next_phase(meeting.phase, meeting.curriculum_ditched)
                .expect("target phase is ahead of the current one");
            self.handle
                .advance_phase(
                    MutationContext::new(meeting.scribe_id),
                    meeting.phase,
                    next,
                )
                .await
                .expect("advance phase");
        }
    }

    /// Start and complete a turn with no extras.
    pub async fn take_turn(&self, participant_id: UserId) {
        let ctx = self.ctx();
        self.handle
            .start_timer(ctx, participant_id)
            .await
            .expect("start timer");
        self.handle
            .complete_turn(self.ctx(), participant_id, Default::default(), None)
            .await
            .expect("complete turn");
    }

    /// A connected observer: subscribed first, then resynced, so no event
    /// falls between the two.
    pub async fn observer(&self, viewer: UserId) -> (ObserverView, ChangeStream) {
        let stream = self.handle.subscribe(&AggregateKind::ALL);
        let mut view = ObserverView::new(viewer);
        view.resync(self.snapshot().await);
        (view, stream)
    }
}
