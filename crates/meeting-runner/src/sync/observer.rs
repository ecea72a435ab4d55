//! Client-side view reconciliation.
//!
//! [`ObserverView`] is what a connected participant holds: the last
//! authoritative state seen on the change feed, any optimistic edits not yet
//! confirmed, and the participant's belief about who holds control. It only
//! ever trusts authoritative events and snapshots; tentative state is an
//! overlay that is dropped on confirmation or rollback.

use crate::model::{
    Attendee, Feedback, Meeting, MeetingSnapshot, Phase, StretchGoal, TurnLog,
};
use crate::sync::broadcaster::StreamItem;
use crate::sync::events::{AggregateKind, ChangeEvent, ChangePayload};
use common::types::{FeedbackId, MutationId, StretchGoalId, TurnLogId, UserId};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// What the participant's controls should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorityStatus {
    /// This participant is the scribe and may issue mutations.
    Controlling,
    /// Someone else holds control.
    Passive { holder: UserId },
    /// A hand-off was issued from here and has not been confirmed.
    HandoffPending { to: UserId },
    /// No trustworthy state; controls hidden until resync.
    Disconnected,
}

/// A participant's belief about control, derived from replicated state.
#[derive(Debug, Clone)]
pub struct AuthorityView {
    viewer: UserId,
    status: AuthorityStatus,
    handoff: Option<MutationId>,
    timed_out: bool,
}

impl AuthorityView {
    #[must_use]
    pub fn new(viewer: UserId) -> Self {
        Self {
            viewer,
            status: AuthorityStatus::Disconnected,
            handoff: None,
            timed_out: false,
        }
    }

    #[must_use]
    pub fn status(&self) -> AuthorityStatus {
        self.status
    }

    /// Whether mutation controls are usable.
    #[must_use]
    pub fn controls_enabled(&self) -> bool {
        self.status == AuthorityStatus::Controlling
    }

    /// Disable controls the moment a hand-off is issued.
    pub fn begin_handoff(&mut self, to: UserId, mutation_id: MutationId) {
        self.status = AuthorityStatus::HandoffPending { to };
        self.handoff = Some(mutation_id);
        self.timed_out = false;
    }

    /// The hand-off call returned an error: restore the previous holder.
    pub fn handoff_failed(&mut self, scribe_id: UserId) {
        self.handoff = None;
        self.timed_out = false;
        self.status = self.derive(scribe_id);
    }

    /// A hand-off call got no answer. Controls stay disabled and the outcome
    /// is only learned from replicated state.
    pub fn handoff_timed_out(&mut self) {
        if let AuthorityStatus::HandoffPending { .. } = self.status {
            self.timed_out = true;
        }
    }

    /// Whether the pending hand-off outlived its call.
    #[must_use]
    pub fn handoff_unresolved(&self) -> bool {
        self.timed_out
    }

    /// Authoritative meeting state arrived.
    fn observe(&mut self, scribe_id: UserId, mutation_id: Option<MutationId>) {
        if let AuthorityStatus::HandoffPending { .. } = self.status {
            let confirmed = mutation_id.is_some() && mutation_id == self.handoff;
            if !confirmed && scribe_id == self.viewer {
                return;
            }
            self.handoff = None;
            self.timed_out = false;
        }
        self.status = self.derive(scribe_id);
    }

    fn disconnect(&mut self) {
        self.status = AuthorityStatus::Disconnected;
        self.handoff = None;
        self.timed_out = false;
    }

    fn derive(&self, scribe_id: UserId) -> AuthorityStatus {
        if scribe_id == self.viewer {
            AuthorityStatus::Controlling
        } else {
            AuthorityStatus::Passive { holder: scribe_id }
        }
    }
}

/// Result of feeding one stream item into the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Duplicate or older than what the view already holds.
    Ignored,
    /// Events were lost; call [`ObserverView::resync`].
    ResyncRequired,
}

type MeetingEdit = Arc<dyn Fn(&mut Meeting) + Send + Sync>;

/// An optimistic edit waiting for its authoritative event.
#[derive(Clone)]
struct PendingEdit {
    mutation_id: MutationId,
    edit: MeetingEdit,
}

impl fmt::Debug for PendingEdit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingEdit")
            .field("mutation_id", &self.mutation_id)
            .finish_non_exhaustive()
    }
}

/// One participant's reconciled view of a meeting.
#[derive(Debug, Clone)]
pub struct ObserverView {
    meeting: Option<Meeting>,
    attendance: HashMap<UserId, Attendee>,
    turn_logs: HashMap<TurnLogId, TurnLog>,
    stretch_goals: HashMap<StretchGoalId, StretchGoal>,
    feedback: HashMap<FeedbackId, Feedback>,
    round_complete: Vec<Phase>,
    seen_versions: HashMap<AggregateKind, u64>,
    tentative: Vec<PendingEdit>,
    /// Pending edits replayed over `meeting`; `None` when nothing is pending.
    displayed: Option<Meeting>,
    authority: AuthorityView,
    needs_resync: bool,
}

impl ObserverView {
    /// Empty view for `viewer`; needs a [`resync`](Self::resync) before use.
    #[must_use]
    pub fn new(viewer: UserId) -> Self {
        Self {
            meeting: None,
            attendance: HashMap::new(),
            turn_logs: HashMap::new(),
            stretch_goals: HashMap::new(),
            feedback: HashMap::new(),
            round_complete: Vec::new(),
            seen_versions: HashMap::new(),
            tentative: Vec::new(),
            displayed: None,
            authority: AuthorityView::new(viewer),
            needs_resync: true,
        }
    }

    /// Replace everything with an authoritative snapshot.
    ///
    /// Unconfirmed optimistic edits are dropped; the snapshot supersedes them.
    pub fn resync(&mut self, snapshot: MeetingSnapshot) {
        let version = snapshot.meeting.version;
        self.attendance = snapshot
            .attendance
            .into_iter()
            .map(|a| (a.user_id, a))
            .collect();
        self.turn_logs = snapshot
            .turn_logs
            .into_iter()
            .map(|log| (log.id, log))
            .collect();
        self.stretch_goals = snapshot
            .stretch_goals
            .into_iter()
            .map(|g| (g.id, g))
            .collect();
        self.feedback = snapshot
            .feedback
            .into_iter()
            .map(|f| (f.id, f))
            .collect();
        self.round_complete = snapshot.meeting.completed_sections.clone();
        self.seen_versions = AggregateKind::ALL.iter().map(|k| (*k, version)).collect();
        self.tentative.clear();
        self.authority.observe(snapshot.meeting.scribe_id, None);
        self.meeting = Some(snapshot.meeting);
        self.displayed = None;
        self.needs_resync = false;
    }

    /// Feed one item from a change stream.
    pub fn on_stream_item(&mut self, item: &StreamItem) -> ApplyOutcome {
        match item {
            StreamItem::Event(event) => self.apply(event),
            StreamItem::Lagged(_) => {
                self.on_subscription_lost();
                ApplyOutcome::ResyncRequired
            }
        }
    }

    /// The feed ended or the connection dropped.
    pub fn on_subscription_lost(&mut self) {
        self.needs_resync = true;
        self.authority.disconnect();
    }

    /// Apply one authoritative event. Re-delivery is a no-op.
    pub fn apply(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        if self.needs_resync {
            return ApplyOutcome::ResyncRequired;
        }

        if let Some(kind) = event.payload.aggregate() {
            let seen = self.seen_versions.get(&kind).copied().unwrap_or(0);
            if event.version < seen {
                return ApplyOutcome::Ignored;
            }
        }

        let changed = match &event.payload {
            ChangePayload::Meeting(meeting) => self.apply_meeting(meeting, event.mutation_id),
            ChangePayload::Attendance(rows) => {
                upsert_all(&mut self.attendance, rows, |a| a.user_id, |_, _| true)
            }
            ChangePayload::TurnLogs(rows) => upsert_all(
                &mut self.turn_logs,
                rows,
                |log| log.id,
                |old, new| !old.is_finalized() || new.is_finalized(),
            ),
            ChangePayload::StretchGoals(rows) => {
                upsert_all(&mut self.stretch_goals, rows, |g| g.id, |_, _| true)
            }
            ChangePayload::Feedback(rows) => {
                upsert_all(&mut self.feedback, rows, |f| f.id, |_, _| true)
            }
            ChangePayload::RoundComplete { section } => {
                if self.round_complete.contains(section) {
                    false
                } else {
                    self.round_complete.push(*section);
                    true
                }
            }
        };

        if let Some(kind) = event.payload.aggregate() {
            let seen = self.seen_versions.entry(kind).or_insert(0);
            *seen = (*seen).max(event.version);
        }
        self.confirm(event.mutation_id);

        if changed {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Ignored
        }
    }

    fn apply_meeting(&mut self, meeting: &Meeting, mutation_id: MutationId) -> bool {
        if let Some(current) = &self.meeting {
            if meeting.version <= current.version {
                return false;
            }
        }
        self.authority.observe(meeting.scribe_id, Some(mutation_id));
        self.meeting = Some(meeting.clone());
        self.rebase();
        true
    }

    /// Show an optimistic meeting edit immediately.
    ///
    /// The edit is replayed over every newer authoritative meeting until its
    /// own event confirms it or the call fails. Returns `false` when there is
    /// no authoritative meeting to edit.
    pub fn apply_tentative<F>(&mut self, mutation_id: MutationId, edit: F) -> bool
    where
        F: Fn(&mut Meeting) + Send + Sync + 'static,
    {
        if self.meeting.is_none() {
            return false;
        }
        self.tentative.push(PendingEdit {
            mutation_id,
            edit: Arc::new(edit),
        });
        self.rebase();
        true
    }

    /// The mutation's authoritative event was observed.
    fn confirm(&mut self, mutation_id: MutationId) {
        self.rollback(mutation_id);
    }

    /// The mutating call failed; drop its optimistic edit.
    pub fn rollback(&mut self, mutation_id: MutationId) {
        let before = self.tentative.len();
        self.tentative.retain(|p| p.mutation_id != mutation_id);
        if self.tentative.len() != before {
            self.rebase();
        }
    }

    fn rebase(&mut self) {
        self.displayed = match (&self.meeting, self.tentative.is_empty()) {
            (Some(base), false) => {
                let mut draft = base.clone();
                for pending in &self.tentative {
                    (pending.edit)(&mut draft);
                }
                Some(draft)
            }
            _ => None,
        };
    }

    /// Meeting as displayed: pending edits over the latest authoritative
    /// meeting.
    #[must_use]
    pub fn meeting(&self) -> Option<&Meeting> {
        self.displayed.as_ref().or(self.meeting.as_ref())
    }

    /// Last authoritative meeting, ignoring optimistic edits.
    #[must_use]
    pub fn authoritative_meeting(&self) -> Option<&Meeting> {
        self.meeting.as_ref()
    }

    #[must_use]
    pub fn has_pending(&self, mutation_id: MutationId) -> bool {
        self.tentative.iter().any(|p| p.mutation_id == mutation_id)
    }

    #[must_use]
    pub fn turn_log(&self, id: TurnLogId) -> Option<&TurnLog> {
        self.turn_logs.get(&id)
    }

    /// Turn logs ordered by start time.
    #[must_use]
    pub fn turn_logs(&self) -> Vec<&TurnLog> {
        let mut logs: Vec<&TurnLog> = self.turn_logs.values().collect();
        logs.sort_by_key(|log| (log.start_time, log.id));
        logs
    }

    #[must_use]
    pub fn attendee(&self, user_id: UserId) -> Option<&Attendee> {
        self.attendance.get(&user_id)
    }

    #[must_use]
    pub fn stretch_goals(&self) -> Vec<&StretchGoal> {
        self.stretch_goals.values().collect()
    }

    #[must_use]
    pub fn feedback_count(&self) -> usize {
        self.feedback.len()
    }

    #[must_use]
    pub fn round_complete(&self, section: Phase) -> bool {
        self.round_complete.contains(&section)
    }

    #[must_use]
    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    #[must_use]
    pub fn authority(&self) -> &AuthorityView {
        &self.authority
    }

    pub fn authority_mut(&mut self) -> &mut AuthorityView {
        &mut self.authority
    }
}

/// Upsert rows keyed by `key`, keeping the old row when `replace` says no.
/// Returns whether anything changed.
fn upsert_all<K, V>(
    map: &mut HashMap<K, V>,
    rows: &[V],
    key: impl Fn(&V) -> K,
    replace: impl Fn(&V, &V) -> bool,
) -> bool
where
    K: Hash + Eq,
    V: Clone + PartialEq,
{
    let mut changed = false;
    for row in rows {
        let k = key(row);
        match map.get(&k) {
            Some(existing) if existing == row || !replace(existing, row) => {}
            _ => {
                map.insert(k, row.clone());
                changed = true;
            }
        }
    }
    changed
}
