//! `MeetingRunner` - one actor per live meeting.
//!
//! The runner caches the authoritative state of its meeting and is the only
//! writer to it. A mutation is validated against the cache, written to the
//! store as one version-guarded [`CommitBatch`], swapped into the cache only
//! once the commit succeeds, and then published on the meeting's
//! [`SyncBroadcaster`].
//!
//! Losing the compare-and-set means something else moved the meeting. The
//! runner reloads from the store and answers `StaleState`; it never retries
//! on the caller's behalf.

use super::messages::{
    MeetingMessage, MeetingSummary, MutationContext, RecordingUpload, Reply,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::allocator::{self, AllocationPolicy, Allotment, TurnState};
use crate::authority;
use crate::clock::{elapsed_seconds, Clock};
use crate::config::{Config, DEFAULT_EVENT_BUFFER};
use crate::errors::{NotFoundKind, RunnerError};
use crate::model::{
    ActiveTimer, Attendee, Feedback, Meeting, MeetingSnapshot, Phase, PriorityTier,
    RecordingMetadata, StretchGoal, StretchGoalAction, StretchGoalStatus, TurnExtras, TurnLog,
};
use crate::observability::metrics;
use crate::phase;
use crate::store::{upsert, CommitBatch, MeetingStore, StoreError};
use crate::sync::{AggregateKind, ChangeEvent, ChangePayload, ChangeStream, SyncBroadcaster};
use crate::timer::{self, StoppedTurn, TimerReading, WarningThresholds};
use chrono::{DateTime, Utc};
use common::types::{FeedbackId, MeetingId, MutationId, StretchGoalId, UserId};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for a meeting runner mailbox.
const MEETING_CHANNEL_BUFFER: usize = 500;

/// Tunables every runner shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    pub allocation: AllocationPolicy,
    pub warnings: WarningThresholds,
    /// Change events buffered per subscriber.
    pub event_buffer: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            allocation: AllocationPolicy::default(),
            warnings: WarningThresholds::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl From<&Config> for RunnerSettings {
    fn from(config: &Config) -> Self {
        Self {
            allocation: config.allocation,
            warnings: config.warnings,
            event_buffer: config.event_buffer,
        }
    }
}

/// Collaborators handed to every runner.
#[derive(Debug, Clone)]
pub struct RunnerContext {
    pub store: Arc<dyn MeetingStore>,
    pub clock: Arc<dyn Clock>,
    pub settings: RunnerSettings,
    pub metrics: Arc<ActorMetrics>,
}

/// Handle to a `MeetingRunner`.
///
/// Every mutating method takes a [`MutationContext`]; the caller must be the
/// meeting's scribe.
#[derive(Debug, Clone)]
pub struct MeetingRunnerHandle {
    sender: mpsc::Sender<MeetingMessage>,
    cancel_token: CancellationToken,
    meeting_id: MeetingId,
    broadcaster: SyncBroadcaster,
}

impl MeetingRunnerHandle {
    #[must_use]
    pub fn meeting_id(&self) -> MeetingId {
        self.meeting_id
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(Reply<T>) -> MeetingMessage,
    ) -> Result<T, RunnerError> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(message(tx)).await.map_err(|e| {
            if self.cancel_token.is_cancelled() {
                RunnerError::Draining
            } else {
                RunnerError::Internal(format!("channel send failed: {e}"))
            }
        })?;

        rx.await
            .map_err(|e| RunnerError::Internal(format!("response receive failed: {e}")))?
    }

    /// Start `participant_id`'s turn.
    pub async fn start_timer(
        &self,
        ctx: MutationContext,
        participant_id: UserId,
    ) -> Result<TimerReading, RunnerError> {
        self.request(|respond_to| MeetingMessage::StartTimer {
            ctx,
            participant_id,
            respond_to,
        })
        .await
    }

    /// Stop the running turn without finalizing it.
    pub async fn stop_timer(&self, ctx: MutationContext) -> Result<StoppedTurn, RunnerError> {
        self.request(|respond_to| MeetingMessage::StopTimer { ctx, respond_to })
            .await
    }

    /// Finalize `participant_id`'s turn.
    ///
    /// `overtime_seconds` is what the client displayed, if it wants it
    /// checked against the measured value.
    pub async fn complete_turn(
        &self,
        ctx: MutationContext,
        participant_id: UserId,
        extras: TurnExtras,
        overtime_seconds: Option<u32>,
    ) -> Result<TurnLog, RunnerError> {
        self.request(|respond_to| MeetingMessage::CompleteTurn {
            ctx,
            participant_id,
            extras,
            overtime_seconds,
            respond_to,
        })
        .await
    }

    pub async fn skip_turn(
        &self,
        ctx: MutationContext,
        participant_id: UserId,
    ) -> Result<TurnLog, RunnerError> {
        self.request(|respond_to| MeetingMessage::SkipTurn {
            ctx,
            participant_id,
            respond_to,
        })
        .await
    }

    pub async fn advance_phase(
        &self,
        ctx: MutationContext,
        expected: Phase,
        target: Phase,
    ) -> Result<Meeting, RunnerError> {
        self.request(|respond_to| MeetingMessage::AdvancePhase {
            ctx,
            expected,
            target,
            respond_to,
        })
        .await
    }

    /// Hand scribe authority to `new_scribe`.
    pub async fn change_scribe(
        &self,
        ctx: MutationContext,
        new_scribe: UserId,
    ) -> Result<Meeting, RunnerError> {
        self.request(|respond_to| MeetingMessage::ChangeScribe {
            ctx,
            new_scribe,
            respond_to,
        })
        .await
    }

    pub async fn add_meeting_time(
        &self,
        ctx: MutationContext,
        minutes: u32,
    ) -> Result<Allotment, RunnerError> {
        self.request(|respond_to| MeetingMessage::AddMeetingTime {
            ctx,
            minutes,
            respond_to,
        })
        .await
    }

    pub async fn ditch_curriculum(&self, ctx: MutationContext) -> Result<Allotment, RunnerError> {
        self.request(|respond_to| MeetingMessage::DitchCurriculum { ctx, respond_to })
            .await
    }

    pub async fn complete_meeting(
        &self,
        ctx: MutationContext,
    ) -> Result<MeetingSummary, RunnerError> {
        self.request(|respond_to| MeetingMessage::CompleteMeeting { ctx, respond_to })
            .await
    }

    pub async fn set_priority(
        &self,
        ctx: MutationContext,
        participant_id: UserId,
        priority: PriorityTier,
    ) -> Result<Attendee, RunnerError> {
        self.request(|respond_to| MeetingMessage::SetPriority {
            ctx,
            participant_id,
            priority,
            respond_to,
        })
        .await
    }

    pub async fn set_support_flag(
        &self,
        ctx: MutationContext,
        participant_id: UserId,
        requested_support: bool,
    ) -> Result<Attendee, RunnerError> {
        self.request(|respond_to| MeetingMessage::SetSupportFlag {
            ctx,
            participant_id,
            requested_support,
            respond_to,
        })
        .await
    }

    pub async fn record_feedback(
        &self,
        ctx: MutationContext,
        participant_id: UserId,
        rating: u8,
        comment: Option<String>,
    ) -> Result<Feedback, RunnerError> {
        self.request(|respond_to| MeetingMessage::RecordFeedback {
            ctx,
            participant_id,
            rating,
            comment,
            respond_to,
        })
        .await
    }

    pub async fn save_recording(
        &self,
        ctx: MutationContext,
        recording: RecordingUpload,
    ) -> Result<RecordingMetadata, RunnerError> {
        self.request(|respond_to| MeetingMessage::SaveRecording {
            ctx,
            recording,
            respond_to,
        })
        .await
    }

    /// Full authoritative state, for resynchronizing an observer.
    pub async fn snapshot(&self) -> Result<MeetingSnapshot, RunnerError> {
        self.request(|respond_to| MeetingMessage::GetSnapshot { respond_to })
            .await
    }

    pub async fn allotment(&self) -> Result<Allotment, RunnerError> {
        self.request(|respond_to| MeetingMessage::GetAllotment { respond_to })
            .await
    }

    pub async fn timer_status(&self) -> Result<Option<TimerReading>, RunnerError> {
        self.request(|respond_to| MeetingMessage::GetTimerStatus { respond_to })
            .await
    }

    pub async fn summary(&self) -> Result<MeetingSummary, RunnerError> {
        self.request(|respond_to| MeetingMessage::GetSummary { respond_to })
            .await
    }

    /// Subscribe to change events for `kinds` (empty means all).
    ///
    /// Subscribe before calling [`snapshot`](Self::snapshot) so no event
    /// falls between the two.
    #[must_use]
    pub fn subscribe(&self, kinds: &[AggregateKind]) -> ChangeStream {
        self.broadcaster.subscribe(kinds)
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The `MeetingRunner` implementation.
pub struct MeetingRunner {
    meeting_id: MeetingId,
    receiver: mpsc::Receiver<MeetingMessage>,
    /// Child of the controller's token.
    cancel_token: CancellationToken,
    context: RunnerContext,
    broadcaster: SyncBroadcaster,
    /// Authoritative state as of the last successful commit.
    state: MeetingSnapshot,
    rng: StdRng,
    mailbox: MailboxMonitor,
}

impl MeetingRunner {
    /// Load the meeting from the store and spawn its runner.
    ///
    /// # Errors
    ///
    /// `NotFound(Meeting)` if the store has no such meeting, `Persistence`
    /// if it cannot be read.
    pub async fn spawn(
        meeting_id: MeetingId,
        context: RunnerContext,
        cancel_token: CancellationToken,
    ) -> Result<(MeetingRunnerHandle, JoinHandle<()>), RunnerError> {
        let state = context.store.snapshot(meeting_id).await?;

        let (sender, receiver) = mpsc::channel(MEETING_CHANNEL_BUFFER);
        let broadcaster = SyncBroadcaster::new(
            meeting_id,
            context.settings.event_buffer,
            cancel_token.child_token(),
        );

        let actor = Self {
            meeting_id,
            receiver,
            cancel_token: cancel_token.clone(),
            broadcaster: broadcaster.clone(),
            state,
            rng: StdRng::from_entropy(),
            mailbox: MailboxMonitor::new(ActorType::Meeting, meeting_id.to_string()),
            context,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = MeetingRunnerHandle {
            sender,
            cancel_token,
            meeting_id,
            broadcaster,
        };

        Ok((handle, task_handle))
    }

    #[instrument(skip_all, name = "runner.actor.meeting", fields(meeting_id = %self.meeting_id))]
    async fn run(mut self) {
        info!(
            target: "runner.actor.meeting",
            meeting_id = %self.meeting_id,
            phase = %self.state.meeting.phase,
            version = self.state.meeting.version,
            "MeetingRunner started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "runner.actor.meeting",
                        meeting_id = %self.meeting_id,
                        "MeetingRunner received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.context.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "runner.actor.meeting",
                                meeting_id = %self.meeting_id,
                                "MeetingRunner channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "runner.actor.meeting",
            meeting_id = %self.meeting_id,
            phase = %self.state.meeting.phase,
            messages_processed = self.mailbox.messages_processed(),
            "MeetingRunner stopped"
        );
    }

    async fn handle_message(&mut self, message: MeetingMessage) {
        match message {
            MeetingMessage::StartTimer {
                ctx,
                participant_id,
                respond_to,
            } => {
                let result = self.start_timer(ctx, participant_id).await;
                let _ = respond_to.send(self.finish("start_timer", &ctx, result));
            }

            MeetingMessage::StopTimer { ctx, respond_to } => {
                let result = self.stop_timer(ctx).await;
                let _ = respond_to.send(self.finish("stop_timer", &ctx, result));
            }

            MeetingMessage::CompleteTurn {
                ctx,
                participant_id,
                extras,
                overtime_seconds,
                respond_to,
            } => {
                let result = self
                    .complete_turn(ctx, participant_id, extras, overtime_seconds)
                    .await;
                let _ = respond_to.send(self.finish("complete_turn", &ctx, result));
            }

            MeetingMessage::SkipTurn {
                ctx,
                participant_id,
                respond_to,
            } => {
                let result = self.skip_turn(ctx, participant_id).await;
                let _ = respond_to.send(self.finish("skip_turn", &ctx, result));
            }

            MeetingMessage::AdvancePhase {
                ctx,
                expected,
                target,
                respond_to,
            } => {
                let result = self.advance_phase(ctx, expected, target).await;
                let _ = respond_to.send(self.finish("advance_phase", &ctx, result));
            }

            MeetingMessage::ChangeScribe {
                ctx,
                new_scribe,
                respond_to,
            } => {
                let result = self.change_scribe(ctx, new_scribe).await;
                let _ = respond_to.send(self.finish("change_scribe", &ctx, result));
            }

            MeetingMessage::AddMeetingTime {
                ctx,
                minutes,
                respond_to,
            } => {
                let result = self.add_meeting_time(ctx, minutes).await;
                let _ = respond_to.send(self.finish("add_meeting_time", &ctx, result));
            }

            MeetingMessage::DitchCurriculum { ctx, respond_to } => {
                let result = self.ditch_curriculum(ctx).await;
                let _ = respond_to.send(self.finish("ditch_curriculum", &ctx, result));
            }

            MeetingMessage::CompleteMeeting { ctx, respond_to } => {
                let result = self.complete_meeting(ctx).await;
                let _ = respond_to.send(self.finish("complete_meeting", &ctx, result));
            }

            MeetingMessage::SetPriority {
                ctx,
                participant_id,
                priority,
                respond_to,
            } => {
                let result = self.set_priority(ctx, participant_id, priority).await;
                let _ = respond_to.send(self.finish("set_priority", &ctx, result));
            }

            MeetingMessage::SetSupportFlag {
                ctx,
                participant_id,
                requested_support,
                respond_to,
            } => {
                let result = self
                    .set_support_flag(ctx, participant_id, requested_support)
                    .await;
                let _ = respond_to.send(self.finish("set_support_flag", &ctx, result));
            }

            MeetingMessage::RecordFeedback {
                ctx,
                participant_id,
                rating,
                comment,
                respond_to,
            } => {
                let result = self
                    .record_feedback(ctx, participant_id, rating, comment)
                    .await;
                let _ = respond_to.send(self.finish("record_feedback", &ctx, result));
            }

            MeetingMessage::SaveRecording {
                ctx,
                recording,
                respond_to,
            } => {
                let result = self.save_recording(ctx, recording).await;
                let _ = respond_to.send(self.finish("save_recording", &ctx, result));
            }

            MeetingMessage::GetSnapshot { respond_to } => {
                let _ = respond_to.send(Ok(self.state.clone()));
            }

            MeetingMessage::GetAllotment { respond_to } => {
                let _ = respond_to.send(Ok(self.current_allotment()));
            }

            MeetingMessage::GetTimerStatus { respond_to } => {
                let now = self.now();
                let reading = self
                    .state
                    .meeting
                    .active_timer
                    .as_ref()
                    .map(|t| timer::read(t, now, &self.context.settings.warnings));
                let _ = respond_to.send(Ok(reading));
            }

            MeetingMessage::GetSummary { respond_to } => {
                let _ = respond_to.send(Ok(MeetingSummary::from_snapshot(&self.state)));
            }
        }
    }

    /// Count and log a rejected mutation.
    fn finish<T>(
        &self,
        operation: &'static str,
        ctx: &MutationContext,
        result: Result<T, RunnerError>,
    ) -> Result<T, RunnerError> {
        if let Err(err) = &result {
            self.context.metrics.record_rejection();
            metrics::record_rejection(err.reason_label());
            debug!(
                target: "runner.actor.meeting",
                meeting_id = %self.meeting_id,
                operation,
                caller = %ctx.caller,
                mutation_id = %ctx.mutation_id,
                reason = err.reason_label(),
                error = %err,
                "Mutation rejected"
            );
        }
        result
    }

    // --- Mutations ---

    #[instrument(skip_all, fields(meeting_id = %self.meeting_id))]
    async fn start_timer(
        &mut self,
        ctx: MutationContext,
        participant_id: UserId,
    ) -> Result<TimerReading, RunnerError> {
        self.authorize(ctx.caller)?;
        let section = self.turn_section()?;
        if self.state.meeting.active_timer.is_some() {
            return Err(RunnerError::InvalidTransition(
                "another turn is already running".to_string(),
            ));
        }
        self.ensure_queued(participant_id)?;
        if allocator::turn_state(&self.state.turn_logs, section, participant_id) != TurnState::Idle
        {
            return Err(RunnerError::InvalidTransition(
                "turn has already started".to_string(),
            ));
        }

        let now = self.now();
        let allotted = allocator::allotment(
            &self.state.meeting,
            &self.state.turn_logs,
            now,
            &self.context.settings.allocation,
        )
        .per_person_seconds;
        let priority = self
            .attendee(participant_id)
            .map_or(PriorityTier::DEFAULT, Attendee::effective_priority);

        let log = TurnLog::turn_started(
            self.meeting_id,
            section,
            participant_id,
            now,
            allotted,
            priority,
        );
        let active = ActiveTimer {
            participant_id,
            section,
            started_at: now,
            allotted_seconds: allotted,
            turn_log_id: log.id,
        };

        let mut batch = self.batch();
        batch.meeting.active_timer = Some(active.clone());
        batch.put_turn_log(log);
        self.commit(&ctx, batch, Vec::new()).await?;

        debug!(
            target: "runner.actor.meeting",
            meeting_id = %self.meeting_id,
            section = %section,
            allotted_seconds = allotted,
            "Turn started"
        );

        Ok(timer::read(&active, now, &self.context.settings.warnings))
    }

    #[instrument(skip_all, fields(meeting_id = %self.meeting_id))]
    async fn stop_timer(&mut self, ctx: MutationContext) -> Result<StoppedTurn, RunnerError> {
        self.authorize(ctx.caller)?;
        let active = self
            .state
            .meeting
            .active_timer
            .clone()
            .ok_or_else(|| RunnerError::InvalidTransition("no turn is running".to_string()))?;
        let mut log = self
            .state
            .turn_logs
            .iter()
            .find(|log| log.id == active.turn_log_id && !log.is_finalized())
            .cloned()
            .ok_or(RunnerError::NotFound(NotFoundKind::Turn))?;

        let stopped = timer::stop(&active, self.now());
        log.stopped_at = Some(stopped.stopped_at);
        log.duration_seconds = Some(stopped.duration_seconds);
        log.overtime_seconds = Some(stopped.overtime_seconds);

        let mut batch = self.batch();
        batch.meeting.active_timer = None;
        batch.put_turn_log(log);
        self.commit(&ctx, batch, Vec::new()).await?;

        Ok(stopped)
    }

    #[instrument(skip_all, fields(meeting_id = %self.meeting_id))]
    async fn complete_turn(
        &mut self,
        ctx: MutationContext,
        participant_id: UserId,
        extras: TurnExtras,
        reported_overtime: Option<u32>,
    ) -> Result<TurnLog, RunnerError> {
        self.authorize(ctx.caller)?;
        let section = self.turn_section()?;
        self.ensure_queued(participant_id)?;
        let mut log = self.started_log(section, participant_id)?;

        let now = self.now();
        let mut batch = self.batch();
        settle_turn(&mut batch, &mut log, now);

        let overtime = log.overtime_seconds.unwrap_or(0);
        if let Some(reported) = reported_overtime {
            if reported != overtime {
                return Err(RunnerError::InvalidTransition(format!(
                    "overtime is {overtime}s, not {reported}s"
                )));
            }
        }

        let mut attendee = self.attendee(participant_id).cloned();
        if section == Phase::LightningRound {
            if extras.stretch_goal_action.is_some() {
                return Err(RunnerError::InvalidTransition(
                    "stretch goals are reviewed in full check-ins".to_string(),
                ));
            }
            if let (Some(priority), Some(member)) = (extras.priority, attendee.as_mut()) {
                self.ensure_may_hold(participant_id, priority)?;
                member.priority = Some(priority);
            }
        } else {
            if extras.priority.is_some() {
                return Err(RunnerError::InvalidTransition(
                    "priority is frozen once full check-ins begin".to_string(),
                ));
            }
            if let Some(action) = &extras.stretch_goal_action {
                for goal in self.stretch_goal_changes(participant_id, action, now)? {
                    batch.put_stretch_goal(goal);
                }
            }
        }

        if let (Some(flag), Some(member)) = (extras.requested_support, attendee.as_mut()) {
            member.requested_support = flag;
        }
        log.requested_support = attendee.as_ref().map_or(
            extras.requested_support.unwrap_or(false),
            |member| member.requested_support,
        );
        log.priority = Some(attendee.as_ref().map_or_else(
            || PriorityTier::effective(log.priority),
            Attendee::effective_priority,
        ));
        log.stretch_goal_action = extras.stretch_goal_action;
        log.end_time = Some(now);

        if extras.priority.is_some() || extras.requested_support.is_some() {
            if let Some(member) = attendee {
                batch.put_attendee(member);
            }
        }
        batch.put_turn_log(log.clone());

        let signals = self.mark_round_complete(&mut batch, section);
        self.commit(&ctx, batch, signals).await?;
        metrics::record_turn_completed(section.as_str(), overtime);

        Ok(log)
    }

    #[instrument(skip_all, fields(meeting_id = %self.meeting_id))]
    async fn skip_turn(
        &mut self,
        ctx: MutationContext,
        participant_id: UserId,
    ) -> Result<TurnLog, RunnerError> {
        self.authorize(ctx.caller)?;
        let section = self.turn_section()?;
        self.ensure_queued(participant_id)?;

        let tier = self
            .attendee(participant_id)
            .map_or(PriorityTier::DEFAULT, Attendee::effective_priority);
        if tier == PriorityTier::P1 {
            return Err(RunnerError::InvalidTransition(
                "priority-1 members cannot be skipped".to_string(),
            ));
        }

        let now = self.now();
        let mut log = match allocator::turn_state(&self.state.turn_logs, section, participant_id) {
            TurnState::Logged | TurnState::Skipped => {
                return Err(RunnerError::InvalidTransition(
                    "turn is already logged".to_string(),
                ));
            }
            TurnState::Idle => {
                let mut log = TurnLog::turn_started(
                    self.meeting_id,
                    section,
                    participant_id,
                    now,
                    0,
                    PriorityTier::P2,
                );
                log.allotted_seconds = None;
                log
            }
            TurnState::Running | TurnState::Stopped => {
                self.started_log(section, participant_id)?
            }
        };

        let mut batch = self.batch();
        settle_turn(&mut batch, &mut log, now);
        log.skipped = true;
        log.priority = Some(PriorityTier::P2);
        log.end_time = Some(now);
        batch.put_turn_log(log.clone());

        let signals = self.mark_round_complete(&mut batch, section);
        self.commit(&ctx, batch, signals).await?;
        metrics::record_turn_skipped(section.as_str());

        Ok(log)
    }

    #[instrument(skip_all, fields(meeting_id = %self.meeting_id))]
    async fn advance_phase(
        &mut self,
        ctx: MutationContext,
        expected: Phase,
        target: Phase,
    ) -> Result<Meeting, RunnerError> {
        phase::validate_advance(&self.state.meeting, ctx.caller, expected, target)?;
        self.enter_phase(&ctx, target).await
    }

    /// Commit an already validated transition into `target`.
    async fn enter_phase(
        &mut self,
        ctx: &MutationContext,
        target: Phase,
    ) -> Result<Meeting, RunnerError> {
        let now = self.now();
        let previous = self.state.meeting.phase;
        let transition = phase::transition(&self.state.meeting, &self.state.turn_logs, target, now);

        let mut batch = CommitBatch::for_meeting(transition.meeting);
        batch.meeting.queue = match target {
            Phase::LightningRound => {
                allocator::lightning_queue(&self.state.attendance, &mut self.rng)
            }
            Phase::FullCheckins => {
                allocator::full_checkin_queue(&self.state.meeting.queue, &self.state.attendance)
            }
            _ => Vec::new(),
        };
        if let Some(closed) = transition.closed {
            batch.put_turn_log(closed);
        }
        if let Some(opened) = transition.opened {
            batch.put_turn_log(opened);
        }
        self.commit(ctx, batch, Vec::new()).await?;

        info!(
            target: "runner.actor.meeting",
            meeting_id = %self.meeting_id,
            from = %previous,
            to = %target,
            queue_len = self.state.meeting.queue.len(),
            "Phase advanced"
        );

        Ok(self.state.meeting.clone())
    }

    #[instrument(skip_all, fields(meeting_id = %self.meeting_id))]
    async fn change_scribe(
        &mut self,
        ctx: MutationContext,
        new_scribe: UserId,
    ) -> Result<Meeting, RunnerError> {
        authority::validate_reassign(
            &self.state.meeting,
            &self.state.attendance,
            ctx.caller,
            new_scribe,
        )?;

        let previous = self.state.meeting.scribe_id;
        let mut batch = self.batch();
        batch.meeting.scribe_id = new_scribe;
        self.commit(&ctx, batch, Vec::new()).await?;
        metrics::record_handoff();

        info!(
            target: "runner.actor.meeting",
            meeting_id = %self.meeting_id,
            from = %previous,
            to = %new_scribe,
            "Scribe authority handed off"
        );

        Ok(self.state.meeting.clone())
    }

    async fn add_meeting_time(
        &mut self,
        ctx: MutationContext,
        minutes: u32,
    ) -> Result<Allotment, RunnerError> {
        self.authorize(ctx.caller)?;
        self.ensure_not_ended()?;
        if minutes == 0 {
            return Err(RunnerError::InvalidTransition(
                "extend the meeting by at least one minute".to_string(),
            ));
        }

        let mut batch = self.batch();
        batch.meeting.duration_minutes = batch
            .meeting
            .duration_minutes
            .checked_add(minutes)
            .ok_or_else(|| RunnerError::InvalidTransition("meeting is too long".to_string()))?;
        self.commit(&ctx, batch, Vec::new()).await?;

        Ok(self.current_allotment())
    }

    async fn ditch_curriculum(&mut self, ctx: MutationContext) -> Result<Allotment, RunnerError> {
        self.authorize(ctx.caller)?;
        if self.state.meeting.curriculum_ditched {
            return Err(RunnerError::InvalidTransition(
                "curriculum is already ditched".to_string(),
            ));
        }
        if self.state.meeting.phase >= Phase::Curriculum {
            return Err(RunnerError::InvalidTransition(
                "curriculum has already begun".to_string(),
            ));
        }

        let mut batch = self.batch();
        batch.meeting.curriculum_ditched = true;
        self.commit(&ctx, batch, Vec::new()).await?;

        info!(
            target: "runner.actor.meeting",
            meeting_id = %self.meeting_id,
            "Curriculum ditched"
        );

        Ok(self.current_allotment())
    }

    async fn complete_meeting(
        &mut self,
        ctx: MutationContext,
    ) -> Result<MeetingSummary, RunnerError> {
        self.authorize(ctx.caller)?;
        let current = self.state.meeting.phase;
        if current != Phase::Closing {
            return Err(RunnerError::InvalidTransition(format!(
                "meeting can only be completed from closing, not {current}"
            )));
        }
        phase::validate_advance(&self.state.meeting, ctx.caller, Phase::Closing, Phase::Ended)?;
        self.enter_phase(&ctx, Phase::Ended).await?;

        Ok(MeetingSummary::from_snapshot(&self.state))
    }

    async fn set_priority(
        &mut self,
        ctx: MutationContext,
        participant_id: UserId,
        priority: PriorityTier,
    ) -> Result<Attendee, RunnerError> {
        self.authorize(ctx.caller)?;
        if self.state.meeting.phase != Phase::LightningRound {
            return Err(RunnerError::InvalidTransition(
                "priority is assigned during the lightning round".to_string(),
            ));
        }
        let mut member = self.checked_in(participant_id)?.clone();
        self.ensure_may_hold(participant_id, priority)?;
        member.priority = Some(priority);

        let mut batch = self.batch();
        batch.put_attendee(member.clone());
        if let Some(mut log) = self.open_log(Phase::LightningRound, participant_id) {
            log.priority = Some(priority);
            batch.put_turn_log(log);
        }
        self.commit(&ctx, batch, Vec::new()).await?;

        Ok(member)
    }

    async fn set_support_flag(
        &mut self,
        ctx: MutationContext,
        participant_id: UserId,
        requested_support: bool,
    ) -> Result<Attendee, RunnerError> {
        self.authorize(ctx.caller)?;
        self.ensure_not_ended()?;
        let mut member = self
            .attendee(participant_id)
            .cloned()
            .ok_or(RunnerError::NotFound(NotFoundKind::User))?;
        member.requested_support = requested_support;

        let mut batch = self.batch();
        batch.put_attendee(member.clone());
        if let Some(mut log) = self.open_log(self.state.meeting.phase, participant_id) {
            log.requested_support = requested_support;
            batch.put_turn_log(log);
        }
        self.commit(&ctx, batch, Vec::new()).await?;

        Ok(member)
    }

    async fn record_feedback(
        &mut self,
        ctx: MutationContext,
        participant_id: UserId,
        rating: u8,
        comment: Option<String>,
    ) -> Result<Feedback, RunnerError> {
        self.authorize(ctx.caller)?;
        if self.state.meeting.phase != Phase::Closing {
            return Err(RunnerError::InvalidTransition(
                "feedback is recorded during closing".to_string(),
            ));
        }
        if !(1..=10).contains(&rating) {
            return Err(RunnerError::InvalidTransition(
                "rating must be between 1 and 10".to_string(),
            ));
        }
        self.checked_in(participant_id)?;

        // Re-recording replaces the member's earlier entry.
        let id = self
            .state
            .feedback
            .iter()
            .find(|f| f.user_id == participant_id)
            .map_or_else(FeedbackId::new, |f| f.id);
        let entry = Feedback {
            id,
            meeting_id: self.meeting_id,
            user_id: participant_id,
            rating,
            comment: comment
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty()),
            recorded_at: self.now(),
        };

        let mut batch = self.batch();
        batch.put_feedback(entry.clone());
        self.commit(&ctx, batch, Vec::new()).await?;

        Ok(entry)
    }

    async fn save_recording(
        &mut self,
        ctx: MutationContext,
        recording: RecordingUpload,
    ) -> Result<RecordingMetadata, RunnerError> {
        self.authorize(ctx.caller)?;
        if self.state.meeting.phase == Phase::NotStarted {
            return Err(RunnerError::InvalidTransition(
                "meeting has not started".to_string(),
            ));
        }
        if recording.storage_key.trim().is_empty() {
            return Err(RunnerError::InvalidTransition(
                "recording storage key is empty".to_string(),
            ));
        }

        let metadata = RecordingMetadata {
            storage_key: recording.storage_key,
            mime_type: recording.mime_type,
            duration_seconds: recording.duration_seconds,
            saved_at: self.now(),
        };
        let mut batch = self.batch();
        batch.meeting.recording = Some(metadata.clone());
        self.commit(&ctx, batch, Vec::new()).await?;

        Ok(metadata)
    }

    // --- Commit path ---

    /// Write `batch`, then swap it into the cache and publish.
    async fn commit(
        &mut self,
        ctx: &MutationContext,
        batch: CommitBatch,
        signals: Vec<ChangePayload>,
    ) -> Result<u64, RunnerError> {
        let started = Instant::now();
        let result = self.context.store.commit(batch.clone()).await;
        metrics::record_commit_latency(started.elapsed());

        let version = match result {
            Ok(version) => version,
            Err(err @ StoreError::VersionConflict { .. }) => {
                warn!(
                    target: "runner.actor.meeting",
                    meeting_id = %self.meeting_id,
                    mutation_id = %ctx.mutation_id,
                    error = %err,
                    "Lost compare-and-set, reloading meeting"
                );
                self.refresh().await;
                return Err(err.into());
            }
            Err(err) => {
                error!(
                    target: "runner.actor.meeting",
                    meeting_id = %self.meeting_id,
                    mutation_id = %ctx.mutation_id,
                    error = %err,
                    "Commit failed"
                );
                return Err(err.into());
            }
        };

        let events = self.apply_committed(ctx, batch, version, signals);
        self.broadcaster.publish(events);
        Ok(version)
    }

    fn apply_committed(
        &mut self,
        ctx: &MutationContext,
        batch: CommitBatch,
        version: u64,
        signals: Vec<ChangePayload>,
    ) -> Vec<ChangeEvent> {
        let CommitBatch {
            mut meeting,
            turn_logs,
            attendance,
            stretch_goals,
            feedback,
            ..
        } = batch;
        meeting.version = version;
        self.state.meeting = meeting.clone();

        let mut payloads = vec![ChangePayload::Meeting(meeting)];
        if !attendance.is_empty() {
            for member in &attendance {
                upsert(&mut self.state.attendance, member.clone(), |a| a.user_id);
            }
            payloads.push(ChangePayload::Attendance(attendance));
        }
        if !turn_logs.is_empty() {
            for log in &turn_logs {
                upsert(&mut self.state.turn_logs, log.clone(), |l| l.id);
            }
            payloads.push(ChangePayload::TurnLogs(turn_logs));
        }
        if !stretch_goals.is_empty() {
            for goal in &stretch_goals {
                upsert(&mut self.state.stretch_goals, goal.clone(), |g| g.id);
            }
            payloads.push(ChangePayload::StretchGoals(stretch_goals));
        }
        if !feedback.is_empty() {
            for entry in &feedback {
                upsert(&mut self.state.feedback, entry.clone(), |f| f.id);
            }
            payloads.push(ChangePayload::Feedback(feedback));
        }
        payloads.extend(signals);

        payloads
            .into_iter()
            .map(|payload| ChangeEvent {
                meeting_id: self.meeting_id,
                version,
                mutation_id: ctx.mutation_id,
                payload,
            })
            .collect()
    }

    /// Reload the cache after losing a compare-and-set and republish it so
    /// subscribers converge on the winning write.
    async fn refresh(&mut self) {
        match self.context.store.snapshot(self.meeting_id).await {
            Ok(state) => {
                debug!(
                    target: "runner.actor.meeting",
                    meeting_id = %self.meeting_id,
                    version = state.meeting.version,
                    "Meeting reloaded from store"
                );
                let version = state.meeting.version;
                let mutation_id = MutationId::new();
                let payloads = vec![
                    ChangePayload::Meeting(state.meeting.clone()),
                    ChangePayload::Attendance(state.attendance.clone()),
                    ChangePayload::TurnLogs(state.turn_logs.clone()),
                    ChangePayload::StretchGoals(state.stretch_goals.clone()),
                    ChangePayload::Feedback(state.feedback.clone()),
                ];
                self.state = state;
                self.broadcaster.publish(
                    payloads
                        .into_iter()
                        .map(|payload| ChangeEvent {
                            meeting_id: self.meeting_id,
                            version,
                            mutation_id,
                            payload,
                        })
                        .collect(),
                );
            }
            Err(err) => {
                warn!(
                    target: "runner.actor.meeting",
                    meeting_id = %self.meeting_id,
                    error = %err,
                    "Failed to reload meeting"
                );
            }
        }
    }

    /// Record the round-complete signal on `batch` if this write accounts for
    /// the last queue member of `section`.
    fn mark_round_complete(&self, batch: &mut CommitBatch, section: Phase) -> Vec<ChangePayload> {
        if batch.meeting.section_completed(section) {
            return Vec::new();
        }
        let mut logs = self.state.turn_logs.clone();
        for log in &batch.turn_logs {
            upsert(&mut logs, log.clone(), |l| l.id);
        }
        if !allocator::round_complete(&batch.meeting.queue, &logs, section) {
            return Vec::new();
        }

        batch.meeting.completed_sections.push(section);
        info!(
            target: "runner.actor.meeting",
            meeting_id = %self.meeting_id,
            section = %section,
            "Round complete"
        );
        vec![ChangePayload::RoundComplete { section }]
    }

    // --- Helpers ---

    fn now(&self) -> DateTime<Utc> {
        self.context.clock.now()
    }

    fn batch(&self) -> CommitBatch {
        CommitBatch::for_meeting(self.state.meeting.clone())
    }

    fn current_allotment(&self) -> Allotment {
        allocator::allotment(
            &self.state.meeting,
            &self.state.turn_logs,
            self.now(),
            &self.context.settings.allocation,
        )
    }

    fn authorize(&self, caller: UserId) -> Result<(), RunnerError> {
        authority::authorize(&self.state.meeting, caller)
    }

    fn turn_section(&self) -> Result<Phase, RunnerError> {
        let phase = self.state.meeting.phase;
        if phase.has_turns() {
            Ok(phase)
        } else {
            Err(RunnerError::InvalidTransition(format!(
                "{phase} has no speaking turns"
            )))
        }
    }

    fn ensure_not_ended(&self) -> Result<(), RunnerError> {
        if self.state.meeting.phase == Phase::Ended {
            return Err(RunnerError::InvalidTransition(
                "meeting has ended".to_string(),
            ));
        }
        Ok(())
    }

    fn ensure_queued(&self, participant_id: UserId) -> Result<(), RunnerError> {
        if self.state.meeting.queue.contains(&participant_id) {
            Ok(())
        } else {
            Err(RunnerError::NotFound(NotFoundKind::User))
        }
    }

    fn attendee(&self, user_id: UserId) -> Option<&Attendee> {
        self.state.attendance.iter().find(|a| a.user_id == user_id)
    }

    fn checked_in(&self, user_id: UserId) -> Result<&Attendee, RunnerError> {
        self.attendee(user_id)
            .filter(|a| a.is_checked_in())
            .ok_or(RunnerError::NotFound(NotFoundKind::User))
    }

    fn open_log(&self, section: Phase, user_id: UserId) -> Option<TurnLog> {
        allocator::turn_log_for(&self.state.turn_logs, section, user_id)
            .filter(|log| !log.is_finalized())
            .cloned()
    }

    /// Priority-1 members are never skipped, so a skipped member stays below P1.
    fn ensure_may_hold(&self, user_id: UserId, priority: PriorityTier) -> Result<(), RunnerError> {
        let skipped = allocator::turn_state(&self.state.turn_logs, Phase::LightningRound, user_id)
            == TurnState::Skipped;
        if priority == PriorityTier::P1 && skipped {
            return Err(RunnerError::InvalidTransition(
                "a skipped member cannot be marked priority 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The member's started (running or stopped) turn log.
    fn started_log(&self, section: Phase, user_id: UserId) -> Result<TurnLog, RunnerError> {
        match allocator::turn_state(&self.state.turn_logs, section, user_id) {
            TurnState::Idle => Err(RunnerError::InvalidTransition(
                "turn has not started".to_string(),
            )),
            TurnState::Logged | TurnState::Skipped => Err(RunnerError::InvalidTransition(
                "turn is already logged".to_string(),
            )),
            TurnState::Running | TurnState::Stopped => self
                .open_log(section, user_id)
                .ok_or(RunnerError::NotFound(NotFoundKind::Turn)),
        }
    }

    fn stretch_goal_changes(
        &self,
        owner_id: UserId,
        action: &StretchGoalAction,
        now: DateTime<Utc>,
    ) -> Result<Vec<StretchGoal>, RunnerError> {
        let current = self
            .state
            .stretch_goals
            .iter()
            .find(|g| g.owner_id == owner_id && g.status == StretchGoalStatus::Active);

        let retire = |status: StretchGoalStatus| {
            current
                .cloned()
                .map(|mut goal| {
                    goal.status = status;
                    goal.updated_at = now;
                    goal
                })
                .ok_or_else(|| {
                    RunnerError::InvalidTransition("member has no active stretch goal".to_string())
                })
        };
        let fresh = |description: &str| {
            let description = description.trim();
            if description.is_empty() {
                return Err(RunnerError::InvalidTransition(
                    "stretch goal description is empty".to_string(),
                ));
            }
            Ok(StretchGoal {
                id: StretchGoalId::new(),
                owner_id,
                description: description.to_string(),
                status: StretchGoalStatus::Active,
                created_at: now,
                updated_at: now,
            })
        };

        match action {
            StretchGoalAction::Kept => Ok(Vec::new()),
            StretchGoalAction::Completed => Ok(vec![retire(StretchGoalStatus::Completed)?]),
            StretchGoalAction::Replaced { description } => {
                let replacement = fresh(description.as_str())?;
                Ok(vec![retire(StretchGoalStatus::Replaced)?, replacement])
            }
            StretchGoalAction::Created { description } => {
                if current.is_some() {
                    return Err(RunnerError::InvalidTransition(
                        "member already has an active stretch goal".to_string(),
                    ));
                }
                Ok(vec![fresh(description.as_str())?])
            }
        }
    }
}

/// Stop `log` at `now` if it is still running, and clear the meeting's
/// active timer when it belongs to this log.
fn settle_turn(batch: &mut CommitBatch, log: &mut TurnLog, now: DateTime<Utc>) {
    if log.stopped_at.is_none() {
        let duration = elapsed_seconds(log.start_time, now);
        log.stopped_at = Some(now);
        log.duration_seconds = Some(duration);
        log.overtime_seconds = Some(
            log.allotted_seconds
                .map_or(0, |allotted| timer::overtime_seconds(duration, allotted)),
        );
    }
    if batch
        .meeting
        .active_timer
        .as_ref()
        .is_some_and(|t| t.turn_log_id == log.id)
    {
        batch.meeting.active_timer = None;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::StaleReason;
    use crate::store::memory::InMemoryStore;
    use crate::sync::StreamItem;
    use chrono::TimeZone;
    use std::time::Duration;

    struct Harness {
        store: InMemoryStore,
        clock: ManualClock,
        handle: MeetingRunnerHandle,
        scribe: UserId,
        members: Vec<UserId>,
        meeting_id: MeetingId,
    }

    impl Harness {
        fn ctx(&self) -> MutationContext {
            MutationContext::new(self.scribe)
        }

        async fn advance_to(&self, target: Phase) {
            loop {
                let meeting = self.handle.snapshot().await.unwrap().meeting;
                if meeting.phase == target {
                    return;
                }
                let next = phase::next_phase(meeting.phase, meeting.curriculum_ditched).unwrap();
                self.handle
                    .advance_phase(self.ctx(), meeting.phase, next)
                    .await
                    .unwrap();
            }
        }
    }

    async fn harness(priorities: &[Option<PriorityTier>]) -> Harness {
        let start = Utc.with_ymd_and_hms(2026, 3, 4, 19, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        let store = InMemoryStore::new();
        let scribe = UserId::new();
        let meeting = Meeting::scheduled(MeetingId::new(), scribe, start, 120);

        let members: Vec<UserId> = priorities.iter().map(|_| UserId::new()).collect();
        let attendance = members
            .iter()
            .zip(priorities)
            .enumerate()
            .map(|(i, (user_id, priority))| Attendee {
                user_id: *user_id,
                display_name: format!("Member {i}"),
                checked_in_at: Some(start),
                priority: *priority,
                requested_support: false,
            })
            .collect();
        store.create_meeting(meeting.clone(), attendance).await.unwrap();

        let context = RunnerContext {
            store: Arc::new(store.clone()),
            clock: Arc::new(clock.clone()),
            settings: RunnerSettings::default(),
            metrics: ActorMetrics::new(),
        };
        let (handle, _task) = MeetingRunner::spawn(meeting.id, context, CancellationToken::new())
            .await
            .unwrap();

        Harness {
            store,
            clock,
            handle,
            scribe,
            members,
            meeting_id: meeting.id,
        }
    }

    #[tokio::test]
    async fn test_spawn_unknown_meeting_is_not_found() {
        let context = RunnerContext {
            store: Arc::new(InMemoryStore::new()),
            clock: Arc::new(ManualClock::new(Utc::now())),
            settings: RunnerSettings::default(),
            metrics: ActorMetrics::new(),
        };
        let result =
            MeetingRunner::spawn(MeetingId::new(), context, CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(RunnerError::NotFound(NotFoundKind::Meeting))
        ));
    }

    #[tokio::test]
    async fn test_non_scribe_cannot_mutate_and_nothing_is_written() {
        let h = harness(&[None, None]).await;
        let intruder = *h.members.first().unwrap();

        let err = h
            .handle
            .advance_phase(
                MutationContext::new(intruder),
                Phase::NotStarted,
                Phase::OpeningMeditation,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::NotAuthorized(_)));
        assert_eq!(h.store.read_meeting(h.meeting_id).await.unwrap().version, 0);
    }

    #[tokio::test]
    async fn test_advance_captures_start_and_opens_phase_logs() {
        let h = harness(&[None]).await;
        h.clock.advance(Duration::from_secs(120));

        let meeting = h
            .handle
            .advance_phase(h.ctx(), Phase::NotStarted, Phase::OpeningMeditation)
            .await
            .unwrap();

        assert_eq!(meeting.phase, Phase::OpeningMeditation);
        assert_eq!(meeting.started_at, Some(h.clock.now()));
        let logs = h.store.list_turn_logs(h.meeting_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs.iter().all(TurnLog::is_phase_level));
    }

    #[tokio::test]
    async fn test_stale_and_backward_advances_are_rejected() {
        let h = harness(&[None]).await;
        h.advance_to(Phase::OpeningEthos).await;

        let stale = h
            .handle
            .advance_phase(h.ctx(), Phase::OpeningMeditation, Phase::LightningRound)
            .await
            .unwrap_err();
        assert!(matches!(
            stale,
            RunnerError::StaleState(StaleReason::PhaseMismatch { .. })
        ));

        let backward = h
            .handle
            .advance_phase(h.ctx(), Phase::OpeningEthos, Phase::OpeningMeditation)
            .await
            .unwrap_err();
        assert!(matches!(backward, RunnerError::InvalidTransition(_)));

        let skip_ahead = h
            .handle
            .advance_phase(h.ctx(), Phase::OpeningEthos, Phase::FullCheckins)
            .await
            .unwrap_err();
        assert!(matches!(skip_ahead, RunnerError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_second_timer_is_rejected() {
        let h = harness(&[None, None]).await;
        h.advance_to(Phase::LightningRound).await;
        let first = *h.members.first().unwrap();
        let second = *h.members.get(1).unwrap();

        h.handle.start_timer(h.ctx(), first).await.unwrap();
        let err = h.handle.start_timer(h.ctx(), second).await.unwrap_err();
        assert!(matches!(err, RunnerError::InvalidTransition(_)));

        let open: Vec<TurnLog> = h
            .store
            .list_turn_logs(h.meeting_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|l| !l.is_phase_level() && !l.is_finalized())
            .collect();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn test_running_timer_blocks_advance() {
        let h = harness(&[None]).await;
        h.advance_to(Phase::LightningRound).await;
        let member = *h.members.first().unwrap();
        h.handle.start_timer(h.ctx(), member).await.unwrap();

        let err = h
            .handle
            .advance_phase(h.ctx(), Phase::LightningRound, Phase::FullCheckins)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_complete_running_turn_measures_overtime() {
        let h = harness(&[None]).await;
        h.advance_to(Phase::LightningRound).await;
        let member = *h.members.first().unwrap();

        let reading = h.handle.start_timer(h.ctx(), member).await.unwrap();
        assert_eq!(reading.allotted_seconds, 60);

        h.clock.advance(Duration::from_secs(75));
        let log = h
            .handle
            .complete_turn(h.ctx(), member, TurnExtras::default(), Some(15))
            .await
            .unwrap();

        assert_eq!(log.duration_seconds, Some(75));
        assert_eq!(log.overtime_seconds, Some(15));
        assert!(log.is_finalized());
        let meeting = h.handle.snapshot().await.unwrap().meeting;
        assert!(meeting.active_timer.is_none());
    }

    #[tokio::test]
    async fn test_complete_rejects_wrong_overtime() {
        let h = harness(&[None]).await;
        h.advance_to(Phase::LightningRound).await;
        let member = *h.members.first().unwrap();
        h.handle.start_timer(h.ctx(), member).await.unwrap();
        h.clock.advance(Duration::from_secs(30));

        let err = h
            .handle
            .complete_turn(h.ctx(), member, TurnExtras::default(), Some(5))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidTransition(_)));

        let meeting = h.handle.snapshot().await.unwrap().meeting;
        assert!(meeting.active_timer.is_some());
    }

    #[tokio::test]
    async fn test_stop_then_complete_keeps_stopped_duration() {
        let h = harness(&[None]).await;
        h.advance_to(Phase::LightningRound).await;
        let member = *h.members.first().unwrap();
        h.handle.start_timer(h.ctx(), member).await.unwrap();

        h.clock.advance(Duration::from_secs(40));
        let stopped = h.handle.stop_timer(h.ctx()).await.unwrap();
        assert_eq!(stopped.duration_seconds, 40);
        assert_eq!(stopped.overtime_seconds, 0);

        h.clock.advance(Duration::from_secs(300));
        let log = h
            .handle
            .complete_turn(h.ctx(), member, TurnExtras::default(), None)
            .await
            .unwrap();
        assert_eq!(log.duration_seconds, Some(40));
    }

    #[tokio::test]
    async fn test_p1_cannot_be_skipped() {
        let h = harness(&[Some(PriorityTier::P1), None]).await;
        h.advance_to(Phase::LightningRound).await;
        let p1 = *h.members.first().unwrap();
        let p2 = *h.members.get(1).unwrap();

        let err = h.handle.skip_turn(h.ctx(), p1).await.unwrap_err();
        assert!(matches!(err, RunnerError::InvalidTransition(_)));

        let log = h.handle.skip_turn(h.ctx(), p2).await.unwrap();
        assert!(log.skipped);
        assert_eq!(log.priority, Some(PriorityTier::P2));
    }

    #[tokio::test]
    async fn test_skipped_member_cannot_become_p1() {
        let h = harness(&[None, None]).await;
        h.advance_to(Phase::LightningRound).await;
        let skipped = *h.members.first().unwrap();
        h.handle.skip_turn(h.ctx(), skipped).await.unwrap();

        let err = h
            .handle
            .set_priority(h.ctx(), skipped, PriorityTier::P1)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidTransition(_)));

        let snapshot = h.handle.snapshot().await.unwrap();
        let member = snapshot
            .attendance
            .iter()
            .find(|a| a.user_id == skipped)
            .unwrap();
        assert_eq!(member.effective_priority(), PriorityTier::P2);

        // Confirming the default tier is still allowed.
        let member = h
            .handle
            .set_priority(h.ctx(), skipped, PriorityTier::P2)
            .await
            .unwrap();
        assert_eq!(member.priority, Some(PriorityTier::P2));
    }

    #[tokio::test]
    async fn test_lightning_priority_carries_into_full_checkins_order() {
        let h = harness(&[None, None, None]).await;
        h.advance_to(Phase::LightningRound).await;
        let lightning = h.handle.snapshot().await.unwrap().meeting.queue;
        let last = *lightning.last().unwrap();

        for member in &lightning {
            h.handle.start_timer(h.ctx(), *member).await.unwrap();
            let extras = TurnExtras {
                priority: Some(if *member == last {
                    PriorityTier::P1
                } else {
                    PriorityTier::P2
                }),
                ..TurnExtras::default()
            };
            h.handle
                .complete_turn(h.ctx(), *member, extras, None)
                .await
                .unwrap();
        }

        h.advance_to(Phase::FullCheckins).await;
        let queue = h.handle.snapshot().await.unwrap().meeting.queue;
        assert_eq!(queue.first(), Some(&last));
        assert_eq!(queue.get(1..), lightning.get(..2));
    }

    #[tokio::test]
    async fn test_priority_frozen_after_lightning_round() {
        let h = harness(&[None]).await;
        h.advance_to(Phase::FullCheckins).await;
        let member = *h.members.first().unwrap();

        let err = h
            .handle
            .set_priority(h.ctx(), member, PriorityTier::P1)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_ditch_releases_reserved_time() {
        let h = harness(&[None, None]).await;
        h.advance_to(Phase::FullCheckins).await;

        let before = h.handle.allotment().await.unwrap();
        let after = h.handle.ditch_curriculum(h.ctx()).await.unwrap();

        assert_eq!(after.available_seconds - before.available_seconds, 1800);
        assert!(after.per_person_seconds > before.per_person_seconds);

        let again = h.handle.ditch_curriculum(h.ctx()).await.unwrap_err();
        assert!(matches!(again, RunnerError::InvalidTransition(_)));

        let meeting = h
            .handle
            .advance_phase(h.ctx(), Phase::FullCheckins, Phase::Closing)
            .await
            .unwrap();
        assert_eq!(meeting.phase, Phase::Closing);
    }

    #[tokio::test]
    async fn test_exhausted_budget_offers_recovery() {
        let h = harness(&[None, None]).await;
        h.advance_to(Phase::FullCheckins).await;
        // 120 minute meeting; leave 20 minutes, less than the curriculum reserve.
        h.clock.advance(Duration::from_secs(100 * 60));

        let allotment = h.handle.allotment().await.unwrap();
        assert!(allotment.exhausted);
        assert_eq!(allotment.per_person_seconds, 60);
        assert_eq!(
            allotment.recovery_actions,
            vec![
                allocator::RecoveryAction::ExtendMeeting,
                allocator::RecoveryAction::DitchCurriculum
            ]
        );

        let extended = h.handle.add_meeting_time(h.ctx(), 30).await.unwrap();
        assert!(!extended.exhausted);
        assert_eq!(extended.available_seconds, 20 * 60);
    }

    #[tokio::test]
    async fn test_replace_stretch_goal() {
        let h = harness(&[None]).await;
        let member = *h.members.first().unwrap();
        let now = h.clock.now();
        h.store
            .seed_stretch_goal(StretchGoal {
                id: StretchGoalId::new(),
                owner_id: member,
                description: "Run a 10k".to_string(),
                status: StretchGoalStatus::Active,
                created_at: now,
                updated_at: now,
            })
            .await;
        // The runner loaded before the goal was seeded; start a fresh one.
        let context = RunnerContext {
            store: Arc::new(h.store.clone()),
            clock: Arc::new(h.clock.clone()),
            settings: RunnerSettings::default(),
            metrics: ActorMetrics::new(),
        };
        let (handle, _task) =
            MeetingRunner::spawn(h.meeting_id, context, CancellationToken::new())
                .await
                .unwrap();
        let h = Harness { handle, ..h };
        h.advance_to(Phase::FullCheckins).await;

        h.handle.start_timer(h.ctx(), member).await.unwrap();
        let extras = TurnExtras {
            stretch_goal_action: Some(StretchGoalAction::Replaced {
                description: "Run a half marathon".to_string(),
            }),
            ..TurnExtras::default()
        };
        h.handle
            .complete_turn(h.ctx(), member, extras, None)
            .await
            .unwrap();

        let goals = h.store.list_stretch_goals(h.meeting_id).await.unwrap();
        assert_eq!(goals.len(), 2);
        assert!(goals
            .iter()
            .any(|g| g.description == "Run a 10k" && g.status == StretchGoalStatus::Replaced));
        assert!(goals
            .iter()
            .any(|g| g.description == "Run a half marathon" && g.status == StretchGoalStatus::Active));
    }

    #[tokio::test]
    async fn test_lost_compare_and_set_refreshes() {
        let h = harness(&[None]).await;
        let mut stream = h.handle.subscribe(&[AggregateKind::Meeting]);
        let meeting = h.store.read_meeting(h.meeting_id).await.unwrap();
        h.store
            .commit(CommitBatch::for_meeting(meeting))
            .await
            .unwrap();

        let err = h
            .handle
            .advance_phase(h.ctx(), Phase::NotStarted, Phase::OpeningMeditation)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RunnerError::StaleState(StaleReason::VersionMismatch {
                expected: 0,
                actual: 1
            })
        ));

        let item = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        let StreamItem::Event(event) = item else {
            panic!("expected the reloaded meeting");
        };
        assert_eq!(event.version, 1);
        assert!(matches!(&event.payload, ChangePayload::Meeting(m) if m.version == 1));

        let meeting = h
            .handle
            .advance_phase(h.ctx(), Phase::NotStarted, Phase::OpeningMeditation)
            .await
            .unwrap();
        assert_eq!(meeting.version, 2);
    }

    #[tokio::test]
    async fn test_feedback_only_in_closing_with_valid_rating() {
        let h = harness(&[None]).await;
        let member = *h.members.first().unwrap();

        let early = h
            .handle
            .record_feedback(h.ctx(), member, 8, None)
            .await
            .unwrap_err();
        assert!(matches!(early, RunnerError::InvalidTransition(_)));

        h.handle.ditch_curriculum(h.ctx()).await.unwrap();
        h.advance_to(Phase::Closing).await;

        let out_of_range = h
            .handle
            .record_feedback(h.ctx(), member, 11, None)
            .await
            .unwrap_err();
        assert!(matches!(out_of_range, RunnerError::InvalidTransition(_)));

        let first = h
            .handle
            .record_feedback(h.ctx(), member, 7, Some("  ".to_string()))
            .await
            .unwrap();
        assert_eq!(first.comment, None);
        let second = h
            .handle
            .record_feedback(h.ctx(), member, 9, Some("Great night".to_string()))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);

        let summary = h.handle.complete_meeting(h.ctx()).await.unwrap();
        assert_eq!(summary.phase, Phase::Ended);
        assert_eq!(summary.feedback_count, 1);
        assert_eq!(summary.average_rating, Some(9.0));
    }

    #[tokio::test]
    async fn test_events_carry_mutation_id_and_version() {
        let h = harness(&[None]).await;
        let mut stream = h.handle.subscribe(&[]);
        let ctx = h.ctx();

        h.handle
            .advance_phase(ctx, Phase::NotStarted, Phase::OpeningMeditation)
            .await
            .unwrap();

        let Some(StreamItem::Event(first)) = stream.next().await else {
            panic!("expected an event");
        };
        assert_eq!(first.mutation_id, ctx.mutation_id);
        assert_eq!(first.version, 1);
        assert!(matches!(first.payload, ChangePayload::Meeting(_)));

        let Some(StreamItem::Event(second)) = stream.next().await else {
            panic!("expected an event");
        };
        assert!(matches!(second.payload, ChangePayload::TurnLogs(_)));
    }

    #[tokio::test]
    async fn test_cancelled_runner_reports_draining() {
        let h = harness(&[None]).await;
        h.handle.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = h.handle.snapshot().await.unwrap_err();
        assert!(matches!(err, RunnerError::Draining));
    }
}
