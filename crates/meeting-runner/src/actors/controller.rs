//! `RunnerControllerActor` - singleton supervisor for meeting runners.
//!
//! The controller is the top-level actor in the runner hierarchy:
//!
//! - Singleton per runner process
//! - Supervises N `MeetingRunner` instances, one per live meeting
//! - Opens a runner on first use and hands out clones of its handle
//! - Owns the root `CancellationToken` for graceful shutdown
//! - Monitors child actor health (panic detection via `JoinHandle`)
//!
//! # Graceful Shutdown
//!
//! On SIGTERM, the controller:
//! 1. Sets `accepting_new = false`
//! 2. Cancels the root `CancellationToken` (propagates to all children)
//! 3. Waits for runners to drain, each bounded by the shutdown deadline

use super::meeting::{MeetingRunner, MeetingRunnerHandle, RunnerContext};
use super::messages::{ControllerMessage, ControllerStatus};
use super::metrics::{ActorType, MailboxMonitor};
use crate::errors::{NotFoundKind, RunnerError};
use crate::observability::HealthState;

use common::types::MeetingId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 1000;

/// How long a removed runner gets to finish before we stop waiting.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Drain bound when the root token is cancelled without a `Shutdown` request.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle to the `RunnerControllerActor`.
///
/// This is the public interface for interacting with the controller.
#[derive(Clone)]
pub struct RunnerControllerHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
}

impl RunnerControllerHandle {
    /// Spawn the controller and return a handle to it.
    ///
    /// # Arguments
    ///
    /// * `runner_id` - Runner instance ID
    /// * `context` - Store, clock, settings and metrics shared by every runner
    /// * `max_meetings` - Cap on concurrently open meetings
    /// * `health` - Readiness state updated with the meeting count
    #[must_use]
    pub fn new(
        runner_id: String,
        context: RunnerContext,
        max_meetings: usize,
        health: Arc<HealthState>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = RunnerControllerActor::new(
            runner_id,
            receiver,
            cancel_token.clone(),
            context,
            max_meetings,
            health,
        );

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Open the meeting's runner, or return the one already running.
    pub async fn open_meeting(
        &self,
        meeting_id: MeetingId,
    ) -> Result<MeetingRunnerHandle, RunnerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::OpenMeeting {
                meeting_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RunnerError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RunnerError::Internal(format!("response receive failed: {e}")))?
    }

    /// Handle to an already open meeting.
    pub async fn get_meeting(
        &self,
        meeting_id: MeetingId,
    ) -> Result<MeetingRunnerHandle, RunnerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetMeeting {
                meeting_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RunnerError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RunnerError::Internal(format!("response receive failed: {e}")))?
    }

    /// Stop a meeting's runner. Its state stays in the store.
    pub async fn remove_meeting(&self, meeting_id: MeetingId) -> Result<(), RunnerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::RemoveMeeting {
                meeting_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| RunnerError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RunnerError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn get_status(&self) -> Result<ControllerStatus, RunnerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| RunnerError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RunnerError::Internal(format!("response receive failed: {e}")))
    }

    /// Initiate graceful shutdown.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), RunnerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| RunnerError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| RunnerError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Child token tied to the controller's lifetime.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// A runner the controller is supervising.
struct ManagedMeeting {
    handle: MeetingRunnerHandle,
    task_handle: JoinHandle<()>,
    opened_at: chrono::DateTime<chrono::Utc>,
}

/// The `RunnerControllerActor` implementation.
pub struct RunnerControllerActor {
    runner_id: String,
    receiver: mpsc::Receiver<ControllerMessage>,
    /// Root token.
    cancel_token: CancellationToken,
    meetings: HashMap<MeetingId, ManagedMeeting>,
    accepting_new: bool,
    max_meetings: usize,
    drain_timeout: Duration,
    context: RunnerContext,
    health: Arc<HealthState>,
    mailbox: MailboxMonitor,
}

impl RunnerControllerActor {
    fn new(
        runner_id: String,
        receiver: mpsc::Receiver<ControllerMessage>,
        cancel_token: CancellationToken,
        context: RunnerContext,
        max_meetings: usize,
        health: Arc<HealthState>,
    ) -> Self {
        let mailbox = MailboxMonitor::new(ActorType::Controller, runner_id.as_str());

        Self {
            runner_id,
            receiver,
            cancel_token,
            meetings: HashMap::new(),
            accepting_new: true,
            max_meetings,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            context,
            health,
            mailbox,
        }
    }

    #[instrument(skip_all, name = "runner.actor.controller", fields(runner_id = %self.runner_id))]
    async fn run(mut self) {
        info!(
            target: "runner.actor.controller",
            runner_id = %self.runner_id,
            max_meetings = self.max_meetings,
            "RunnerControllerActor started"
        );

        loop {
            self.check_meeting_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "runner.actor.controller",
                        runner_id = %self.runner_id,
                        "RunnerControllerActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
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
                                target: "runner.actor.controller",
                                runner_id = %self.runner_id,
                                "RunnerControllerActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "runner.actor.controller",
            runner_id = %self.runner_id,
            meetings_remaining = self.meetings.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RunnerControllerActor stopped"
        );
    }

    async fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::OpenMeeting {
                meeting_id,
                respond_to,
            } => {
                let result = self.open_meeting(meeting_id).await;
                let _ = respond_to.send(result);
            }

            ControllerMessage::GetMeeting {
                meeting_id,
                respond_to,
            } => {
                let result = self
                    .meetings
                    .get(&meeting_id)
                    .map(|managed| managed.handle.clone())
                    .ok_or(RunnerError::NotFound(NotFoundKind::Meeting));
                let _ = respond_to.send(result);
            }

            ControllerMessage::RemoveMeeting {
                meeting_id,
                respond_to,
            } => {
                let result = self.remove_meeting(meeting_id);
                let _ = respond_to.send(result);
            }

            ControllerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            ControllerMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                self.initiate_shutdown(deadline);
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    async fn open_meeting(
        &mut self,
        meeting_id: MeetingId,
    ) -> Result<MeetingRunnerHandle, RunnerError> {
        if !self.accepting_new {
            return Err(RunnerError::Draining);
        }

        if let Some(managed) = self.meetings.get(&meeting_id) {
            if !managed.task_handle.is_finished() {
                return Ok(managed.handle.clone());
            }
        }

        if self.meetings.len() >= self.max_meetings {
            warn!(
                target: "runner.actor.controller",
                runner_id = %self.runner_id,
                max_meetings = self.max_meetings,
                "Meeting capacity reached"
            );
            return Err(RunnerError::Internal("meeting capacity reached".to_string()));
        }

        debug!(
            target: "runner.actor.controller",
            runner_id = %self.runner_id,
            meeting_id = %meeting_id,
            "Opening meeting runner"
        );

        let (handle, task_handle) = MeetingRunner::spawn(
            meeting_id,
            self.context.clone(),
            self.cancel_token.child_token(),
        )
        .await?;

        self.meetings.insert(
            meeting_id,
            ManagedMeeting {
                handle: handle.clone(),
                task_handle,
                opened_at: chrono::Utc::now(),
            },
        );
        self.context.metrics.meeting_opened();
        self.health.set_meetings(self.meetings.len());

        info!(
            target: "runner.actor.controller",
            runner_id = %self.runner_id,
            meeting_id = %meeting_id,
            total_meetings = self.meetings.len(),
            "Meeting runner opened"
        );

        Ok(handle)
    }

    /// Cancel the runner without blocking the message loop on its exit.
    fn remove_meeting(&mut self, meeting_id: MeetingId) -> Result<(), RunnerError> {
        let ManagedMeeting {
            handle,
            task_handle,
            opened_at,
        } = self
            .meetings
            .remove(&meeting_id)
            .ok_or(RunnerError::NotFound(NotFoundKind::Meeting))?;

        handle.cancel();

        let runner_id = self.runner_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(REMOVE_TIMEOUT, task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "runner.actor.controller",
                        runner_id = %runner_id,
                        meeting_id = %meeting_id,
                        "Meeting runner task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "runner.actor.controller",
                        runner_id = %runner_id,
                        meeting_id = %meeting_id,
                        error = ?e,
                        "Meeting runner task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "runner.actor.controller",
                        runner_id = %runner_id,
                        meeting_id = %meeting_id,
                        "Meeting runner task cleanup timed out"
                    );
                }
            }
        });

        self.context.metrics.meeting_closed();
        self.health.set_meetings(self.meetings.len());

        info!(
            target: "runner.actor.controller",
            runner_id = %self.runner_id,
            meeting_id = %meeting_id,
            open_for_secs = (chrono::Utc::now() - opened_at).num_seconds(),
            total_meetings = self.meetings.len(),
            "Meeting runner removed"
        );

        Ok(())
    }

    fn get_status(&self) -> ControllerStatus {
        ControllerStatus {
            meeting_count: self.meetings.len(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    fn initiate_shutdown(&mut self, deadline: Duration) {
        info!(
            target: "runner.actor.controller",
            runner_id = %self.runner_id,
            meeting_count = self.meetings.len(),
            deadline_secs = deadline.as_secs(),
            "Initiating graceful shutdown"
        );

        self.accepting_new = false;
        self.drain_timeout = deadline;
        self.health.set_draining();
        self.cancel_token.cancel();
    }

    async fn graceful_shutdown(&mut self) {
        info!(
            target: "runner.actor.controller",
            runner_id = %self.runner_id,
            meeting_count = self.meetings.len(),
            "Performing graceful shutdown"
        );

        self.accepting_new = false;
        self.health.set_draining();

        // Already cancelled through the parent token; be explicit.
        for (meeting_id, managed) in &self.meetings {
            debug!(
                target: "runner.actor.controller",
                runner_id = %self.runner_id,
                meeting_id = %meeting_id,
                "Cancelling meeting runner"
            );
            managed.handle.cancel();
        }

        let meetings: Vec<(MeetingId, ManagedMeeting)> = self.meetings.drain().collect();
        for (meeting_id, managed) in meetings {
            match tokio::time::timeout(self.drain_timeout, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "runner.actor.controller",
                        runner_id = %self.runner_id,
                        meeting_id = %meeting_id,
                        "Meeting runner completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "runner.actor.controller",
                        runner_id = %self.runner_id,
                        meeting_id = %meeting_id,
                        error = ?e,
                        "Meeting runner task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "runner.actor.controller",
                        runner_id = %self.runner_id,
                        meeting_id = %meeting_id,
                        "Meeting runner shutdown timed out"
                    );
                }
            }
            self.context.metrics.meeting_closed();
        }
        self.health.set_meetings(0);

        info!(
            target: "runner.actor.controller",
            runner_id = %self.runner_id,
            "Graceful shutdown complete"
        );
    }

    /// Forget runners whose task has exited.
    async fn check_meeting_health(&mut self) {
        let finished: Vec<MeetingId> = self
            .meetings
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(meeting_id, _)| *meeting_id)
            .collect();

        for meeting_id in finished {
            let Some(managed) = self.meetings.remove(&meeting_id) else {
                continue;
            };
            warn!(
                target: "runner.actor.controller",
                runner_id = %self.runner_id,
                meeting_id = %meeting_id,
                "Meeting runner task finished unexpectedly"
            );

            match managed.task_handle.await {
                Ok(()) => {
                    info!(
                        target: "runner.actor.controller",
                        runner_id = %self.runner_id,
                        meeting_id = %meeting_id,
                        "Meeting runner exited cleanly"
                    );
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(
                        target: "runner.actor.controller",
                        runner_id = %self.runner_id,
                        meeting_id = %meeting_id,
                        error = ?join_error,
                        "Meeting runner panicked"
                    );
                    self.context.metrics.record_panic(ActorType::Meeting);
                }
                Err(_) => {}
            }

            self.context.metrics.meeting_closed();
            self.health.set_meetings(self.meetings.len());
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::meeting::RunnerSettings;
    use crate::actors::metrics::ActorMetrics;
    use crate::clock::ManualClock;
    use crate::model::Meeting;
    use crate::store::memory::InMemoryStore;
    use crate::store::MeetingStore;
    use chrono::Utc;
    use common::types::UserId;

    fn controller(max_meetings: usize) -> (RunnerControllerHandle, InMemoryStore) {
        let store = InMemoryStore::new();
        let context = RunnerContext {
            store: Arc::new(store.clone()),
            clock: Arc::new(ManualClock::new(Utc::now())),
            settings: RunnerSettings::default(),
            metrics: ActorMetrics::new(),
        };
        let handle = RunnerControllerHandle::new(
            "runner-test".to_string(),
            context,
            max_meetings,
            Arc::new(HealthState::new()),
        );
        (handle, store)
    }

    async fn scheduled(store: &InMemoryStore) -> MeetingId {
        let meeting = Meeting::scheduled(MeetingId::new(), UserId::new(), Utc::now(), 90);
        store
            .create_meeting(meeting.clone(), Vec::new())
            .await
            .unwrap();
        meeting.id
    }

    #[tokio::test]
    async fn test_controller_open_meeting() {
        let (handle, store) = controller(10);
        let meeting_id = scheduled(&store).await;

        let runner = handle.open_meeting(meeting_id).await.unwrap();
        assert_eq!(runner.meeting_id(), meeting_id);

        let fetched = handle.get_meeting(meeting_id).await.unwrap();
        assert_eq!(fetched.meeting_id(), meeting_id);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_controller_open_is_idempotent() {
        let (handle, store) = controller(10);
        let meeting_id = scheduled(&store).await;

        let first = handle.open_meeting(meeting_id).await.unwrap();
        let _stream = first.subscribe(&[]);
        let second = handle.open_meeting(meeting_id).await.unwrap();

        // Same runner, so the same feed.
        assert_eq!(second.subscriber_count(), 1);
        assert_eq!(handle.get_status().await.unwrap().meeting_count, 1);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_controller_open_unknown_meeting() {
        let (handle, _store) = controller(10);

        let result = handle.open_meeting(MeetingId::new()).await;
        assert!(matches!(
            result,
            Err(RunnerError::NotFound(NotFoundKind::Meeting))
        ));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_controller_get_nonexistent_meeting() {
        let (handle, _store) = controller(10);

        let result = handle.get_meeting(MeetingId::new()).await;
        assert!(matches!(
            result,
            Err(RunnerError::NotFound(NotFoundKind::Meeting))
        ));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_controller_remove_meeting() {
        let (handle, store) = controller(10);
        let meeting_id = scheduled(&store).await;

        let runner = handle.open_meeting(meeting_id).await.unwrap();
        handle.remove_meeting(meeting_id).await.unwrap();
        assert!(runner.is_cancelled());

        let result = handle.get_meeting(meeting_id).await;
        assert!(matches!(
            result,
            Err(RunnerError::NotFound(NotFoundKind::Meeting))
        ));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_controller_capacity() {
        let (handle, store) = controller(1);
        let first = scheduled(&store).await;
        let second = scheduled(&store).await;

        handle.open_meeting(first).await.unwrap();
        let result = handle.open_meeting(second).await;
        assert!(matches!(result, Err(RunnerError::Internal(_))));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_controller_status() {
        let (handle, store) = controller(10);

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.meeting_count, 0);
        assert!(!status.is_draining);

        for _ in 0..2 {
            let meeting_id = scheduled(&store).await;
            handle.open_meeting(meeting_id).await.unwrap();
        }

        let status = handle.get_status().await.unwrap();
        assert_eq!(status.meeting_count, 2);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_controller_shutdown_cancels_runners() {
        let (handle, store) = controller(10);
        let meeting_id = scheduled(&store).await;
        let runner = handle.open_meeting(meeting_id).await.unwrap();

        handle.shutdown(Duration::from_secs(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.is_cancelled());
        assert!(runner.is_cancelled());
    }

    #[tokio::test]
    async fn test_controller_cancellation_token() {
        let (handle, _store) = controller(10);

        assert!(!handle.is_cancelled());
        let child = handle.child_token();
        assert!(!child.is_cancelled());

        handle.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.is_cancelled());
        assert!(child.is_cancelled());
    }
}
