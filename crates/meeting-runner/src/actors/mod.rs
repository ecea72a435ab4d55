//! Actor model for the Meeting Runner.
//!
//! ```text
//! RunnerControllerActor (singleton per process)
//! └── supervises N MeetingRunners
//!     └── MeetingRunner (one per live meeting)
//!         ├── owns the cached authoritative meeting state
//!         ├── is the only writer to the store for its meeting
//!         └── publishes committed changes on its SyncBroadcaster
//! ```
//!
//! Each actor owns its state and is reached through a cloneable handle that
//! sends messages over an `mpsc` channel. Cancellation flows down a tree of
//! `CancellationToken`s rooted at the controller.

pub mod controller;
pub mod meeting;
pub mod messages;
pub mod metrics;

pub use controller::RunnerControllerHandle;
pub use meeting::{MeetingRunner, MeetingRunnerHandle, RunnerContext, RunnerSettings};
pub use messages::{ControllerStatus, MeetingSummary, MutationContext, RecordingUpload};
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
