//! Meeting Runner Service Library
//!
//! Coordinates a live peer-support meeting: a fixed sequence of phases, a
//! single running turn timer, per-person time budgets, and exactly one scribe
//! who may change anything. Every other participant observes.
//!
//! # Architecture
//!
//! ```text
//! RunnerControllerActor (singleton)
//! └── MeetingRunner (one per live meeting)
//!     ├── PhaseStateMachine   (phase)
//!     ├── TurnTimer           (timer)
//!     ├── QueueAllocator      (allocator)
//!     ├── ScribeAuthority     (authority)
//!     └── SyncBroadcaster     (sync) ──> observers
//! ```
//!
//! Trusted time comes from a [`clock::Clock`], never from callers. All writes
//! go through one version-guarded [`store::CommitBatch`], so a second writer
//! loses the compare-and-set instead of silently overwriting.
//!
//! # Modules
//!
//! - [`actors`] - Controller and per-meeting runner actors
//! - [`allocator`] - Turn queues and per-person budgets
//! - [`authority`] - Scribe checks and hand-off
//! - [`clock`] - Trusted time source
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client error codes
//! - [`model`] - Meeting records
//! - [`observability`] - Metrics and health endpoints
//! - [`phase`] - Phase state machine
//! - [`store`] - Persistence collaborator and adapters
//! - [`sync`] - Change feed and observer views
//! - [`timer`] - Turn timer arithmetic

pub mod actors;
pub mod allocator;
pub mod authority;
pub mod clock;
pub mod config;
pub mod errors;
pub mod model;
pub mod observability;
pub mod phase;
pub mod store;
pub mod sync;
pub mod timer;
