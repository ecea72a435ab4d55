//! Change propagation and client reconciliation.
//!
//! The runner publishes a [`ChangeEvent`] per affected aggregate after every
//! committed write. Observers hold an [`ObserverView`] and apply those events
//! idempotently, falling back to a full snapshot when the feed lags or
//! reconnects.

pub mod broadcaster;
pub mod events;
pub mod observer;

pub use broadcaster::{ChangeStream, StreamItem, SyncBroadcaster};
pub use events::{AggregateKind, ChangeEvent, ChangePayload};
pub use observer::{ApplyOutcome, AuthorityStatus, AuthorityView, ObserverView};
