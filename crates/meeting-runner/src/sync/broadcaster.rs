//! Per-meeting change feed.
//!
//! Each meeting owns one bounded `tokio::sync::broadcast` channel. A slow
//! subscriber that falls behind the buffer sees [`StreamItem::Lagged`] and
//! must resynchronize from a full snapshot.

use crate::observability::metrics;
use crate::sync::events::{AggregateKind, ChangeEvent};
use common::types::MeetingId;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fan-out point for one meeting's change events.
#[derive(Debug, Clone)]
pub struct SyncBroadcaster {
    meeting_id: MeetingId,
    sender: broadcast::Sender<Arc<ChangeEvent>>,
    cancel_token: CancellationToken,
}

impl SyncBroadcaster {
    /// Create a feed buffering up to `capacity` events per subscriber.
    ///
    /// Streams end when `cancel_token` is cancelled.
    #[must_use]
    pub fn new(meeting_id: MeetingId, capacity: usize, cancel_token: CancellationToken) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            meeting_id,
            sender,
            cancel_token,
        }
    }

    /// Publish events from one committed write, in order.
    pub fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            // No receivers is not an error; nobody is watching yet.
            if self.sender.send(Arc::new(event)).is_err() {
                debug!(
                    target: "runner.sync",
                    meeting_id = %self.meeting_id,
                    "No subscribers for change event"
                );
            }
        }
    }

    /// Open a stream filtered to `kinds`. An empty filter means everything.
    #[must_use]
    pub fn subscribe(&self, kinds: &[AggregateKind]) -> ChangeStream {
        let kinds = if kinds.is_empty() {
            AggregateKind::ALL.to_vec()
        } else {
            kinds.to_vec()
        };
        metrics::subscriber_opened();
        debug!(
            target: "runner.sync",
            meeting_id = %self.meeting_id,
            ?kinds,
            "Subscriber attached"
        );
        ChangeStream {
            meeting_id: self.meeting_id,
            receiver: self.sender.subscribe(),
            kinds,
            cancel_token: self.cancel_token.child_token(),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Item yielded by [`ChangeStream::next`].
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(Arc<ChangeEvent>),
    /// Events were dropped; the view is no longer trustworthy.
    Lagged(u64),
}

/// A filtered subscription to one meeting's change feed.
#[derive(Debug)]
pub struct ChangeStream {
    meeting_id: MeetingId,
    receiver: broadcast::Receiver<Arc<ChangeEvent>>,
    kinds: Vec<AggregateKind>,
    cancel_token: CancellationToken,
}

impl ChangeStream {
    /// Wait for the next matching item. `None` once the meeting closes or
    /// the stream is cancelled.
    pub async fn next(&mut self) -> Option<StreamItem> {
        loop {
            let received = tokio::select! {
                () = self.cancel_token.cancelled() => return None,
                received = self.receiver.recv() => received,
            };

            match received {
                Ok(event) if event.matches(&self.kinds) => return Some(StreamItem::Event(event)),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        target: "runner.sync",
                        meeting_id = %self.meeting_id,
                        skipped,
                        "Subscriber lagged, resync required"
                    );
                    return Some(StreamItem::Lagged(skipped));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Stop this stream without affecting other subscribers.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Token that ends this stream when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        metrics::subscriber_closed();
    }
}
