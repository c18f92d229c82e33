//! Change events handed to the watch subsystem

use crate::record::{Record, Revision};
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Kind of mutation an event describes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// A committed mutation
///
/// For deletes the record carries the removed value with the deletion's
/// revision as its mod revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub record: Record,
}

impl Event {
    pub fn new(kind: EventKind, record: Record) -> Self {
        Self { kind, record }
    }

    /// Revision at which the mutation committed
    pub fn revision(&self) -> Revision {
        self.record.mod_revision()
    }
}

/// Consumer of committed mutations
///
/// Emission happens after the write is durable; a sink cannot fail the
/// mutation that produced the event. When the medium fails to acknowledge a
/// head flip the backend re-reads the head and emits if the flip landed; if
/// that read fails too the mutation returns an error and no event is sent,
/// even though the record may have changed.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// Sink that drops every event
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl EventSink for NoopSink {
    async fn emit(&self, _event: Event) {}
}

/// Sink fanning events out over a tokio broadcast channel
#[derive(Clone, Debug)]
pub struct BroadcastSink {
    sender: broadcast::Sender<Event>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl EventSink for BroadcastSink {
    async fn emit(&self, event: Event) {
        // No subscribers is not an error
        if self.sender.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }
}
