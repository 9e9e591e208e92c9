//! src/events.rs
//!
//! The Event Emitter (spec §4.7): a local fan-out of `{node_join, node_leave,
//! nodeup, nodedown}` events, published to the `membership_events` topic.
//! There is no persistence or replay — subscribers that aren't listening at
//! emit time simply miss it, matching `tokio::sync::broadcast` semantics.

use crate::domain::NodeId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    NodeJoin,
    NodeLeave,
    NodeUp,
    NodeDown,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub node_id: NodeId,
}

/// Wraps a single `broadcast` channel shared by every component that needs
/// to publish or observe membership events, mirroring the teacher's habit
/// of handing out a cloned `Sender`/`Receiver` pair from `app.rs` rather
/// than threading individual channels through every constructor.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn emit(&self, kind: EventKind, node_id: NodeId) {
        tracing::debug!(?kind, %node_id, "membership event");
        let _ = self.sender.send(Event { kind, node_id });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(EventKind::NodeJoin, NodeId::new("n1"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::NodeJoin);
        assert_eq!(event.node_id, NodeId::new("n1"));
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive_the_same_event() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(EventKind::NodeDown, NodeId::new("n2"));
        assert_eq!(a.recv().await.unwrap().node_id, NodeId::new("n2"));
        assert_eq!(b.recv().await.unwrap().node_id, NodeId::new("n2"));
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.emit(EventKind::NodeUp, NodeId::new("n3"));
    }
}
