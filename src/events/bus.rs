//! Event bus for pub/sub run observation
//!
//! Broadcasts the lifecycle of every run (start, output chunks, end,
//! error) to observers like progress bars and audit loggers. Engine
//! correctness never depends on a handler seeing an event.

use bytes::Bytes;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::ExecResult;
use crate::error::ErrorKind;

/// Events published for each run
#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A run was dispatched to an adapter
    Started {
        id: Uuid,
        target: String,
        command: String,
    },

    /// A chunk arrived on the run's stdout
    Stdout { id: Uuid, chunk: Bytes },

    /// A chunk arrived on the run's stderr
    Stderr { id: Uuid, chunk: Bytes },

    /// The run finished with a result
    Completed { id: Uuid, result: ExecResult },

    /// The run failed with an engine error
    Failed {
        id: Uuid,
        kind: ErrorKind,
        message: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            RunEvent::Started { id, .. }
            | RunEvent::Stdout { id, .. }
            | RunEvent::Stderr { id, .. }
            | RunEvent::Completed { id, .. }
            | RunEvent::Failed { id, .. } => *id,
        }
    }
}

/// Event bus for broadcasting run events to multiple subscribers
///
/// Uses tokio broadcast channels. Subscribers that fall behind will lose
/// messages (lagged); within one subscription, events for a single run
/// arrive in order: `Started` first, then chunks, then exactly one of
/// `Completed`/`Failed`.
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
    // Keep a receiver to prevent the channel from closing
    _receiver: broadcast::Receiver<RunEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity (4096 events).
    /// Sized to absorb output bursts without lagging subscribers.
    pub fn new() -> Self {
        Self::with_capacity(4096)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender, _receiver }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers. Returns the receiver count;
    /// zero subscribers is not an error.
    pub fn publish(&self, event: RunEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_pubsub() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let id = Uuid::new_v4();
        bus.publish(RunEvent::Started {
            id,
            target: "local".to_string(),
            command: "echo hello".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.run_id(), id);
        assert!(matches!(event, RunEvent::Started { .. }));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let id = Uuid::new_v4();
        bus.publish(RunEvent::Stdout {
            id,
            chunk: Bytes::from_static(b"hi"),
        });

        assert!(matches!(rx1.recv().await.unwrap(), RunEvent::Stdout { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), RunEvent::Stdout { .. }));
    }

    #[tokio::test]
    async fn test_chunk_order_preserved() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let id = Uuid::new_v4();
        for chunk in [&b"a"[..], b"b", b"c"] {
            bus.publish(RunEvent::Stdout {
                id,
                chunk: Bytes::copy_from_slice(chunk),
            });
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            if let RunEvent::Stdout { chunk, .. } = rx.recv().await.unwrap() {
                seen.extend_from_slice(&chunk);
            }
        }
        assert_eq!(seen, b"abc");
    }

    #[test]
    fn test_subscriber_count() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        let _rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
