//! Engine event channel.
//!
//! Observers (a dashboard, a logger, tests) subscribe to a broadcast channel.
//! The engine publishes and moves on; it never waits for anyone to listen.

use std::net::SocketAddr;

use egress_core::StatsSnapshot;
use serde::Serialize;
use tokio::sync::broadcast;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something observers may want to know about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// The reactor is accepting connections.
    Started { addr: SocketAddr },
    /// A new blacklist snapshot is live.
    BlacklistReloaded {
        patterns: usize,
        revision: Option<u64>,
    },
    /// The store could not be read; the previous snapshot stays live.
    BlacklistReloadFailed { error: String },
    /// Periodic status from the reactor tick.
    Heartbeat {
        stats: Option<StatsSnapshot>,
        active_sessions: usize,
        cache_entries: usize,
    },
    /// Shutdown was requested; no new connections are accepted.
    ShuttingDown { active_sessions: usize },
    /// The reactor has exited.
    Stopped,
}

/// Cloneable publisher for [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus that buffers up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publishes an event. Having no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::Stopped);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::BlacklistReloaded {
            patterns: 3,
            revision: Some(9),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            EngineEvent::BlacklistReloaded {
                patterns: 3,
                revision: Some(9)
            }
        );
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(EngineEvent::ShuttingDown { active_sessions: 2 }).unwrap();
        assert_eq!(json["event"], "shutting_down");
        assert_eq!(json["active_sessions"], 2);
    }
}
