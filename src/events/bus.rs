//! # Broadcast bus for lifecycle events.
//!
//! Nodes, the process tree, client handlers and the supervisor all publish
//! into one [`Bus`]; the supervisor's forwarder is normally its only reader.
//!
//! ```text
//!   Node::run ───────────────┐
//!   ProcessTree (restarts) ──┤
//!   ClientHandler ───────────┼──► Bus ──► forwarder ──► SubscriberSet
//!   Supervisor (shutdown) ───┤
//!   SubscriberSet workers ───┘   (overflow / panic reports)
//! ```
//!
//! ## Rules
//! - `publish` never waits and never fails; with no reader the event is gone.
//! - One ring buffer of `Config::bus_capacity` events serves every reader;
//!   a reader that falls behind sees `RecvError::Lagged(n)` and loses `n` events.

use tokio::sync::broadcast;

use super::event::Event;

/// Cloneable handle to the event broadcast channel.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a bus retaining up to `capacity` unread events (at least 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Sends `ev` to every current reader.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Opens a reader that sees events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;

    #[tokio::test]
    async fn readers_only_see_later_events() {
        let bus = Bus::new(4);
        bus.publish(Event::new(EventKind::NodeReady).with_node("lost"));
        let mut rx = bus.subscribe();
        bus.publish(Event::new(EventKind::NodeReady).with_node("seen"));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.node.as_deref(), Some("seen"));
    }

    #[tokio::test]
    async fn slow_reader_lags() {
        let bus = Bus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..4 {
            bus.publish(Event::new(EventKind::FilesChanged));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
    }
}
