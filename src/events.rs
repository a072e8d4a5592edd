//! Decoupled event bus for session lifecycle notifications.
//!
//! The [`Session`](crate::session::Session) emits events via
//! [`EventBus::emit`]; the CLI and tests subscribe via
//! [`EventBus::subscribe`]. Built on [`tokio::sync::broadcast`] so
//! multiple listeners can react independently.

use tokio::sync::broadcast;

use crate::session::SessionState;

/// Events that flow through the system.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The session moved to a new lifecycle state.
    StateChanged { state: SessionState },
    /// A generation finished; carries its final throughput figures.
    GenerationFinished { num_tokens: u64, tps: f64 },
}

/// A broadcast channel that any component can emit to or subscribe from.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Emit an event to all current subscribers.
    /// Returns the number of receivers that will see it.
    pub fn emit(&self, event: Event) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// Subscribe to events. Returns a receiver that yields all
    /// future events (does not replay past ones).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
