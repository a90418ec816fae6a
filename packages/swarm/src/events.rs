//! Externally observable output of the orchestration core.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The stage field reached its terminal value.
    Finished,
    /// The subscribed root disappeared.
    Vanished,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwarmEvent {
    /// First snapshot of a session, carrying its assigned category.
    SessionStarted {
        category: Option<String>,
        variant: Option<String>,
    },
    Changed {
        participant: String,
        field: String,
        value: Value,
    },
    /// Decoded text of a participant's message field.
    Message { participant: String, text: String },
    StageChanged {
        from: Option<String>,
        to: Option<String>,
    },
    ParticipantsChanged { participants: Vec<String> },
    Blocked { names: Vec<String> },
    SessionEnded { reason: EndReason },
}

/// Fan-out of [`SwarmEvent`]s. Subscribing registers a receiver; dropping it
/// unregisters.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SwarmEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SwarmEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
