use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events flowing between the daemon and its subscribers. The overlay
/// modules of earlier designs talked to each other through a shared
/// broadcast file; this bus is the flattened replacement — publishers and
/// subscribers are decoupled by name, with no direct references to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PulseEvent {
    TriggerSucceeded {
        turn: u64,
        reason: String,
        top_drive: Option<String>,
        total_pressure: f64,
    },
    TriggerFailed {
        turn: u64,
        reason: String,
        webhook_status: String,
    },
    MutationApplied {
        kind: String,
        target: String,
    },
    MutationRejected {
        kind: String,
        rule: String,
    },
    FeedbackReceived {
        outcome: String,
        drives: Vec<String>,
    },
    StateSaved {
        at: f64,
    },
}

/// Broadcast-based event bus for system-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<PulseEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: PulseEvent) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PulseEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
