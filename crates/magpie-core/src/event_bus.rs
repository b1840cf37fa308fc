use tokio::sync::broadcast;

use magpie_tools::EventSink;
use magpie_types::ResearchEvent;

/// Process-wide fan-out channel for session events. Delivery is
/// best-effort: lagging subscribers drop events and reconcile over REST.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ResearchEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResearchEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ResearchEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: ResearchEvent) {
        self.publish(event);
    }
}
