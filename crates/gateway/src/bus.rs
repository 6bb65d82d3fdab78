//! Process-local pub/sub for agent stream events.
//!
//! Producers (the agent runtime and anything else holding a publisher)
//! push events into a bounded channel; the gateway takes the single
//! subscriber at startup and re-broadcasts every event to ready
//! connections. Ordering is per-producer, not cross-producer.

use std::sync::Mutex;

use tokio::sync::mpsc;

use clawdis_protocol::AgentEvent;

const BUS_CAPACITY: usize = 256;

pub struct AgentEventBus {
    tx: mpsc::Sender<AgentEvent>,
    rx: Mutex<Option<mpsc::Receiver<AgentEvent>>>,
}

impl AgentEventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(BUS_CAPACITY);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Handle for producers. Cheap to clone; each clone is one producer.
    pub fn publisher(&self) -> AgentEventPublisher {
        AgentEventPublisher {
            tx: self.tx.clone(),
        }
    }

    /// Take the single subscriber. Returns `None` once taken.
    pub fn take_subscriber(&self) -> Option<mpsc::Receiver<AgentEvent>> {
        self.rx.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl Default for AgentEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct AgentEventPublisher {
    tx: mpsc::Sender<AgentEvent>,
}

impl AgentEventPublisher {
    /// Publish one event. Returns `false` when the subscriber is gone.
    pub async fn publish(&self, event: AgentEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }
}
