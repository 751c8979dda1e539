use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-slot broadcast hub for committed events. This is the seam the outbound
/// messaging collaborator subscribes on; the engine itself never waits on
/// delivery.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to committed events for a slot. Creates the channel if needed.
    pub fn subscribe(&self, slot_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(slot_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, slot_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&slot_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a channel (e.g. when a slot is retired).
    pub fn remove(&self, slot_id: &Ulid) {
        self.channels.remove(slot_id);
    }
}
