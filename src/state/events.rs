use tokio::sync::broadcast;

use crate::dto::progress::Snapshot;

/// Default capacity of the sync event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 16;

/// Notifications emitted by the autosave scheduler in place of success/error callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// The live snapshot was replaced from the remote store or by conflict resolution.
    Hydrated(Snapshot),
    /// A flush was acknowledged; carries the snapshot computed by the remote store.
    Saved(Snapshot),
    /// A flush failed; the mutation stays pending and is retried on the next trigger.
    SaveFailed {
        /// Activity whose save failed.
        activity_type: String,
        /// Rendered gateway error.
        message: String,
    },
    /// No bearer token was available; the mutation stays in memory only.
    LocalOnly {
        /// Activity kept in memory.
        activity_type: String,
    },
}

/// Broadcast hub fanning sync events out to every subscriber.
#[derive(Clone)]
pub struct SyncEventHub {
    sender: broadcast::Sender<SyncEvent>,
}

impl SyncEventHub {
    /// Construct a new hub backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Send an event to all current subscribers; having none is not an error.
    pub fn broadcast(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for SyncEventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
