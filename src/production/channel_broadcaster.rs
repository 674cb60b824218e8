//! Broadcast channel feeding remote observers

use serde::Serialize;
use tokio::sync::broadcast;

use crate::state::TreeUpdate;
use crate::traits::{BroadcastError, Broadcaster};

const DEFAULT_CAPACITY: usize = 64;

#[derive(Serialize)]
struct Envelope<'a> {
    slot: &'a str,
    value: &'a TreeUpdate,
}

/// Serializes every update to a JSON line and fans it out to subscribers
///
/// Lagging subscribers lose the oldest lines; every line carries a full
/// snapshot so the latest one is enough to catch up.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<String>,
}

impl ChannelBroadcaster {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn publish(&self, slot: &str, update: &TreeUpdate) -> Result<(), BroadcastError> {
        let line = serde_json::to_string(&Envelope { slot, value: update })
            .map_err(|e| BroadcastError::Serialization(e.to_string()))?;

        if self.tx.send(line).is_err() {
            tracing::trace!(slot, "No subscribers for tree update");
        }
        Ok(())
    }
}
