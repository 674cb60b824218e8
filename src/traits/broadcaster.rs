//! Replicated-state publication trait

use thiserror::Error;

use crate::state::TreeUpdate;

#[derive(Debug, Clone, Error)]
pub enum BroadcastError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Publishes `{tree, events}` values to remote observers
///
/// Production: `ChannelBroadcaster` feeding the session transport
/// Testing: `RecordedBroadcaster`
#[cfg_attr(test, mockall::automock)]
pub trait Broadcaster: Send + Sync {
    /// Publish one update into the slot keyed by `slot`
    fn publish(&self, slot: &str, update: &TreeUpdate) -> Result<(), BroadcastError>;
}
