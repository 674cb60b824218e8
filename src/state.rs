//! Published tree state
//!
//! `TreeState` is the engine's replicated-state slot: it holds the latest
//! `{tree, events}` value, wakes local waiters through a `watch` channel,
//! runs registered listeners and forwards every value to the broadcaster.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::queue::ChangeRecord;
use crate::traits::Broadcaster;
use crate::tree::TreeNode;

/// One publication: the full snapshot plus what changed since the previous one
///
/// `events` is `None` for the initial snapshot of a root and for the interim
/// empty value published while switching.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeUpdate {
    pub tree: Option<Arc<TreeNode>>,
    pub events: Option<Vec<ChangeRecord>>,
}

type Listener = Arc<dyn Fn(&TreeUpdate) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// Publication order and the values still owed to listeners
///
/// Listeners and the broadcaster run with no lock held, so they may call back
/// into the engine. Whoever finds `draining` unset delivers the queue in order,
/// including values published by those callbacks.
#[derive(Default)]
struct Delivery {
    epoch: u64,
    queue: VecDeque<TreeUpdate>,
    draining: bool,
}

pub struct TreeState {
    slot: String,
    broadcaster: Arc<dyn Broadcaster>,
    tx: watch::Sender<TreeUpdate>,
    delivery: Mutex<Delivery>,
    listeners: Mutex<Listeners>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TreeState {
    pub fn new(slot: impl Into<String>, broadcaster: Arc<dyn Broadcaster>) -> Arc<Self> {
        let (tx, _rx) = watch::channel(TreeUpdate::default());
        Arc::new(Self {
            slot: slot.into(),
            broadcaster,
            tx,
            delivery: Mutex::new(Delivery::default()),
            listeners: Mutex::new(Listeners::default()),
        })
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    pub fn current(&self) -> TreeUpdate {
        self.tx.borrow().clone()
    }

    pub fn tree(&self) -> Option<Arc<TreeNode>> {
        self.tx.borrow().tree.clone()
    }

    /// Receiver woken on every publication
    pub fn subscribe(&self) -> watch::Receiver<TreeUpdate> {
        self.tx.subscribe()
    }

    /// Invalidate every earlier epoch and publish the empty interim value
    pub fn begin_epoch(&self) -> u64 {
        let (epoch, drain) = {
            let mut delivery = lock(&self.delivery);
            delivery.epoch += 1;
            let drain = self.enqueue(&mut delivery, TreeUpdate::default());
            (delivery.epoch, drain)
        };
        if drain {
            self.drain();
        }
        epoch
    }

    pub fn epoch(&self) -> u64 {
        lock(&self.delivery).epoch
    }

    /// Publish `update` if `epoch` is still current; stale publishers get `false`
    pub fn publish(&self, epoch: u64, update: TreeUpdate) -> bool {
        let drain = {
            let mut delivery = lock(&self.delivery);
            if delivery.epoch != epoch {
                tracing::debug!(slot = %self.slot, epoch, current = delivery.epoch, "Dropping stale publication");
                return false;
            }
            self.enqueue(&mut delivery, update)
        };
        if drain {
            self.drain();
        }
        true
    }

    /// Make `update` current and queue it; `true` when the caller has to drain
    fn enqueue(&self, delivery: &mut Delivery, update: TreeUpdate) -> bool {
        self.tx.send_replace(update.clone());
        delivery.queue.push_back(update);
        !std::mem::replace(&mut delivery.draining, true)
    }

    fn drain(&self) {
        loop {
            let update = {
                let mut delivery = lock(&self.delivery);
                match delivery.queue.pop_front() {
                    Some(update) => update,
                    None => {
                        delivery.draining = false;
                        return;
                    }
                }
            };
            self.deliver(&update);
        }
    }

    fn deliver(&self, update: &TreeUpdate) {
        if let Err(e) = self.broadcaster.publish(&self.slot, update) {
            tracing::warn!(slot = %self.slot, error = %e, "Failed to broadcast tree update");
        }

        let listeners: Vec<Listener> = lock(&self.listeners)
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(update);
        }
    }

    /// Run `callback` on every publication until the returned handle is dropped
    pub fn on_update<F>(self: &Arc<Self>, callback: F, fire_immediately: bool) -> UpdateSubscription
    where
        F: Fn(&TreeUpdate) + Send + Sync + 'static,
    {
        if fire_immediately {
            callback(&self.current());
        }

        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.entries.push((id, Arc::new(callback)));

        UpdateSubscription {
            id,
            state: Arc::downgrade(self),
        }
    }

    fn remove_listener(&self, id: u64) {
        lock(&self.listeners).entries.retain(|(entry, _)| *entry != id);
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        lock(&self.listeners).entries.len()
    }
}

/// Keeps an `on_update` listener registered; dropping it unregisters
#[must_use = "the listener is removed as soon as the subscription is dropped"]
pub struct UpdateSubscription {
    id: u64,
    state: Weak<TreeState>,
}

impl UpdateSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for UpdateSubscription {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.remove_listener(self.id);
        }
    }
}

impl std::fmt::Debug for UpdateSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSubscription").field("id", &self.id).finish()
    }
}
