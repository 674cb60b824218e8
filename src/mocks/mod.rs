//! Test doubles for dependency injection
//!
//! Provides in-memory implementations of all external dependencies for isolated testing.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::state::TreeUpdate;
use crate::traits::{
    Authorizer, BroadcastError, Broadcaster, RawEvent, RawEventKind, SignalSender, WatchError,
    WatchHandle, WatchOptions, WatchPrimitive, WatchSignal,
};

// ============================================================================
// ManualWatcher
// ============================================================================

/// What a `ManualWatcher` reports right after a watch is registered
#[derive(Debug, Clone)]
pub enum StartBehavior {
    /// Send `Ready` immediately
    Ready,
    /// Send nothing, tests call `ready()` or `fail()`
    Pending,
    /// Send `Error` immediately
    Fail(WatchError),
    /// Refuse the registration synchronously
    Reject(WatchError),
}

struct ManualWatch {
    id: u64,
    root: PathBuf,
    options: WatchOptions,
    signals: SignalSender,
}

struct ManualWatcherState {
    watches: Vec<ManualWatch>,
    next_id: u64,
    behavior: StartBehavior,
}

/// Manual directory watcher for testing
///
/// Does not actually watch the file system. Tests call methods directly to
/// simulate events on the most recently registered watch.
#[derive(Clone)]
pub struct ManualWatcher {
    state: Arc<Mutex<ManualWatcherState>>,
}

impl ManualWatcher {
    pub fn new() -> Self {
        Self::with_behavior(StartBehavior::Ready)
    }

    pub fn pending() -> Self {
        Self::with_behavior(StartBehavior::Pending)
    }

    pub fn with_behavior(behavior: StartBehavior) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualWatcherState {
                watches: Vec::new(),
                next_id: 0,
                behavior,
            })),
        }
    }

    /// Check if a root is currently watched
    pub fn is_watching(&self, root: &Path) -> bool {
        self.state.lock().unwrap().watches.iter().any(|w| w.root == root)
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.state.lock().unwrap().watches.iter().map(|w| w.root.clone()).collect()
    }

    /// Options of the most recent live watch
    pub fn last_options(&self) -> Option<WatchOptions> {
        self.state.lock().unwrap().watches.last().map(|w| w.options.clone())
    }

    fn send(&self, signal: WatchSignal) -> bool {
        let state = self.state.lock().unwrap();
        match state.watches.last() {
            Some(watch) => watch.signals.send(signal).is_ok(),
            None => false,
        }
    }

    /// Deliver `event` to the latest watch; `false` if nothing is watching
    pub fn emit(&self, event: RawEvent) -> bool {
        self.send(WatchSignal::Event(event))
    }

    /// Simulate a raw event (for testing)
    pub fn simulate_event(&self, kind: RawEventKind, path: impl Into<PathBuf>) -> bool {
        self.emit(RawEvent::new(kind, path))
    }

    /// Complete the initial scan of the latest watch
    pub fn ready(&self) -> bool {
        self.send(WatchSignal::Ready)
    }

    pub fn fail(&self, error: WatchError) -> bool {
        self.send(WatchSignal::Error(error))
    }
}

impl Default for ManualWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchPrimitive for ManualWatcher {
    fn watch(
        &self,
        root: &Path,
        options: &WatchOptions,
        signals: SignalSender,
    ) -> Result<Box<dyn WatchHandle>, WatchError> {
        let mut state = self.state.lock().unwrap();

        let initial = match &state.behavior {
            StartBehavior::Reject(err) => return Err(err.clone()),
            StartBehavior::Ready => Some(WatchSignal::Ready),
            StartBehavior::Pending => None,
            StartBehavior::Fail(err) => Some(WatchSignal::Error(err.clone())),
        };
        if let Some(signal) = initial {
            let _ = signals.send(signal);
        }

        let id = state.next_id;
        state.next_id += 1;
        state.watches.push(ManualWatch {
            id,
            root: root.to_path_buf(),
            options: options.clone(),
            signals,
        });

        Ok(Box::new(ManualWatchHandle {
            id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct ManualWatchHandle {
    id: u64,
    state: Arc<Mutex<ManualWatcherState>>,
}

impl WatchHandle for ManualWatchHandle {
    fn close(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.watches.retain(|w| w.id != self.id);
    }
}

impl Drop for ManualWatchHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// RecordedBroadcaster
// ============================================================================

/// Recorded broadcaster for testing
///
/// Records every published update, optionally failing each publish.
#[derive(Clone, Default)]
pub struct RecordedBroadcaster {
    published: Arc<Mutex<Vec<(String, TreeUpdate)>>>,
    failure: Arc<Mutex<Option<BroadcastError>>>,
}

impl RecordedBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record, then fail every publish with `error`
    pub fn always_fail(error: BroadcastError) -> Self {
        let broadcaster = Self::new();
        *broadcaster.failure.lock().unwrap() = Some(error);
        broadcaster
    }

    /// Get all published `(slot, update)` pairs
    pub fn published(&self) -> Vec<(String, TreeUpdate)> {
        self.published.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
    }
}

impl Broadcaster for RecordedBroadcaster {
    fn publish(&self, slot: &str, update: &TreeUpdate) -> Result<(), BroadcastError> {
        self.published
            .lock()
            .unwrap()
            .push((slot.to_string(), update.clone()));

        match self.failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

// ============================================================================
// StaticAuthorizer
// ============================================================================

/// Fixed trust table for testing
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    trusted: HashSet<u64>,
    connected: HashSet<u64>,
    tokens: HashMap<u64, String>,
}

impl StaticAuthorizer {
    /// Trust nobody
    pub fn deny_all() -> Self {
        Self::default()
    }

    pub fn trusting(client_ids: impl IntoIterator<Item = u64>) -> Self {
        let trusted: HashSet<u64> = client_ids.into_iter().collect();
        Self {
            connected: trusted.clone(),
            trusted,
            tokens: HashMap::new(),
        }
    }

    /// Mark `client_id` as connected without trusting it
    pub fn with_connected(mut self, client_id: u64) -> Self {
        self.connected.insert(client_id);
        self
    }

    /// Accept `token` for `client_id` on upload requests
    pub fn with_token(mut self, client_id: u64, token: impl Into<String>) -> Self {
        self.tokens.insert(client_id, token.into());
        self
    }
}

impl Authorizer for StaticAuthorizer {
    fn is_trusted_client(&self, client_id: u64) -> bool {
        self.trusted.contains(&client_id)
    }

    fn is_connected(&self, client_id: u64) -> bool {
        self.connected.contains(&client_id)
    }

    fn is_trusted_token(&self, client_id: u64, _client_ip: &str, token: &str) -> bool {
        self.trusted.contains(&client_id)
            && self.tokens.get(&client_id).map(|t| t == token).unwrap_or(false)
    }
}

// ============================================================================
// Tests
// ============================================================================
