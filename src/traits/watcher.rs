//! File watching trait for the watched root

use std::path::{Component, Path, PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Debug, Clone, Error)]
pub enum WatchError {
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("Watch error: {0}")]
    Backend(String),
}

/// Raw event emitted by the watch primitive, before batching
///
/// `timestamp` is when the backend reported it; flushes log the age of the
/// oldest event in the batch.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub path: PathBuf,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl RawEvent {
    pub fn new(kind: RawEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RawEventKind {
    Added,
    AddedDir,
    Changed,
    Removed,
    RemovedDir,
    /// Anything the backend reports that has no tree meaning
    Other(String),
}

/// Everything a running watch can report
#[derive(Debug, Clone)]
pub enum WatchSignal {
    Event(RawEvent),
    /// The initial scan is complete, the watch is live
    Ready,
    Error(WatchError),
}

pub type SignalSender = UnboundedSender<WatchSignal>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    /// Maximum directory depth below the root, `None` for unlimited
    pub depth: Option<usize>,
    pub ignore_dotfiles: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            depth: None,
            ignore_dotfiles: true,
        }
    }
}

impl WatchOptions {
    pub fn with_depth(depth: Option<usize>) -> Self {
        Self { depth, ..Self::default() }
    }

    /// Whether an event on `path` should be reported for a watch on `root`
    ///
    /// With `depth = d`, entries up to `d + 1` components below the root are
    /// visible: the children of every directory at level `d` or above.
    pub fn accepts(&self, root: &Path, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(root) else {
            return false;
        };

        let mut levels = 0usize;
        for component in rel.components() {
            let Component::Normal(segment) = component else {
                return false;
            };
            if self.ignore_dotfiles && segment.to_string_lossy().starts_with('.') {
                return false;
            }
            levels += 1;
        }

        match self.depth {
            Some(depth) => levels <= depth + 1,
            None => true,
        }
    }
}

/// Live watch registration; dropping it stops the watch
pub trait WatchHandle: Send {
    fn close(&mut self);
}

/// Trait for directory watching
///
/// Production: OS events via `notify` crate
/// Testing: Manual event emission
#[cfg_attr(test, mockall::automock)]
pub trait WatchPrimitive: Send + Sync {
    /// Start watching `root`, reporting through `signals` until the handle is dropped
    fn watch(
        &self,
        root: &Path,
        options: &WatchOptions,
        signals: SignalSender,
    ) -> Result<Box<dyn WatchHandle>, WatchError>;
}
