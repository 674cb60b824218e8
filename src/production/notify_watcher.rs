//! OS directory watcher implementation

use std::path::{Path, PathBuf};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::traits::{
    RawEvent, RawEventKind, SignalSender, WatchError, WatchHandle, WatchOptions, WatchPrimitive,
    WatchSignal,
};

/// Watches a root through the platform's recommended `notify` backend
#[derive(Debug, Clone, Copy, Default)]
pub struct NotifyWatcher;

impl NotifyWatcher {
    pub fn new() -> Self {
        Self
    }
}

impl WatchPrimitive for NotifyWatcher {
    fn watch(
        &self,
        root: &Path,
        options: &WatchOptions,
        signals: SignalSender,
    ) -> Result<Box<dyn WatchHandle>, WatchError> {
        if !root.is_dir() {
            return Err(WatchError::PathNotFound(root.to_path_buf()));
        }

        // Backends like FSEvents report canonical paths (/private/var on macOS)
        let canonical = root.canonicalize().map_err(|e| map_io_error(root, e))?;
        let callback_root = root.to_path_buf();
        let callback_options = options.clone();
        let callback_signals = signals.clone();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    for (kind, path) in map_event(&event) {
                        let path = remap(&path, &canonical, &callback_root);
                        if !callback_options.accepts(&callback_root, &path) {
                            tracing::trace!(path = %path.display(), "Ignoring event outside watch scope");
                            continue;
                        }
                        if callback_signals
                            .send(WatchSignal::Event(RawEvent::new(kind, path)))
                            .is_err()
                        {
                            // receiver is gone, the watch is being torn down
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Watch backend error");
                    let _ = callback_signals.send(WatchSignal::Error(map_notify_error(&callback_root, e)));
                }
            }
        })
        .map_err(|e| map_notify_error(root, e))?;

        // notify does not report existing entries, so the watch is live as soon
        // as it is registered. Queue `Ready` first so it precedes every event.
        let _ = signals.send(WatchSignal::Ready);

        let mode = match options.depth {
            Some(0) => RecursiveMode::NonRecursive,
            _ => RecursiveMode::Recursive,
        };
        watcher.watch(root, mode).map_err(|e| map_notify_error(root, e))?;

        tracing::info!(root = %root.display(), ?mode, "Watching path");

        Ok(Box::new(NotifyWatchHandle {
            watcher: Some(watcher),
            root: root.to_path_buf(),
        }))
    }
}

pub struct NotifyWatchHandle {
    watcher: Option<RecommendedWatcher>,
    root: PathBuf,
}

impl WatchHandle for NotifyWatchHandle {
    fn close(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            if let Err(e) = watcher.unwatch(&self.root) {
                tracing::debug!(root = %self.root.display(), error = %e, "Unwatch failed, dropping watcher anyway");
            }
            tracing::info!(root = %self.root.display(), "Unwatched path");
        }
    }
}

impl Drop for NotifyWatchHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn remap(path: &Path, canonical: &Path, root: &Path) -> PathBuf {
    match path.strip_prefix(canonical) {
        Ok(rel) if canonical != root => root.join(rel),
        _ => path.to_path_buf(),
    }
}

fn added_kind(path: &Path) -> RawEventKind {
    if path.is_dir() {
        RawEventKind::AddedDir
    } else {
        RawEventKind::Added
    }
}

/// Translate one backend event into zero or more raw events
fn map_event(event: &notify::Event) -> Vec<(RawEventKind, PathBuf)> {
    let per_path = |f: &dyn Fn(&Path) -> Option<RawEventKind>| -> Vec<(RawEventKind, PathBuf)> {
        event
            .paths
            .iter()
            .filter_map(|path| f(path).map(|kind| (kind, path.clone())))
            .collect()
    };

    match &event.kind {
        EventKind::Create(CreateKind::Folder) => per_path(&|_| Some(RawEventKind::AddedDir)),
        EventKind::Create(_) => per_path(&|path| Some(added_kind(path))),

        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            per_path(&|path| Some(if path.exists() { added_kind(path) } else { RawEventKind::Removed }))
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => per_path(&|path| Some(added_kind(path))),
        // inotify also reports both halves separately
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => Vec::new(),
        EventKind::Modify(ModifyKind::Name(_)) => {
            per_path(&|path| Some(if path.exists() { added_kind(path) } else { RawEventKind::Removed }))
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => per_path(&|path| if path.is_dir() { None } else { Some(RawEventKind::Changed) }),

        EventKind::Remove(RemoveKind::Folder) => per_path(&|_| Some(RawEventKind::RemovedDir)),
        EventKind::Remove(_) => per_path(&|_| Some(RawEventKind::Removed)),

        EventKind::Access(_) => Vec::new(),
        EventKind::Any => per_path(&|_| Some(RawEventKind::Other("any".to_string()))),
        EventKind::Other => per_path(&|_| Some(RawEventKind::Other("other".to_string()))),
    }
}

fn map_io_error(root: &Path, e: std::io::Error) -> WatchError {
    match e.kind() {
        std::io::ErrorKind::NotFound => WatchError::PathNotFound(root.to_path_buf()),
        std::io::ErrorKind::PermissionDenied => WatchError::PermissionDenied(root.to_path_buf()),
        _ => WatchError::Backend(e.to_string()),
    }
}

fn map_notify_error(root: &Path, e: notify::Error) -> WatchError {
    let message = e.to_string();
    match e.kind {
        notify::ErrorKind::PathNotFound => WatchError::PathNotFound(root.to_path_buf()),
        notify::ErrorKind::Io(io) => map_io_error(root, io),
        _ => WatchError::Backend(message),
    }
}
