//! Tree synchronization engine
//!
//! Owns the watch on the current root, the static mount for its public path
//! and the published tree. Mutating operations only resolve once a published
//! snapshot reflects them, so a caller can read its own writes through
//! `get_tree` / `find_in_tree` right after awaiting.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{EngineConfig, EngineOptions, SwitchOptions};
use crate::error::EngineError;
use crate::queue::{ChangeEventQueue, QueueDriver};
use crate::sandbox::PathSandbox;
use crate::state::{TreeState, TreeUpdate, UpdateSubscription};
use crate::traits::{
    Broadcaster, MountHandle, MountRegistrar, WatchError, WatchHandle, WatchOptions, WatchPrimitive,
};
use crate::tree::{find_in_tree, find_node, url_map, TreeBuilder, TreeNode};

/// Whether a mutation is complete when its target shows up or disappears
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Present,
    Absent,
}

struct WatchSession {
    handle: Box<dyn WatchHandle>,
    task: JoinHandle<()>,
}

impl WatchSession {
    fn close(mut self) {
        self.handle.close();
        self.task.abort();
    }
}

/// Root-bound helpers, rebuilt on every switch
#[derive(Clone)]
struct ActiveRoot {
    sandbox: PathSandbox,
    builder: TreeBuilder,
    /// Error that ended the watch after its initial scan
    fault: watch::Receiver<Option<WatchError>>,
}

#[derive(Default)]
struct Inner {
    options: EngineOptions,
    active: Option<ActiveRoot>,
    session: Option<WatchSession>,
    mount: Option<MountHandle>,
}

pub struct TreeSyncEngine {
    config: EngineConfig,
    watcher: Arc<dyn WatchPrimitive>,
    mounts: Arc<dyn MountRegistrar>,
    state: Arc<TreeState>,
    inner: Mutex<Inner>,
    /// Serializes teardown and setup of watch sessions
    setup: tokio::sync::Mutex<()>,
}

impl TreeSyncEngine {
    /// Create an idle engine; call `switch` to start watching
    pub fn new(
        config: EngineConfig,
        watcher: Arc<dyn WatchPrimitive>,
        mounts: Arc<dyn MountRegistrar>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        let state = TreeState::new(config.id.clone(), broadcaster);
        Self {
            config,
            watcher,
            mounts,
            state,
            inner: Mutex::new(Inner::default()),
            setup: tokio::sync::Mutex::new(()),
        }
    }

    /// Create an engine and switch it to `options` right away
    pub async fn start(
        config: EngineConfig,
        options: SwitchOptions,
        watcher: Arc<dyn WatchPrimitive>,
        mounts: Arc<dyn MountRegistrar>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Result<Self, EngineError> {
        let engine = Self::new(config, watcher, mounts, broadcaster);
        engine.switch(options).await?;
        Ok(engine)
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn options(&self) -> EngineOptions {
        self.lock_inner().options.clone()
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move the engine to another root, or to idle with `dirname: None`
    ///
    /// Resolves once the first tree of the new root is published. A later
    /// `switch` issued before that point closes this watch and this call fails
    /// with `Closed`. The merged options are kept only once the mount and the
    /// watch are in place; a failed switch leaves the engine idle with its
    /// previous options.
    pub async fn switch(&self, options: SwitchOptions) -> Result<(), EngineError> {
        options.validate()?;

        let (ready, epoch, previous) = {
            let _setup = self.setup.lock().await;

            let (previous, options) = {
                let mut inner = self.lock_inner();
                let previous = inner.options.clone();
                let mut merged = previous.clone();
                merged.apply(options);
                self.teardown(&mut inner);
                (previous, merged)
            };

            let epoch = self.state.begin_epoch();

            let Some(dirname) = options.dirname.clone() else {
                self.lock_inner().options = options;
                tracing::info!(engine = %self.config.id, "Filesystem is idle");
                return Ok(());
            };

            let builder = TreeBuilder::new(
                &self.config.cwd,
                Path::new(&dirname),
                options.public_path.clone(),
                self.config.base_url.clone(),
                options.depth,
            );
            let root = builder.root().to_path_buf();

            if !tokio::fs::metadata(&root).await.map(|m| m.is_dir()).unwrap_or(false) {
                tracing::info!(root = %root.display(), "Creating watched directory");
                tokio::fs::create_dir_all(&root).await?;
            }

            let mount = match options.mount_prefix() {
                Some(prefix) => {
                    let handle = self.mounts.mount(&prefix, &root)?;
                    tracing::info!(prefix = %prefix, root = %root.display(), "Mounted public path");
                    Some(handle)
                }
                None => None,
            };

            let (signals_tx, signals_rx) = mpsc::unbounded_channel();
            let handle = match self.watcher.watch(&root, &WatchOptions::with_depth(options.depth), signals_tx) {
                Ok(handle) => handle,
                Err(e) => {
                    if let Some(mount) = mount {
                        self.mounts.unmount(mount);
                    }
                    return Err(e.into());
                }
            };

            let (ready_tx, ready_rx) = oneshot::channel();
            let (fault_tx, fault_rx) = watch::channel(None);
            let driver = QueueDriver::new(
                ChangeEventQueue::new(self.config.debounce(), self.config.max_delay()),
                builder.clone(),
                Arc::clone(&self.state),
                epoch,
                fault_tx,
            );
            let task = tokio::spawn(driver.run(signals_rx, ready_tx));

            let mut inner = self.lock_inner();
            inner.session = Some(WatchSession { handle, task });
            inner.mount = mount;
            inner.active = Some(ActiveRoot {
                sandbox: PathSandbox::new(&root),
                builder,
                fault: fault_rx,
            });
            tracing::info!(engine = %self.config.id, root = %root.display(), depth = ?options.depth, "Watching directory");
            inner.options = options;

            (ready_rx, epoch, previous)
        };

        match ready.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                // a newer switch owns the session by now
                if self.state.epoch() == epoch {
                    let mut inner = self.lock_inner();
                    self.teardown(&mut inner);
                    inner.options = previous;
                }
                Err(e.into())
            }
            Err(_) => Err(EngineError::Closed),
        }
    }

    /// Stop watching and unmount the public path; the tree is discarded
    pub fn stop(&self) {
        let mut inner = self.lock_inner();
        self.teardown(&mut inner);
        drop(inner);
        self.state.begin_epoch();
        tracing::info!(engine = %self.config.id, "Stopped");
    }

    fn teardown(&self, inner: &mut Inner) {
        if let Some(session) = inner.session.take() {
            session.close();
        }
        if let Some(mount) = inner.mount.take() {
            tracing::info!(prefix = %mount.prefix(), "Unmounting public path");
            self.mounts.unmount(mount);
        }
        inner.active = None;
    }

    /// Current root, or `Idle`; a root whose watch died is torn down first
    fn active(&self, op: &'static str) -> Result<ActiveRoot, EngineError> {
        let mut inner = self.lock_inner();
        let active = inner.active.clone().ok_or(EngineError::Idle { op })?;

        let fault = active.fault.borrow().clone();
        if let Some(err) = fault {
            tracing::warn!(engine = %self.config.id, error = %err, "Watch was lost, going idle");
            self.teardown(&mut inner);
            drop(inner);
            self.state.begin_epoch();
            return Err(err.into());
        }
        Ok(active)
    }

    pub fn get_tree(&self) -> Option<Arc<TreeNode>> {
        self.state.tree()
    }

    /// Run `callback` with every published `{tree, events}` until the handle drops
    pub fn on_update<F>(&self, callback: F, fire_immediately: bool) -> UpdateSubscription
    where
        F: Fn(&TreeUpdate) + Send + Sync + 'static,
    {
        self.state.on_update(callback, fire_immediately)
    }

    pub fn subscribe(&self) -> watch::Receiver<TreeUpdate> {
        self.state.subscribe()
    }

    /// Node matching a path relative to the root, a working-root path, or a url
    pub fn find_in_tree(&self, path_or_url: &str) -> Option<TreeNode> {
        let tree = self.state.tree()?;
        find_in_tree(&tree, path_or_url).cloned()
    }

    /// File name to url map of every file with the given extension
    pub fn tree_as_url_map(
        &self,
        filter_ext: &str,
        keep_extension: bool,
    ) -> Result<BTreeMap<String, String>, EngineError> {
        let tree = self.state.tree().ok_or(EngineError::Idle { op: "getTreeAsUrlMap" })?;
        if tree.url.is_none() {
            return Err(EngineError::InvalidOption(
                "current configuration does not expose urls, set a public path".to_string(),
            ));
        }
        Ok(url_map(&tree, filter_ext, keep_extension))
    }

    pub async fn read_file(&self, pathname: &str) -> Result<Vec<u8>, EngineError> {
        const OP: &str = "readFile";
        let active = self.active(OP)?;
        let path = active.sandbox.check(OP, pathname)?;

        let meta = tokio::fs::metadata(&path).await.map_err(not_found(OP, &path))?;
        if meta.is_dir() {
            return Err(EngineError::IsADirectory { op: OP, path });
        }

        Ok(tokio::fs::read(&path).await.map_err(not_found(OP, &path))?)
    }

    pub async fn write_file(&self, pathname: &str, data: impl AsRef<[u8]>) -> Result<(), EngineError> {
        const OP: &str = "writeFile";
        let active = self.active(OP)?;
        let path = active.sandbox.check(OP, pathname)?;

        tracing::debug!(path = %path.display(), bytes = data.as_ref().len(), "Writing file");
        self.apply_and_wait(&active, &path, Expect::Present, async {
            tokio::fs::write(&path, data).await?;
            Ok::<(), EngineError>(())
        })
        .await
    }

    pub async fn mkdir(&self, pathname: &str) -> Result<(), EngineError> {
        const OP: &str = "mkdir";
        let active = self.active(OP)?;
        let path = active.sandbox.check(OP, pathname)?;

        // an existing directory produces no event to wait for
        let exists = tokio::fs::metadata(&path).await.map(|m| m.is_dir()).unwrap_or(false);
        if exists && self.is_published(&active, &path) {
            return Ok(());
        }

        tracing::debug!(path = %path.display(), "Creating directory");
        self.apply_and_wait(&active, &path, Expect::Present, async {
            tokio::fs::create_dir_all(&path).await?;
            Ok::<(), EngineError>(())
        })
        .await
    }

    pub async fn rename(&self, old_path: &str, new_path: &str) -> Result<(), EngineError> {
        const OP: &str = "rename";
        let active = self.active(OP)?;
        let from = active.sandbox.check(OP, old_path)?;
        let to = active.sandbox.check(OP, new_path)?;

        if from == to {
            tokio::fs::metadata(&from).await.map_err(not_found(OP, &from))?;
            return Ok(());
        }

        tracing::debug!(from = %from.display(), to = %to.display(), "Renaming");
        self.apply_and_wait(&active, &to, Expect::Present, async {
            tokio::fs::rename(&from, &to).await.map_err(not_found(OP, &from))
        })
        .await
    }

    pub async fn remove(&self, pathname: &str) -> Result<(), EngineError> {
        const OP: &str = "rm";
        let active = self.active(OP)?;
        let path = active.sandbox.check(OP, pathname)?;

        tracing::debug!(path = %path.display(), "Removing");
        self.apply_and_wait(&active, &path, Expect::Absent, async {
            let meta = tokio::fs::symlink_metadata(&path).await.map_err(not_found(OP, &path))?;
            if meta.is_dir() {
                tokio::fs::remove_dir_all(&path).await.map_err(not_found(OP, &path))
            } else {
                tokio::fs::remove_file(&path).await.map_err(not_found(OP, &path))
            }
        })
        .await
    }

    fn is_published(&self, active: &ActiveRoot, path: &Path) -> bool {
        let target = active.builder.display_path(path);
        self.state
            .tree()
            .map(|tree| find_node(&tree, |node| node.path == target).is_some())
            .unwrap_or(false)
    }

    /// Run `operation`, then wait for a publication in which `target` is present or absent
    ///
    /// The subscription is taken before the operation so a flush racing with
    /// the filesystem call cannot be missed. Targets the tree never shows
    /// (dotfiles, entries below the depth limit) resolve after the operation,
    /// and a watch that dies while waiting fails the call.
    async fn apply_and_wait<Fut>(
        &self,
        active: &ActiveRoot,
        target: &Path,
        expect: Expect,
        operation: Fut,
    ) -> Result<(), EngineError>
    where
        Fut: Future<Output = Result<(), EngineError>>,
    {
        let target_path = active.builder.display_path(target);
        let mut updates = self.state.subscribe();
        updates.borrow_and_update();
        let mut fault = active.fault.clone();

        operation.await?;

        if active.builder.is_hidden(target) {
            tracing::debug!(path = %target_path, "Target is a dotfile, not waiting for the tree");
            return Ok(());
        }
        if active.builder.is_beyond_depth(target) {
            tracing::debug!(path = %target_path, "Target is below the depth limit, not waiting for the tree");
            return Ok(());
        }

        loop {
            let lost = fault.borrow_and_update().clone();
            if let Some(err) = lost {
                return Err(err.into());
            }

            updates.changed().await.map_err(|_| EngineError::Closed)?;

            let reflected = {
                let update = updates.borrow_and_update();
                match &update.tree {
                    Some(tree) => {
                        let found = find_node(tree, |node| node.path == target_path).is_some();
                        found == (expect == Expect::Present)
                    }
                    None => false,
                }
            };

            if reflected {
                tracing::trace!(path = %target_path, "Mutation reflected in tree");
                return Ok(());
            }
        }
    }
}

impl Drop for TreeSyncEngine {
    fn drop(&mut self) {
        let mut inner = self.lock_inner();
        if let Some(session) = inner.session.take() {
            session.close();
        }
        if let Some(mount) = inner.mount.take() {
            self.mounts.unmount(mount);
        }
    }
}

fn not_found(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> EngineError {
    let path: PathBuf = path.to_path_buf();
    move |err| {
        if err.kind() == io::ErrorKind::NotFound {
            EngineError::NotFound { op, path }
        } else {
            EngineError::Io(err)
        }
    }
}
