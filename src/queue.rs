//! Debounced change queue
//!
//! Raw watch events are buffered while the debounce timer is armed. When it
//! fires, the tree is rebuilt once and every buffered event is resolved into a
//! `ChangeRecord` against the old and new snapshots, then both are published
//! together.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinError;
use tokio::time::{sleep_until, Instant};

use crate::sandbox::normalize;
use crate::state::{TreeState, TreeUpdate};
use crate::traits::{RawEvent, RawEventKind, WatchError, WatchSignal};
use crate::tree::{find_node, TreeBuilder, TreeNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// What happened to one node during a flush
///
/// `node` comes from the new snapshot, except for deletions where only the
/// old snapshot still has it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(rename = "type")]
    pub kind: ChangeType,
    pub node: TreeNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Collecting,
}

pub struct ChangeEventQueue {
    window: Duration,
    max_delay: Option<Duration>,
    pending: Vec<RawEvent>,
    deadline: Option<Instant>,
    first_event_at: Option<Instant>,
}

impl ChangeEventQueue {
    pub fn new(window: Duration, max_delay: Option<Duration>) -> Self {
        Self {
            window,
            max_delay,
            pending: Vec::new(),
            deadline: None,
            first_event_at: None,
        }
    }

    pub fn state(&self) -> QueueState {
        if self.deadline.is_some() {
            QueueState::Collecting
        } else {
            QueueState::Idle
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Buffer `event` and re-arm the timer
    pub fn enqueue(&mut self, event: RawEvent) {
        let now = Instant::now();
        let first = *self.first_event_at.get_or_insert(now);

        let mut deadline = now + self.window;
        if let Some(max_delay) = self.max_delay {
            deadline = deadline.min(first + max_delay);
        }

        tracing::trace!(kind = ?event.kind, path = %event.path.display(), "Queued raw event");
        self.pending.push(event);
        self.deadline = Some(deadline);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Drain the batch and go back to idle
    pub fn take(&mut self) -> Vec<RawEvent> {
        self.deadline = None;
        self.first_event_at = None;
        std::mem::take(&mut self.pending)
    }
}

/// Turn a batch of raw events into change records
///
/// Events are grouped by path, in the order each path was first reported, and
/// every path yields at most one record. The record kind comes from comparing
/// both snapshots, so a `changed` event on a file created in the same batch
/// folds into its `create`. Paths found in neither snapshot are dropped: they
/// come from duplicate backend events or from entries hidden by the depth
/// limit.
pub fn resolve_events(
    events: &[RawEvent],
    builder: &TreeBuilder,
    old_tree: Option<&TreeNode>,
    new_tree: Option<&TreeNode>,
) -> Vec<ChangeRecord> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for event in events {
        if let RawEventKind::Other(name) = &event.kind {
            tracing::warn!(event = %name, path = %event.path.display(), "Unhandled watch event, ignoring");
            continue;
        }
        let target = builder.display_path(&normalize(&event.path));
        if seen.insert(target.clone()) {
            targets.push(target);
        }
    }

    targets
        .into_iter()
        .filter_map(|target| {
            let record = match (lookup(old_tree, &target), lookup(new_tree, &target)) {
                (None, Some(node)) => (ChangeType::Create, node),
                (Some(_), Some(node)) => (ChangeType::Update, node),
                (Some(node), None) => (ChangeType::Delete, node),
                (None, None) => {
                    tracing::warn!(path = %target, "Node not found for watch event, might be a false positive, ignoring");
                    return None;
                }
            };
            Some(ChangeRecord {
                kind: record.0,
                node: record.1.clone(),
            })
        })
        .collect()
}

fn lookup<'a>(tree: Option<&'a TreeNode>, path: &str) -> Option<&'a TreeNode> {
    tree.and_then(|tree| find_node(tree, |node| node.path == path))
}

/// Consumes one watch's signals and publishes into the tree state
pub(crate) struct QueueDriver {
    queue: ChangeEventQueue,
    builder: TreeBuilder,
    state: Arc<TreeState>,
    epoch: u64,
    /// Set when the watch dies after `ready`
    fault: watch::Sender<Option<WatchError>>,
}

impl QueueDriver {
    pub(crate) fn new(
        queue: ChangeEventQueue,
        builder: TreeBuilder,
        state: Arc<TreeState>,
        epoch: u64,
        fault: watch::Sender<Option<WatchError>>,
    ) -> Self {
        Self {
            queue,
            builder,
            state,
            epoch,
            fault,
        }
    }

    /// Run until the watch ends
    ///
    /// `ready` resolves once the first snapshot is published, or with the
    /// error that ended the watch before that. Errors after that point are
    /// reported through the fault channel and retract the published tree.
    pub(crate) async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<WatchSignal>,
        ready: oneshot::Sender<Result<(), WatchError>>,
    ) {
        let mut ready = Some(ready);

        loop {
            let deadline = self.queue.deadline();
            let flush_armed = deadline.is_some() && ready.is_none();

            tokio::select! {
                signal = signals.recv() => match signal {
                    Some(WatchSignal::Event(event)) => self.queue.enqueue(event),
                    Some(WatchSignal::Ready) => {
                        if let Some(tx) = ready.take() {
                            let result = self.publish_initial().await;
                            let failed = result.is_err();
                            let _ = tx.send(result);
                            if failed {
                                break;
                            }
                        }
                    }
                    Some(WatchSignal::Error(err)) => {
                        tracing::error!(root = %self.builder.root().display(), error = %err, "Watch failed, stopping");
                        match ready.take() {
                            Some(tx) => {
                                let _ = tx.send(Err(err));
                            }
                            None => self.fail(err),
                        }
                        break;
                    }
                    None => break,
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if flush_armed => self.flush().await,
            }
        }

        tracing::debug!(root = %self.builder.root().display(), "Change queue stopped");
    }

    /// Rebuild the tree off the async workers
    async fn snapshot(&self) -> Result<Option<Arc<TreeNode>>, JoinError> {
        let builder = self.builder.clone();
        let tree = tokio::task::spawn_blocking(move || builder.build()).await?;
        Ok(tree.map(Arc::new))
    }

    async fn publish_initial(&mut self) -> Result<(), WatchError> {
        let tree = self
            .snapshot()
            .await
            .map_err(|e| WatchError::Backend(format!("initial scan failed: {e}")))?;
        tracing::info!(root = %self.builder.root().display(), "Watch ready, publishing initial tree");
        self.state.publish(self.epoch, TreeUpdate { tree, events: None });
        Ok(())
    }

    async fn flush(&mut self) {
        let batch = self.queue.take();
        let old_tree = self.state.tree();
        let new_tree = match self.snapshot().await {
            Ok(tree) => tree,
            Err(e) => {
                tracing::error!(raw = batch.len(), error = %e, "Tree rebuild failed, dropping batch");
                return;
            }
        };

        let events = resolve_events(&batch, &self.builder, old_tree.as_deref(), new_tree.as_deref());
        let oldest_ms = batch
            .iter()
            .map(|event| event.timestamp)
            .min()
            .map(|oldest| (chrono::Utc::now() - oldest).num_milliseconds());
        tracing::debug!(raw = batch.len(), resolved = events.len(), oldest_ms = ?oldest_ms, "Flushing change queue");

        self.state.publish(
            self.epoch,
            TreeUpdate {
                tree: new_tree,
                events: Some(events),
            },
        );
    }

    fn fail(&self, err: WatchError) {
        self.fault.send_replace(Some(err));
        self.state.publish(self.epoch, TreeUpdate::default());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::RecordedBroadcaster;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn fixture() -> (TempDir, TreeBuilder) {
        let cwd = TempDir::new().unwrap();
        fs::create_dir_all(cwd.path().join("assets")).unwrap();
        let builder = TreeBuilder::new(cwd.path(), Path::new("assets"), None, None, None);
        (cwd, builder)
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_rearms_timer() {
        let mut queue = ChangeEventQueue::new(Duration::from_millis(50), None);
        assert_eq!(queue.state(), QueueState::Idle);

        queue.enqueue(RawEvent::new(RawEventKind::Added, "/a"));
        let first = queue.deadline().unwrap();
        assert_eq!(queue.state(), QueueState::Collecting);

        tokio::time::advance(Duration::from_millis(30)).await;
        queue.enqueue(RawEvent::new(RawEventKind::Changed, "/a"));
        let second = queue.deadline().unwrap();
        assert_eq!(second - first, Duration::from_millis(30));

        let batch = queue.take();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.state(), QueueState::Idle);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_delay_caps_rearming() {
        let mut queue = ChangeEventQueue::new(Duration::from_millis(50), Some(Duration::from_millis(80)));
        let start = Instant::now();

        for _ in 0..5 {
            queue.enqueue(RawEvent::new(RawEventKind::Changed, "/a"));
            tokio::time::advance(Duration::from_millis(40)).await;
        }

        assert_eq!(queue.deadline().unwrap(), start + Duration::from_millis(80));
    }

    #[test]
    fn test_resolve_events_uses_matching_snapshot() {
        let (cwd, builder) = fixture();
        let root = cwd.path().join("assets");

        fs::write(root.join("gone.txt"), "x").unwrap();
        let old_tree = builder.build().unwrap();
        fs::remove_file(root.join("gone.txt")).unwrap();
        fs::write(root.join("new.txt"), "y").unwrap();
        fs::create_dir(root.join("dir")).unwrap();
        let new_tree = builder.build().unwrap();

        let events = vec![
            RawEvent::new(RawEventKind::Added, root.join("new.txt")),
            RawEvent::new(RawEventKind::AddedDir, root.join("dir")),
            RawEvent::new(RawEventKind::Changed, root.join("new.txt")),
            RawEvent::new(RawEventKind::Removed, root.join("gone.txt")),
        ];

        let records = resolve_events(&events, &builder, Some(&old_tree), Some(&new_tree));
        let summary: Vec<_> = records.iter().map(|r| (r.kind, r.node.rel_path.as_str())).collect();
        assert_eq!(
            summary,
            vec![
                (ChangeType::Create, "new.txt"),
                (ChangeType::Create, "dir"),
                (ChangeType::Delete, "gone.txt"),
            ]
        );
        assert_eq!(records[2].node.kind, crate::tree::NodeKind::File);
    }

    #[test]
    fn test_resolve_events_one_record_per_path() {
        let (cwd, builder) = fixture();
        let root = cwd.path().join("assets");

        fs::write(root.join("kept.txt"), "a").unwrap();
        fs::write(root.join("replaced.txt"), "a").unwrap();
        let old_tree = builder.build().unwrap();
        fs::write(root.join("kept.txt"), "b").unwrap();
        fs::write(root.join("fresh.txt"), "c").unwrap();
        let new_tree = builder.build().unwrap();

        // what inotify reports for a new file, an edited file and a replaced one
        let events = vec![
            RawEvent::new(RawEventKind::Added, root.join("fresh.txt")),
            RawEvent::new(RawEventKind::Changed, root.join("fresh.txt")),
            RawEvent::new(RawEventKind::Changed, root.join("kept.txt")),
            RawEvent::new(RawEventKind::Changed, root.join("kept.txt")),
            RawEvent::new(RawEventKind::Removed, root.join("replaced.txt")),
            RawEvent::new(RawEventKind::Added, root.join("replaced.txt")),
            RawEvent::new(RawEventKind::Changed, root.join("fresh.txt")),
        ];

        let records = resolve_events(&events, &builder, Some(&old_tree), Some(&new_tree));
        let summary: Vec<_> = records.iter().map(|r| (r.kind, r.node.rel_path.as_str())).collect();
        assert_eq!(
            summary,
            vec![
                (ChangeType::Create, "fresh.txt"),
                (ChangeType::Update, "kept.txt"),
                (ChangeType::Update, "replaced.txt"),
            ]
        );
    }

    #[test]
    fn test_resolve_events_drops_unknown_and_missing() {
        let (cwd, builder) = fixture();
        let root = cwd.path().join("assets");
        let tree = builder.build().unwrap();

        let events = vec![
            RawEvent::new(RawEventKind::Added, root.join("never-existed.txt")),
            RawEvent::new(RawEventKind::Removed, root.join("never-existed.txt")),
            RawEvent::new(RawEventKind::Other("access".to_string()), root.join("x")),
        ];

        assert!(resolve_events(&events, &builder, Some(&tree), Some(&tree)).is_empty());
        assert!(resolve_events(&events[..1], &builder, None, None).is_empty());
    }

    fn new_driver(builder: TreeBuilder, state: &Arc<TreeState>) -> (QueueDriver, watch::Receiver<Option<WatchError>>) {
        let epoch = state.begin_epoch();
        let (fault_tx, fault_rx) = watch::channel(None);
        let driver = QueueDriver::new(
            ChangeEventQueue::new(Duration::from_millis(20), None),
            builder,
            Arc::clone(state),
            epoch,
            fault_tx,
        );
        (driver, fault_rx)
    }

    #[tokio::test]
    async fn test_driver_coalesces_batch_into_one_update() {
        let (cwd, builder) = fixture();
        let root = cwd.path().join("assets");
        let state = TreeState::new("filesystem", Arc::new(RecordedBroadcaster::new()));
        let (driver, _fault) = new_driver(builder, &state);
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(driver.run(rx, ready_tx));

        tx.send(WatchSignal::Ready).unwrap();
        ready_rx.await.unwrap().unwrap();
        let initial = state.current();
        assert!(initial.tree.is_some());
        assert!(initial.events.is_none());

        let mut updates = state.subscribe();
        updates.borrow_and_update();

        for name in ["a.txt", "b.txt", "c.txt"] {
            fs::write(root.join(name), name).unwrap();
            tx.send(WatchSignal::Event(RawEvent::new(RawEventKind::Added, root.join(name)))).unwrap();
            tx.send(WatchSignal::Event(RawEvent::new(RawEventKind::Changed, root.join(name)))).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), updates.changed())
            .await
            .unwrap()
            .unwrap();
        let update = updates.borrow_and_update().clone();
        let events = update.events.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.kind == ChangeType::Create));

        // nothing else pending
        assert!(tokio::time::timeout(Duration::from_millis(100), updates.changed()).await.is_err());

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_driver_reports_error_before_ready() {
        let (_cwd, builder) = fixture();
        let state = TreeState::new("filesystem", Arc::new(RecordedBroadcaster::new()));
        let (driver, fault) = new_driver(builder, &state);
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(driver.run(rx, ready_tx));

        tx.send(WatchSignal::Error(WatchError::Backend("inotify limit".to_string()))).unwrap();
        let result = ready_rx.await.unwrap();
        assert!(matches!(result, Err(WatchError::Backend(_))));
        task.await.unwrap();
        assert!(fault.borrow().is_none());
    }

    #[tokio::test]
    async fn test_driver_error_after_ready_retracts_tree() {
        let (_cwd, builder) = fixture();
        let state = TreeState::new("filesystem", Arc::new(RecordedBroadcaster::new()));
        let (driver, fault) = new_driver(builder, &state);
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(driver.run(rx, ready_tx));

        tx.send(WatchSignal::Ready).unwrap();
        ready_rx.await.unwrap().unwrap();
        assert!(state.tree().is_some());

        tx.send(WatchSignal::Error(WatchError::Backend("watch descriptor lost".to_string()))).unwrap();
        task.await.unwrap();

        assert!(matches!(&*fault.borrow(), Some(WatchError::Backend(_))));
        assert!(state.tree().is_none());
    }
}
