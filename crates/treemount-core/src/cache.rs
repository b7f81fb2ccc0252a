//! Watch-driven mirror of a namespace subtree.
//!
//! [`WatchedTreeCache`] subscribes to the subtree, applies every
//! [`Notification`] to an in-memory copy and serves all reads from it. A
//! single applier task owns the write side; readers take the read lock.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized -> Syncing -> Ready -> (stream lost / corrupted) -> Syncing -> Ready ...
//!                                   \-> Closed
//! ```
//!
//! While not `Ready`, queries block until the mirror is rebuilt. Once
//! `Closed`, they fail with `Unavailable`.
//!
//! After a notification has been applied, and only then, the concrete
//! changes are reported to a [`CacheListener`]. A caller woken by the
//! listener is therefore guaranteed to see its change in the mirror.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::client::{
    NamespaceClient, NodeData, NodeStat, Notification, NotificationStream, RetryPolicy,
};
use crate::error::{NamespaceError, NamespaceResult};
use crate::path::NodePath;

/// Mirror lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Uninitialized,
    Syncing,
    Ready,
    Closed,
}

/// A change applied to the mirror, as reported to the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Added,
    Removed,
    Updated,
    ChildrenChanged,
}

/// Observer of applied mirror changes.
pub trait CacheListener: Send + Sync {
    /// Called after the change at `path` is visible to readers.
    fn on_applied(&self, path: &NodePath, kind: EventKind);

    /// Called once the mirror is `Ready` after a (re)build. `exists` answers
    /// against the fresh mirror.
    fn on_resynced(&self, exists: &dyn Fn(&NodePath) -> bool);
}

#[derive(Debug, Default)]
struct MirrorEntry {
    payload: Bytes,
    children: BTreeSet<String>,
}

/// The path map. Mutated only through [`Mirror::apply`].
#[derive(Debug)]
struct Mirror {
    root: NodePath,
    ready: bool,
    nodes: HashMap<NodePath, MirrorEntry>,
}

impl Mirror {
    fn new(root: NodePath) -> Self {
        Self {
            root,
            ready: false,
            nodes: HashMap::new(),
        }
    }

    fn clear(&mut self) {
        self.ready = false;
        self.nodes.clear();
    }

    /// Applies one notification, returning the changes made.
    ///
    /// `Initialized` is handled by the caller.
    fn apply(&mut self, notification: Notification) -> NamespaceResult<Vec<(NodePath, EventKind)>> {
        match notification {
            Notification::NodeAdded { path, payload } => Ok(self.upsert(path, payload)),
            Notification::NodeUpdated { path, payload } => {
                if let Some(entry) = self.nodes.get_mut(&path) {
                    entry.payload = payload;
                    Ok(vec![(path, EventKind::Updated)])
                } else {
                    Ok(self.upsert(path, payload))
                }
            }
            Notification::NodeRemoved { path } => Ok(self.remove(&path)),
            Notification::ChildrenChanged { path, children } => {
                let Some(entry) = self.nodes.get(&path) else {
                    trace!(path = %path, "children change for unknown node");
                    return Ok(Vec::new());
                };
                if entry.children != children {
                    return Err(NamespaceError::Corrupted(format!(
                        "children of {path} disagree with the mirror: expected {:?}, mirror has {:?}",
                        children, entry.children
                    )));
                }
                Ok(vec![(path, EventKind::ChildrenChanged)])
            }
            Notification::Initialized => Ok(Vec::new()),
        }
    }

    fn upsert(&mut self, path: NodePath, payload: Bytes) -> Vec<(NodePath, EventKind)> {
        if !path.starts_with(&self.root) {
            return Vec::new();
        }
        if let Some(entry) = self.nodes.get_mut(&path) {
            entry.payload = payload;
            return vec![(path, EventKind::Added)];
        }

        if path != self.root {
            let Some(parent) = path.parent() else {
                return Vec::new();
            };
            let Some(parent_entry) = self.nodes.get_mut(&parent) else {
                warn!(path = %path, "skipping orphan node, parent not in mirror");
                return Vec::new();
            };
            parent_entry.children.insert(path.name().to_string());
        }

        self.nodes.insert(
            path.clone(),
            MirrorEntry {
                payload,
                children: BTreeSet::new(),
            },
        );
        vec![(path, EventKind::Added)]
    }

    fn remove(&mut self, path: &NodePath) -> Vec<(NodePath, EventKind)> {
        let mut removed = Vec::new();
        self.remove_subtree(path, &mut removed);

        if let Some(parent) = path.parent()
            && let Some(parent_entry) = self.nodes.get_mut(&parent)
        {
            parent_entry.children.remove(path.name());
        }

        // Report the node itself even when it was already gone.
        if removed.is_empty() {
            removed.push((path.clone(), EventKind::Removed));
        }
        removed
    }

    fn remove_subtree(&mut self, path: &NodePath, removed: &mut Vec<(NodePath, EventKind)>) {
        let Some(entry) = self.nodes.remove(path) else {
            return;
        };
        for child in &entry.children {
            self.remove_subtree(&path.join(child), removed);
        }
        removed.push((path.clone(), EventKind::Removed));
    }

    fn children(&self, path: &NodePath) -> NamespaceResult<Vec<String>> {
        self.nodes
            .get(path)
            .map(|e| e.children.iter().cloned().collect())
            .ok_or_else(|| NamespaceError::NotFound(path.to_string()))
    }

    fn data(&self, path: &NodePath) -> NamespaceResult<NodeData> {
        self.nodes
            .get(path)
            .map(|e| NodeData {
                payload: e.payload.clone(),
                stat: NodeStat {
                    num_children: e.children.len(),
                    data_length: e.payload.len(),
                },
            })
            .ok_or_else(|| NamespaceError::NotFound(path.to_string()))
    }
}

struct Shared {
    root: NodePath,
    mirror: RwLock<Mirror>,
    state: Mutex<CacheState>,
    state_changed: Condvar,
    rebuilds: AtomicU64,
    listener: Arc<dyn CacheListener>,
}

impl Shared {
    fn set_state(&self, next: CacheState) {
        let mut state = self.state.lock();
        if *state == CacheState::Closed {
            return;
        }
        let from = *state;
        if from != next {
            debug!(root = %self.root, ?from, to = ?next, "cache state change");
        }
        *state = next;
        self.state_changed.notify_all();
    }

    /// Enters `Syncing` and drops the mirror contents.
    ///
    /// State changes first so a reader that finds the mirror not ready
    /// always finds a state other than `Ready`.
    fn begin_sync(&self) {
        self.set_state(CacheState::Syncing);
        self.mirror.write().clear();
    }

    fn finish_sync(&self) {
        {
            let mut mirror = self.mirror.write();
            if *self.state.lock() == CacheState::Closed {
                return;
            }
            mirror.ready = true;
        }
        self.set_state(CacheState::Ready);

        let exists = |path: &NodePath| self.mirror.read().nodes.contains_key(path);
        self.listener.on_resynced(&exists);
    }

    /// Applies notifications until the stream ends or turns out corrupted.
    async fn consume(&self, mut stream: NotificationStream) {
        let mut initialized = false;
        while let Some(notification) = stream.recv().await {
            if notification == Notification::Initialized {
                if initialized {
                    warn!(root = %self.root, "duplicate Initialized, rebuilding mirror");
                    return;
                }
                initialized = true;
                let size = self.mirror.read().nodes.len();
                info!(root = %self.root, nodes = size, "mirror ready");
                self.finish_sync();
                continue;
            }

            let applied = self.mirror.write().apply(notification);
            match applied {
                Ok(changes) => {
                    for (path, kind) in changes {
                        self.listener.on_applied(&path, kind);
                    }
                }
                Err(e) => {
                    warn!(root = %self.root, error = %e, "rebuilding mirror");
                    return;
                }
            }
        }
        warn!(root = %self.root, "subscription lost, rebuilding mirror");
    }

    /// Blocks until `Ready` (Ok) or `Closed` (Err), or the deadline passes.
    fn wait_for_ready(&self, deadline: Option<Instant>) -> NamespaceResult<()> {
        let mut state = self.state.lock();
        loop {
            match *state {
                CacheState::Ready => return Ok(()),
                CacheState::Closed => {
                    return Err(NamespaceError::Unavailable(format!(
                        "mirror of {} is closed",
                        self.root
                    )));
                }
                CacheState::Uninitialized | CacheState::Syncing => match deadline {
                    Some(deadline) => {
                        if self.state_changed.wait_until(&mut state, deadline).timed_out()
                            && !matches!(*state, CacheState::Ready | CacheState::Closed)
                        {
                            return Err(NamespaceError::Timeout {
                                path: self.root.to_string(),
                                after: Duration::ZERO,
                            });
                        }
                    }
                    None => self.state_changed.wait(&mut state),
                },
            }
        }
    }

    fn read<T>(&self, f: impl Fn(&Mirror) -> NamespaceResult<T>) -> NamespaceResult<T> {
        loop {
            {
                let mirror = self.mirror.read();
                if mirror.ready {
                    return f(&mirror);
                }
            }
            self.wait_for_ready(None)?;
        }
    }
}

/// Subscribes until it succeeds, backing off between attempts.
async fn subscribe_forever(
    client: &dyn NamespaceClient,
    root: &NodePath,
    retry: &RetryPolicy,
) -> NotificationStream {
    let mut attempt = 0;
    loop {
        match client.subscribe(root).await {
            Ok(stream) => return stream,
            Err(e) => {
                let delay = retry.delay_for(attempt);
                warn!(root = %root, error = %e, ?delay, "subscribe failed, retrying");
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1).min(retry.max_retries);
            }
        }
    }
}

async fn run_applier(
    shared: Arc<Shared>,
    client: Arc<dyn NamespaceClient>,
    retry: RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut first = true;
    loop {
        if *shutdown.borrow() {
            break;
        }
        shared.begin_sync();
        if !first {
            shared.rebuilds.fetch_add(1, Ordering::Relaxed);
        }
        first = false;

        let stream = tokio::select! {
            _ = shutdown.changed() => break,
            stream = subscribe_forever(client.as_ref(), &shared.root, &retry) => stream,
        };
        tokio::select! {
            _ = shutdown.changed() => break,
            () = shared.consume(stream) => {}
        }
    }
    debug!(root = %shared.root, "applier stopped");
}

/// Local mirror of a namespace subtree.
pub struct WatchedTreeCache {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
}

impl WatchedTreeCache {
    /// Starts mirroring `root` on `handle`.
    ///
    /// Returns immediately; use [`wait_ready`](Self::wait_ready) to block
    /// until the initial snapshot is applied.
    pub fn start(
        handle: &Handle,
        client: Arc<dyn NamespaceClient>,
        root: NodePath,
        retry: RetryPolicy,
        listener: Arc<dyn CacheListener>,
    ) -> Self {
        let shared = Arc::new(Shared {
            mirror: RwLock::new(Mirror::new(root.clone())),
            root,
            state: Mutex::new(CacheState::Uninitialized),
            state_changed: Condvar::new(),
            rebuilds: AtomicU64::new(0),
            listener,
        });
        let (shutdown, shutdown_rx) = watch::channel(false);
        handle.spawn(run_applier(Arc::clone(&shared), client, retry, shutdown_rx));
        Self { shared, shutdown }
    }

    pub fn root(&self) -> &NodePath {
        &self.shared.root
    }

    pub fn state(&self) -> CacheState {
        *self.shared.state.lock()
    }

    /// Number of times the mirror was discarded and rebuilt.
    pub fn rebuild_count(&self) -> u64 {
        self.shared.rebuilds.load(Ordering::Relaxed)
    }

    /// Blocks until the mirror is `Ready`.
    ///
    /// With a timeout, fails with `Timeout` once it elapses.
    pub fn wait_ready(&self, timeout: Option<Duration>) -> NamespaceResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        self.shared
            .wait_for_ready(deadline)
            .map_err(|e| match (e, timeout) {
                (NamespaceError::Timeout { path, .. }, Some(after)) => {
                    NamespaceError::Timeout { path, after }
                }
                (e, _) => e,
            })
    }

    /// Sorted child names of `path`.
    pub fn get_children(&self, path: &NodePath) -> NamespaceResult<Vec<String>> {
        self.shared.read(|m| m.children(path))
    }

    pub fn get_payload_and_stat(&self, path: &NodePath) -> NamespaceResult<NodeData> {
        self.shared.read(|m| m.data(path))
    }

    pub fn contains(&self, path: &NodePath) -> NamespaceResult<bool> {
        self.shared.read(|m| Ok(m.nodes.contains_key(path)))
    }

    /// Stops the applier. Subsequent queries fail with `Unavailable`.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        {
            let mut state = self.shared.state.lock();
            *state = CacheState::Closed;
            self.shared.state_changed.notify_all();
        }
        self.shared.mirror.write().clear();
        info!(root = %self.shared.root, "mirror closed");
    }
}

impl Drop for WatchedTreeCache {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryNamespace;

    fn p(raw: &str) -> NodePath {
        NodePath::parse(raw).unwrap()
    }

    fn added(path: &str, payload: &'static [u8]) -> Notification {
        Notification::NodeAdded {
            path: p(path),
            payload: Bytes::from_static(payload),
        }
    }

    fn seeded() -> Mirror {
        let mut mirror = Mirror::new(NodePath::root());
        mirror.apply(added("/", b"")).unwrap();
        mirror.apply(added("/a", b"")).unwrap();
        mirror.apply(added("/a/f", b"hi")).unwrap();
        mirror
    }

    #[test]
    fn test_added_links_into_parent() {
        let mirror = seeded();
        assert_eq!(mirror.children(&p("/")).unwrap(), vec!["a"]);
        assert_eq!(mirror.children(&p("/a")).unwrap(), vec!["f"]);
        let data = mirror.data(&p("/a/f")).unwrap();
        assert_eq!(data.payload.as_ref(), b"hi");
        assert_eq!(data.stat.num_children, 0);
        assert_eq!(data.stat.data_length, 2);
    }

    #[test]
    fn test_orphan_is_skipped() {
        let mut mirror = seeded();
        let changes = mirror.apply(added("/missing/x", b"")).unwrap();
        assert!(changes.is_empty());
        assert!(!mirror.nodes.contains_key(&p("/missing/x")));
    }

    #[test]
    fn test_added_for_existing_updates_payload() {
        let mut mirror = seeded();
        mirror.apply(added("/a/f", b"new")).unwrap();
        assert_eq!(mirror.data(&p("/a/f")).unwrap().payload.as_ref(), b"new");
        assert_eq!(mirror.children(&p("/a")).unwrap(), vec!["f"]);
    }

    #[test]
    fn test_updated_for_unknown_behaves_like_added() {
        let mut mirror = seeded();
        let changes = mirror
            .apply(Notification::NodeUpdated {
                path: p("/a/g"),
                payload: Bytes::from_static(b"x"),
            })
            .unwrap();
        assert_eq!(changes, vec![(p("/a/g"), EventKind::Added)]);
        assert_eq!(mirror.children(&p("/a")).unwrap(), vec!["f", "g"]);
    }

    #[test]
    fn test_removed_drops_descendants() {
        let mut mirror = seeded();
        let changes = mirror.apply(Notification::NodeRemoved { path: p("/a") }).unwrap();
        assert_eq!(
            changes,
            vec![(p("/a/f"), EventKind::Removed), (p("/a"), EventKind::Removed)]
        );
        assert!(mirror.children(&p("/")).unwrap().is_empty());
        assert!(matches!(mirror.data(&p("/a/f")), Err(NamespaceError::NotFound(_))));
    }

    #[test]
    fn test_removed_absent_is_noop() {
        let mut mirror = seeded();
        let changes = mirror.apply(Notification::NodeRemoved { path: p("/zzz") }).unwrap();
        assert_eq!(changes, vec![(p("/zzz"), EventKind::Removed)]);
        assert_eq!(mirror.nodes.len(), 3);
    }

    #[test]
    fn test_children_changed_mismatch_is_corrupted() {
        let mut mirror = seeded();
        let ok = Notification::ChildrenChanged {
            path: p("/a"),
            children: BTreeSet::from(["f".to_string()]),
        };
        assert!(mirror.apply(ok).is_ok());

        let bad = Notification::ChildrenChanged {
            path: p("/a"),
            children: BTreeSet::from(["f".to_string(), "ghost".to_string()]),
        };
        assert!(matches!(mirror.apply(bad), Err(NamespaceError::Corrupted(_))));
    }

    #[test]
    fn test_nodes_outside_root_are_ignored() {
        let mut mirror = Mirror::new(p("/app"));
        mirror.apply(added("/app", b"")).unwrap();
        assert!(mirror.apply(added("/other", b"")).unwrap().is_empty());
        assert_eq!(mirror.nodes.len(), 1);
    }

    struct NullListener;

    impl CacheListener for NullListener {
        fn on_applied(&self, _path: &NodePath, _kind: EventKind) {}
        fn on_resynced(&self, _exists: &dyn Fn(&NodePath) -> bool) {}
    }

    fn start(ns: &Arc<MemoryNamespace>, rt: &tokio::runtime::Runtime) -> WatchedTreeCache {
        let client: Arc<dyn NamespaceClient> = Arc::clone(ns) as Arc<dyn NamespaceClient>;
        WatchedTreeCache::start(
            rt.handle(),
            client,
            NodePath::root(),
            RetryPolicy::new(Duration::from_millis(5), 3),
            Arc::new(NullListener),
        )
    }

    fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_cache_mirrors_snapshot_and_live_changes() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let ns = Arc::new(MemoryNamespace::new());
        ns.create_node("/a", b"one").unwrap();

        let cache = start(&ns, &rt);
        cache.wait_ready(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(cache.state(), CacheState::Ready);
        assert_eq!(cache.get_children(&NodePath::root()).unwrap(), vec!["a"]);

        ns.create_node("/b", b"two").unwrap();
        assert!(eventually(|| cache.contains(&p("/b")).unwrap()));
        assert_eq!(cache.get_payload_and_stat(&p("/b")).unwrap().payload.as_ref(), b"two");
        cache.close();
    }

    #[test]
    fn test_cache_rebuilds_after_session_loss() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let ns = Arc::new(MemoryNamespace::new());
        let cache = start(&ns, &rt);
        cache.wait_ready(Some(Duration::from_secs(5))).unwrap();

        ns.expire_sessions();
        ns.create_node("/after", b"").unwrap();

        assert!(eventually(|| cache.rebuild_count() == 1 && cache.state() == CacheState::Ready));
        assert!(cache.contains(&p("/after")).unwrap());
        cache.close();
    }

    #[test]
    fn test_closed_cache_rejects_queries() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let ns = Arc::new(MemoryNamespace::new());
        let cache = start(&ns, &rt);
        cache.wait_ready(Some(Duration::from_secs(5))).unwrap();

        cache.close();
        assert_eq!(cache.state(), CacheState::Closed);
        assert!(matches!(
            cache.get_children(&NodePath::root()),
            Err(NamespaceError::Unavailable(_))
        ));
    }
}
