//! In-process namespace.
//!
//! Holds the whole tree behind one mutex and pushes notifications to every
//! subscriber synchronously from inside the mutating call, so notification
//! order is the mutation order. Besides the [`NamespaceClient`] surface it
//! exposes direct, synchronous mutators that play the role of *other*
//! clients sharing the namespace, and fault injection:
//!
//! - [`MemoryNamespace::pause_delivery`] / [`MemoryNamespace::resume_delivery`]
//!   hold back notifications without losing them.
//! - [`MemoryNamespace::expire_sessions`] ends every subscription.
//! - [`MemoryNamespace::set_available`] makes this client's calls fail with
//!   `Unavailable` (other writers are unaffected).
//! - [`MemoryNamespace::inject`] delivers an arbitrary notification.

use std::collections::{BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{NamespaceClient, NodeData, NodeStat, Notification, NotificationStream};
use crate::error::{NamespaceError, NamespaceResult};
use crate::path::NodePath;

#[derive(Debug, Default)]
struct MemNode {
    payload: Bytes,
    children: BTreeSet<String>,
}

struct Subscriber {
    id: u64,
    root: NodePath,
    tx: mpsc::UnboundedSender<Notification>,
}

struct MemoryState {
    nodes: HashMap<NodePath, MemNode>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
    /// Notifications held back while delivery is paused.
    held: Option<VecDeque<(u64, Notification)>>,
    available: bool,
}

impl MemoryState {
    fn emit(&mut self, notification: Notification) {
        let Some(path) = notification.path().cloned() else {
            return;
        };
        let mut closed = Vec::new();
        for sub in &self.subscribers {
            if !path.starts_with(&sub.root) {
                continue;
            }
            match &mut self.held {
                Some(held) => held.push_back((sub.id, notification.clone())),
                None => {
                    if sub.tx.send(notification.clone()).is_err() {
                        closed.push(sub.id);
                    }
                }
            }
        }
        if !closed.is_empty() {
            self.subscribers.retain(|s| !closed.contains(&s.id));
        }
    }

    fn create(&mut self, path: &NodePath, payload: &[u8]) -> NamespaceResult<()> {
        if self.nodes.contains_key(path) {
            return Err(NamespaceError::AlreadyExists(path.to_string()));
        }
        let parent = path
            .parent()
            .ok_or_else(|| NamespaceError::AlreadyExists(path.to_string()))?;
        let parent_node = self
            .nodes
            .get_mut(&parent)
            .ok_or_else(|| NamespaceError::NotFound(parent.to_string()))?;
        parent_node.children.insert(path.name().to_string());
        let siblings = parent_node.children.clone();

        let payload = Bytes::copy_from_slice(payload);
        self.nodes.insert(
            path.clone(),
            MemNode {
                payload: payload.clone(),
                children: BTreeSet::new(),
            },
        );
        trace!(path = %path, "memory create");
        self.emit(Notification::NodeAdded {
            path: path.clone(),
            payload,
        });
        self.emit(Notification::ChildrenChanged {
            path: parent,
            children: siblings,
        });
        Ok(())
    }

    fn delete(&mut self, path: &NodePath) -> NamespaceResult<()> {
        if path.is_root() {
            return Err(NamespaceError::Rejected(
                "the namespace root cannot be deleted".to_string(),
            ));
        }
        if !self.nodes.contains_key(path) {
            return Err(NamespaceError::NotFound(path.to_string()));
        }
        self.delete_subtree(path);
        Ok(())
    }

    fn delete_subtree(&mut self, path: &NodePath) {
        let children: Vec<String> = self
            .nodes
            .get(path)
            .map(|n| n.children.iter().cloned().collect())
            .unwrap_or_default();
        for child in children {
            self.delete_subtree(&path.join(&child));
        }

        self.nodes.remove(path);
        trace!(path = %path, "memory delete");
        self.emit(Notification::NodeRemoved { path: path.clone() });

        if let Some(parent) = path.parent() {
            let siblings = self.nodes.get_mut(&parent).map(|node| {
                node.children.remove(path.name());
                node.children.clone()
            });
            if let Some(children) = siblings {
                self.emit(Notification::ChildrenChanged {
                    path: parent,
                    children,
                });
            }
        }
    }

    fn set_payload(&mut self, path: &NodePath, payload: &[u8]) -> NamespaceResult<()> {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| NamespaceError::NotFound(path.to_string()))?;
        let payload = Bytes::copy_from_slice(payload);
        node.payload = payload.clone();
        self.emit(Notification::NodeUpdated {
            path: path.clone(),
            payload,
        });
        Ok(())
    }

    /// Pre-order walk: every parent precedes its children.
    fn snapshot(&self, root: &NodePath, out: &mut Vec<Notification>) {
        let Some(node) = self.nodes.get(root) else {
            return;
        };
        out.push(Notification::NodeAdded {
            path: root.clone(),
            payload: node.payload.clone(),
        });
        for child in &node.children {
            self.snapshot(&root.join(child), out);
        }
    }

    fn check_available(&self) -> NamespaceResult<()> {
        if self.available {
            Ok(())
        } else {
            Err(NamespaceError::Unavailable(
                "memory namespace marked unavailable".to_string(),
            ))
        }
    }
}

/// In-process namespace with fault injection.
pub struct MemoryNamespace {
    state: Mutex<MemoryState>,
}

impl Default for MemoryNamespace {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNamespace {
    /// Creates a namespace containing only the root node.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(NodePath::root(), MemNode::default());
        Self {
            state: Mutex::new(MemoryState {
                nodes,
                subscribers: Vec::new(),
                next_subscriber: 0,
                held: None,
                available: true,
            }),
        }
    }

    /// Creates a node as another client would.
    pub fn create_node(&self, path: &str, payload: &[u8]) -> NamespaceResult<()> {
        let path = NodePath::parse(path)?;
        self.state.lock().create(&path, payload)
    }

    /// Creates `path` and any missing ancestors with empty payloads.
    pub fn ensure_path(&self, path: &NodePath) {
        let mut chain = vec![path.clone()];
        let mut current = path.clone();
        while let Some(parent) = current.parent() {
            chain.push(parent.clone());
            current = parent;
        }
        let mut state = self.state.lock();
        for node in chain.into_iter().rev() {
            if !state.nodes.contains_key(&node) {
                let _ = state.create(&node, &[]);
            }
        }
    }

    /// Recursively deletes a node as another client would.
    pub fn delete_node(&self, path: &str) -> NamespaceResult<()> {
        let path = NodePath::parse(path)?;
        self.state.lock().delete(&path)
    }

    /// Replaces a payload as another client would.
    pub fn set_node_payload(&self, path: &str, payload: &[u8]) -> NamespaceResult<()> {
        let path = NodePath::parse(path)?;
        self.state.lock().set_payload(&path, payload)
    }

    /// Reads a payload directly, bypassing availability.
    pub fn node_payload(&self, path: &str) -> Option<Bytes> {
        let path = NodePath::parse(path).ok()?;
        self.state.lock().nodes.get(&path).map(|n| n.payload.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        NodePath::parse(path).is_ok_and(|p| self.state.lock().nodes.contains_key(&p))
    }

    /// Holds back notifications until [`resume_delivery`](Self::resume_delivery).
    pub fn pause_delivery(&self) {
        let mut state = self.state.lock();
        if state.held.is_none() {
            state.held = Some(VecDeque::new());
        }
    }

    /// Delivers every held notification in order and resumes live delivery.
    pub fn resume_delivery(&self) {
        let mut state = self.state.lock();
        let Some(held) = state.held.take() else {
            return;
        };
        debug!(count = held.len(), "releasing held notifications");
        for (id, notification) in held {
            if let Some(sub) = state.subscribers.iter().find(|s| s.id == id) {
                let _ = sub.tx.send(notification);
            }
        }
    }

    /// Ends every subscription, as a session expiry would.
    pub fn expire_sessions(&self) {
        let mut state = self.state.lock();
        debug!(count = state.subscribers.len(), "expiring subscriptions");
        state.subscribers.clear();
        if let Some(held) = state.held.as_mut() {
            held.clear();
        }
    }

    /// Makes calls through the [`NamespaceClient`] surface fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Delivers `notification` to every subscriber whose subtree contains it.
    pub fn inject(&self, notification: Notification) {
        self.state.lock().emit(notification);
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

#[async_trait]
impl NamespaceClient for MemoryNamespace {
    async fn create(&self, path: &NodePath, payload: &[u8]) -> NamespaceResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.create(path, payload)
    }

    async fn delete(&self, path: &NodePath) -> NamespaceResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.delete(path)
    }

    async fn set_payload(&self, path: &NodePath, payload: &[u8]) -> NamespaceResult<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.set_payload(path, payload)
    }

    async fn get_children(&self, path: &NodePath) -> NamespaceResult<Vec<String>> {
        let state = self.state.lock();
        state.check_available()?;
        state
            .nodes
            .get(path)
            .map(|n| n.children.iter().cloned().collect())
            .ok_or_else(|| NamespaceError::NotFound(path.to_string()))
    }

    async fn get_payload_and_stat(&self, path: &NodePath) -> NamespaceResult<NodeData> {
        let state = self.state.lock();
        state.check_available()?;
        state
            .nodes
            .get(path)
            .map(|n| NodeData {
                payload: n.payload.clone(),
                stat: NodeStat {
                    num_children: n.children.len(),
                    data_length: n.payload.len(),
                },
            })
            .ok_or_else(|| NamespaceError::NotFound(path.to_string()))
    }

    async fn subscribe(&self, root: &NodePath) -> NamespaceResult<NotificationStream> {
        let mut state = self.state.lock();
        state.check_available()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut snapshot = Vec::new();
        state.snapshot(root, &mut snapshot);
        for notification in snapshot {
            let _ = tx.send(notification);
        }
        let _ = tx.send(Notification::Initialized);

        let id = state.next_subscriber;
        state.next_subscriber += 1;
        state.subscribers.push(Subscriber {
            id,
            root: root.clone(),
            tx,
        });
        debug!(root = %root, subscriber = id, "memory subscription established");
        Ok(rx)
    }

    async fn close(&self) {
        self.state.lock().subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(raw: &str) -> NodePath {
        NodePath::parse(raw).unwrap()
    }

    fn drain(rx: &mut NotificationStream) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(n);
        }
        out
    }

    #[tokio::test]
    async fn test_create_requires_parent() {
        let ns = MemoryNamespace::new();
        let err = ns.create(&p("/a/b"), b"").await.unwrap_err();
        assert!(matches!(err, NamespaceError::NotFound(_)));

        ns.create(&p("/a"), b"").await.unwrap();
        ns.create(&p("/a/b"), b"x").await.unwrap();
        let err = ns.create(&p("/a/b"), b"").await.unwrap_err();
        assert!(matches!(err, NamespaceError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_delete_is_recursive() {
        let ns = MemoryNamespace::new();
        ns.create_node("/a", b"").unwrap();
        ns.create_node("/a/b", b"").unwrap();
        ns.create_node("/a/b/c", b"").unwrap();
        ns.create_node("/z", b"").unwrap();

        ns.delete(&p("/a")).await.unwrap();
        assert!(!ns.exists("/a"));
        assert!(!ns.exists("/a/b/c"));
        assert!(ns.exists("/z"));

        let err = ns.delete(&p("/a")).await.unwrap_err();
        assert!(matches!(err, NamespaceError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stat_reports_children_and_length() {
        let ns = MemoryNamespace::new();
        ns.create_node("/a", b"hello").unwrap();
        ns.create_node("/a/x", b"").unwrap();

        let data = ns.get_payload_and_stat(&p("/a")).await.unwrap();
        assert_eq!(data.payload.as_ref(), b"hello");
        assert_eq!(data.stat.num_children, 1);
        assert_eq!(data.stat.data_length, 5);
        assert_eq!(ns.get_children(&p("/a")).await.unwrap(), vec!["x"]);
    }

    #[tokio::test]
    async fn test_subscribe_snapshot_then_initialized() {
        let ns = MemoryNamespace::new();
        ns.create_node("/app", b"").unwrap();
        ns.create_node("/app/b", b"2").unwrap();
        ns.create_node("/app/a", b"1").unwrap();
        ns.create_node("/other", b"").unwrap();

        let mut rx = ns.subscribe(&p("/app")).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                Notification::NodeAdded {
                    path: p("/app"),
                    payload: Bytes::new()
                },
                Notification::NodeAdded {
                    path: p("/app/a"),
                    payload: Bytes::from_static(b"1")
                },
                Notification::NodeAdded {
                    path: p("/app/b"),
                    payload: Bytes::from_static(b"2")
                },
                Notification::Initialized,
            ]
        );
    }

    #[tokio::test]
    async fn test_live_events_are_scoped_to_subtree() {
        let ns = MemoryNamespace::new();
        ns.create_node("/app", b"").unwrap();
        let mut rx = ns.subscribe(&p("/app")).await.unwrap();
        drain(&mut rx);

        ns.create_node("/elsewhere", b"").unwrap();
        ns.create_node("/app/f", b"").unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], Notification::NodeAdded { path, .. } if path == &p("/app/f")));
        assert!(matches!(&events[1], Notification::ChildrenChanged { path, children }
            if path == &p("/app") && children.contains("f")));
    }

    #[tokio::test]
    async fn test_recursive_delete_notifies_children_first() {
        let ns = MemoryNamespace::new();
        ns.create_node("/a", b"").unwrap();
        ns.create_node("/a/b", b"").unwrap();
        let mut rx = ns.subscribe(&NodePath::root()).await.unwrap();
        drain(&mut rx);

        ns.delete_node("/a").unwrap();
        let removed: Vec<NodePath> = drain(&mut rx)
            .into_iter()
            .filter_map(|n| match n {
                Notification::NodeRemoved { path } => Some(path),
                _ => None,
            })
            .collect();
        assert_eq!(removed, vec![p("/a/b"), p("/a")]);
    }

    #[tokio::test]
    async fn test_paused_delivery_is_held_in_order() {
        let ns = MemoryNamespace::new();
        let mut rx = ns.subscribe(&NodePath::root()).await.unwrap();
        drain(&mut rx);

        ns.pause_delivery();
        ns.create_node("/x", b"").unwrap();
        ns.set_node_payload("/x", b"v2").unwrap();
        assert!(drain(&mut rx).is_empty());

        ns.resume_delivery();
        let events = drain(&mut rx);
        assert!(matches!(&events[0], Notification::NodeAdded { path, .. } if path == &p("/x")));
        assert!(matches!(events.last(), Some(Notification::NodeUpdated { payload, .. }) if payload.as_ref() == b"v2"));
    }

    #[tokio::test]
    async fn test_expire_sessions_ends_streams() {
        let ns = MemoryNamespace::new();
        let mut rx = ns.subscribe(&NodePath::root()).await.unwrap();
        drain(&mut rx);
        assert_eq!(ns.subscriber_count(), 1);

        ns.expire_sessions();
        assert_eq!(ns.subscriber_count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_only_affects_client_surface() {
        let ns = MemoryNamespace::new();
        ns.set_available(false);

        let err = ns.create(&p("/a"), b"").await.unwrap_err();
        assert!(err.is_transient());
        assert!(ns.subscribe(&NodePath::root()).await.is_err());

        ns.create_node("/b", b"").unwrap();
        assert!(ns.exists("/b"));
    }

    #[test]
    fn test_ensure_path_creates_ancestors() {
        let ns = MemoryNamespace::new();
        ns.create_node("/a", b"keep").unwrap();
        ns.ensure_path(&p("/a/b/c"));
        assert!(ns.exists("/a/b"));
        assert!(ns.exists("/a/b/c"));
        assert_eq!(ns.node_payload("/a").unwrap().as_ref(), b"keep");
    }

    #[tokio::test]
    async fn test_root_cannot_be_deleted() {
        let ns = MemoryNamespace::new();
        let err = ns.delete(&NodePath::root()).await.unwrap_err();
        assert!(matches!(err, NamespaceError::Rejected(_)));
    }
}
