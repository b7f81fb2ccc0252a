//! Remote namespace client.
//!
//! The coordination service is reached through the [`NamespaceClient`]
//! trait. It exposes the point operations the adapter needs plus
//! [`NamespaceClient::subscribe`], which delivers an ordered
//! [`Notification`] stream for a subtree: the current contents as
//! `NodeAdded` events (parents before children), one `Initialized`, then
//! live changes. The stream ending means the subscription was lost.
//!
//! Backends:
//!
//! - [`EtcdNamespace`]: an etcd v3 cluster, one key per node.
//! - [`MemoryNamespace`]: in-process tree with fault injection, used by the
//!   test suites and `memory://` mounts.

mod etcd;
mod memory;
mod retry;

pub use etcd::EtcdNamespace;
pub use memory::MemoryNamespace;
pub use retry::{RetryPolicy, retry_with_backoff};

use std::collections::BTreeSet;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::NamespaceResult;
use crate::path::NodePath;

/// Ordered change notifications for a subscribed subtree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A node appeared (or is part of the initial snapshot).
    NodeAdded { path: NodePath, payload: Bytes },
    /// A node and, implicitly, its whole subtree disappeared.
    NodeRemoved { path: NodePath },
    /// A node's payload was replaced.
    NodeUpdated { path: NodePath, payload: Bytes },
    /// The full set of child names of `path` after a change.
    ChildrenChanged {
        path: NodePath,
        children: BTreeSet<String>,
    },
    /// The initial snapshot has been delivered in full.
    Initialized,
}

impl Notification {
    /// The path the notification concerns, `None` for `Initialized`.
    pub fn path(&self) -> Option<&NodePath> {
        match self {
            Notification::NodeAdded { path, .. }
            | Notification::NodeRemoved { path }
            | Notification::NodeUpdated { path, .. }
            | Notification::ChildrenChanged { path, .. } => Some(path),
            Notification::Initialized => None,
        }
    }
}

/// Receiving end of a subscription. `None` from `recv` means it was lost.
pub type NotificationStream = mpsc::UnboundedReceiver<Notification>;

/// Per-node metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStat {
    pub num_children: usize,
    pub data_length: usize,
}

/// A node's payload together with its stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeData {
    pub payload: Bytes,
    pub stat: NodeStat,
}

/// Operations against the remote coordination service.
///
/// Implementations retry transient failures internally; `NotFound` and
/// `AlreadyExists` are returned as-is.
#[async_trait]
pub trait NamespaceClient: Send + Sync + 'static {
    /// Creates `path` with `payload` and no children.
    ///
    /// Fails with `AlreadyExists` if the node exists and `NotFound` if its
    /// parent does not.
    async fn create(&self, path: &NodePath, payload: &[u8]) -> NamespaceResult<()>;

    /// Deletes `path` and its whole subtree, descendants first.
    async fn delete(&self, path: &NodePath) -> NamespaceResult<()>;

    /// Replaces the payload of an existing node.
    async fn set_payload(&self, path: &NodePath, payload: &[u8]) -> NamespaceResult<()>;

    /// Lists the names of the direct children of `path`.
    async fn get_children(&self, path: &NodePath) -> NamespaceResult<Vec<String>>;

    /// Reads a node's payload and stat.
    async fn get_payload_and_stat(&self, path: &NodePath) -> NamespaceResult<NodeData>;

    /// Subscribes to the subtree rooted at `root`.
    async fn subscribe(&self, root: &NodePath) -> NamespaceResult<NotificationStream>;

    /// Releases the session. Further calls may fail with `Unavailable`.
    async fn close(&self) {}
}
