//! etcd v3 backend.
//!
//! Every node is one key whose name is the node path and whose value is the
//! payload. A node's children are the keys under `path/` with exactly one
//! more segment. Structural rules (no orphans, no duplicate creates) are
//! enforced with transactions that compare key versions.
//!
//! Subscriptions read a prefix snapshot, remember its revision and start a
//! prefix watch at the next revision, so no change falls between the two.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions, Txn, TxnOp,
    WatchOptions, WatchStream, Watcher,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::{
    NamespaceClient, NodeData, NodeStat, Notification, NotificationStream, RetryPolicy,
    retry_with_backoff,
};
use crate::error::{NamespaceError, NamespaceResult};
use crate::path::NodePath;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Namespace client backed by an etcd cluster.
pub struct EtcdNamespace {
    client: Client,
    retry: RetryPolicy,
}

impl EtcdNamespace {
    /// Connects to `endpoints` and makes sure `root` and its ancestors exist.
    pub async fn connect(
        endpoints: &[String],
        root: &NodePath,
        retry: RetryPolicy,
    ) -> NamespaceResult<Self> {
        let client = retry_with_backoff(&retry, "connect", || async move {
            let options = ConnectOptions::new()
                .with_connect_timeout(CONNECT_TIMEOUT)
                .with_timeout(REQUEST_TIMEOUT);
            Client::connect(endpoints, Some(options))
                .await
                .map_err(NamespaceError::from)
        })
        .await?;

        let namespace = Self { client, retry };
        namespace.ensure_path(root).await?;
        info!(endpoints = ?endpoints, root = %root, "connected to etcd");
        Ok(namespace)
    }

    /// Client handle for a single request.
    fn kv(&self) -> Client {
        self.client.clone()
    }

    /// Creates `path` and any missing ancestors with empty payloads.
    async fn ensure_path(&self, path: &NodePath) -> NamespaceResult<()> {
        let mut chain = vec![path.clone()];
        let mut current = path.clone();
        while let Some(parent) = current.parent() {
            chain.push(parent.clone());
            current = parent;
        }

        for node in chain.into_iter().rev() {
            retry_with_backoff(&self.retry, "ensure_path", || {
                let mut client = self.kv();
                let key = node.as_str().to_string();
                async move {
                    let txn = Txn::new()
                        .when([Compare::version(key.clone(), CompareOp::Equal, 0)])
                        .and_then([TxnOp::put(key, Vec::new(), None)]);
                    client.txn(txn).await?;
                    Ok(())
                }
            })
            .await?;
        }
        Ok(())
    }

    async fn child_names(client: &mut Client, path: &NodePath) -> NamespaceResult<Vec<String>> {
        let prefix = path.descendant_prefix();
        let resp = client
            .get(
                prefix.clone(),
                Some(GetOptions::new().with_prefix().with_keys_only()),
            )
            .await?;
        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| std::str::from_utf8(kv.key()).ok())
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter(|rest| !rest.is_empty() && !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }
}

/// Maps a watched key back to a node path, skipping keys that are not
/// normalized paths inside `root`.
fn key_to_path(key: &[u8], root: &NodePath) -> Option<NodePath> {
    let key = std::str::from_utf8(key).ok()?;
    let path = NodePath::parse(key).ok()?;
    (path.as_str() == key && path.starts_with(root)).then_some(path)
}

#[async_trait]
impl NamespaceClient for EtcdNamespace {
    async fn create(&self, path: &NodePath, payload: &[u8]) -> NamespaceResult<()> {
        let Some(parent) = path.parent() else {
            return Err(NamespaceError::AlreadyExists(path.to_string()));
        };

        retry_with_backoff(&self.retry, "create", || {
            let mut client = self.kv();
            let key = path.as_str().to_string();
            let parent_key = parent.as_str().to_string();
            let payload = payload.to_vec();
            async move {
                let txn = Txn::new()
                    .when([
                        Compare::version(key.clone(), CompareOp::Equal, 0),
                        Compare::version(parent_key.clone(), CompareOp::Greater, 0),
                    ])
                    .and_then([TxnOp::put(key.clone(), payload, None)]);
                if client.txn(txn).await?.succeeded() {
                    trace!(key = %key, "created");
                    return Ok(());
                }

                let existing = client
                    .get(key.clone(), Some(GetOptions::new().with_count_only()))
                    .await?;
                if existing.count() > 0 {
                    Err(NamespaceError::AlreadyExists(key))
                } else {
                    Err(NamespaceError::NotFound(parent_key))
                }
            }
        })
        .await
    }

    async fn delete(&self, path: &NodePath) -> NamespaceResult<()> {
        if path.is_root() {
            return Err(NamespaceError::Rejected(
                "the namespace root cannot be deleted".to_string(),
            ));
        }

        retry_with_backoff(&self.retry, "delete", || {
            let mut client = self.kv();
            let key = path.as_str().to_string();
            let prefix = path.descendant_prefix();
            async move {
                let txn = Txn::new()
                    .when([Compare::version(key.clone(), CompareOp::Greater, 0)])
                    .and_then([
                        TxnOp::delete(prefix, Some(DeleteOptions::new().with_prefix())),
                        TxnOp::delete(key.clone(), None),
                    ]);
                if client.txn(txn).await?.succeeded() {
                    trace!(key = %key, "deleted subtree");
                    Ok(())
                } else {
                    Err(NamespaceError::NotFound(key))
                }
            }
        })
        .await
    }

    async fn set_payload(&self, path: &NodePath, payload: &[u8]) -> NamespaceResult<()> {
        retry_with_backoff(&self.retry, "set_payload", || {
            let mut client = self.kv();
            let key = path.as_str().to_string();
            let payload = payload.to_vec();
            async move {
                let txn = Txn::new()
                    .when([Compare::version(key.clone(), CompareOp::Greater, 0)])
                    .and_then([TxnOp::put(key.clone(), payload, None)]);
                if client.txn(txn).await?.succeeded() {
                    Ok(())
                } else {
                    Err(NamespaceError::NotFound(key))
                }
            }
        })
        .await
    }

    async fn get_children(&self, path: &NodePath) -> NamespaceResult<Vec<String>> {
        retry_with_backoff(&self.retry, "get_children", || {
            let mut client = self.kv();
            async move {
                let exists = client
                    .get(path.as_str(), Some(GetOptions::new().with_count_only()))
                    .await?;
                if exists.count() == 0 {
                    return Err(NamespaceError::NotFound(path.to_string()));
                }
                Self::child_names(&mut client, path).await
            }
        })
        .await
    }

    async fn get_payload_and_stat(&self, path: &NodePath) -> NamespaceResult<NodeData> {
        retry_with_backoff(&self.retry, "get_payload_and_stat", || {
            let mut client = self.kv();
            async move {
                let resp = client.get(path.as_str(), None).await?;
                let Some(kv) = resp.kvs().first() else {
                    return Err(NamespaceError::NotFound(path.to_string()));
                };
                let payload = Bytes::copy_from_slice(kv.value());
                let num_children = Self::child_names(&mut client, path).await?.len();
                Ok(NodeData {
                    stat: NodeStat {
                        num_children,
                        data_length: payload.len(),
                    },
                    payload,
                })
            }
        })
        .await
    }

    async fn subscribe(&self, root: &NodePath) -> NamespaceResult<NotificationStream> {
        let (entries, revision) = retry_with_backoff(&self.retry, "snapshot", || {
            let mut client = self.kv();
            async move {
                let resp = client
                    .get(root.as_str(), Some(GetOptions::new().with_prefix()))
                    .await?;
                let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
                let entries: Vec<(NodePath, Bytes)> = resp
                    .kvs()
                    .iter()
                    .filter_map(|kv| {
                        key_to_path(kv.key(), root)
                            .map(|path| (path, Bytes::copy_from_slice(kv.value())))
                    })
                    .collect();
                Ok((entries, revision))
            }
        })
        .await?;

        let (watcher, stream) = retry_with_backoff(&self.retry, "watch", || {
            let mut client = self.kv();
            async move {
                let options = WatchOptions::new()
                    .with_prefix()
                    .with_start_revision(revision + 1);
                client
                    .watch(root.as_str(), Some(options))
                    .await
                    .map_err(NamespaceError::from)
            }
        })
        .await?;

        let (tx, rx) = mpsc::unbounded_channel();

        let mut entries = entries;
        entries.sort_by(|(a, _), (b, _)| a.depth().cmp(&b.depth()).then_with(|| a.cmp(b)));
        debug!(root = %root, nodes = entries.len(), revision, "snapshot loaded");
        for (path, payload) in entries {
            let _ = tx.send(Notification::NodeAdded { path, payload });
        }
        let _ = tx.send(Notification::Initialized);

        tokio::spawn(forward_watch(root.clone(), watcher, stream, tx));
        Ok(rx)
    }
}

/// Translates watch responses into notifications until the watch or the
/// receiver goes away.
async fn forward_watch(
    root: NodePath,
    mut watcher: Watcher,
    mut stream: WatchStream,
    tx: mpsc::UnboundedSender<Notification>,
) {
    loop {
        let message = tokio::select! {
            () = tx.closed() => {
                debug!(root = %root, "subscriber dropped, cancelling watch");
                break;
            }
            message = stream.message() => message,
        };

        let resp = match message {
            Ok(Some(resp)) => resp,
            Ok(None) => {
                warn!(root = %root, "etcd watch stream closed");
                break;
            }
            Err(e) => {
                warn!(root = %root, error = %e, "etcd watch stream error");
                break;
            }
        };

        if resp.canceled() || resp.compact_revision() > 0 {
            warn!(
                root = %root,
                compact_revision = resp.compact_revision(),
                "etcd watch canceled"
            );
            break;
        }

        for event in resp.events() {
            let Some(kv) = event.kv() else {
                continue;
            };
            let Some(path) = key_to_path(kv.key(), &root) else {
                continue;
            };
            let notification = match event.event_type() {
                EventType::Put if kv.version() == 1 => Notification::NodeAdded {
                    path,
                    payload: Bytes::copy_from_slice(kv.value()),
                },
                EventType::Put => Notification::NodeUpdated {
                    path,
                    payload: Bytes::copy_from_slice(kv.value()),
                },
                EventType::Delete => Notification::NodeRemoved { path },
            };
            if tx.send(notification).is_err() {
                let _ = watcher.cancel().await;
                return;
            }
        }
    }

    let _ = watcher.cancel().await;
}
