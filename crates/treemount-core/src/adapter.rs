//! Path-based filesystem operations over a mirrored namespace.
//!
//! [`PosixAdapter`] is what the kernel transport calls into. Paths are
//! mount-relative (`/` is the subtree root) and are joined onto the
//! configured root before touching the namespace.
//!
//! Reads (`readdir`, `getattr`, `read`) are answered from the
//! [`WatchedTreeCache`] without a remote round trip. `create`, `mkdir`,
//! `unlink` and `rmdir` go to the remote namespace through the
//! [`MutationSynchronizer`] and return only once the mirror shows the
//! change. `write` replaces the payload and returns as soon as the remote
//! call does.
//!
//! A node with children is a directory; a node without is a regular file
//! whose content is its payload. `mkdir` therefore creates a sentinel child
//! ([`SENTINEL_NAME`]) so an empty directory stays a directory.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Runtime;
use tracing::{debug, info, trace};

use crate::cache::WatchedTreeCache;
use crate::client::{NamespaceClient, NodeStat};
use crate::config::MountConfig;
use crate::error::{NamespaceError, NamespaceResult};
use crate::path::NodePath;
use crate::sync::{MutationKind, MutationSynchronizer};

/// Child created by `mkdir` so the directory always has a child.
pub const SENTINEL_NAME: &str = ".empty";

/// Permission bits reported for directories.
pub const DIR_PERM: u16 = 0o755;

/// Permission bits reported for regular files.
pub const FILE_PERM: u16 = 0o777;

/// Filesystem object type derived from a node's stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    RegularFile,
}

impl NodeKind {
    /// Classifies a node. Children win over payload; the mount root is
    /// always a directory.
    pub fn classify(stat: &NodeStat, is_mount_root: bool) -> Self {
        if is_mount_root || stat.num_children > 0 {
            NodeKind::Directory
        } else {
            NodeKind::RegularFile
        }
    }
}

/// Attributes reported by `getattr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub kind: NodeKind,
    pub perm: u16,
    pub size: u64,
    pub nlink: u32,
}

impl NodeAttr {
    fn from_stat(stat: &NodeStat, is_mount_root: bool) -> Self {
        match NodeKind::classify(stat, is_mount_root) {
            NodeKind::Directory => Self {
                kind: NodeKind::Directory,
                perm: DIR_PERM,
                size: 0,
                nlink: 2,
            },
            NodeKind::RegularFile => Self {
                kind: NodeKind::RegularFile,
                perm: FILE_PERM,
                size: stat.data_length as u64,
                nlink: 1,
            },
        }
    }
}

/// Filesystem operation set over a mirrored namespace subtree.
pub struct PosixAdapter {
    runtime: Runtime,
    client: Arc<dyn NamespaceClient>,
    root: NodePath,
    config: MountConfig,
    sync: Arc<MutationSynchronizer>,
    cache: WatchedTreeCache,
}

impl PosixAdapter {
    /// Starts mirroring `root` on `runtime`.
    ///
    /// The mirror builds in the background; [`init`](Self::init) waits for it.
    pub fn new(
        runtime: Runtime,
        client: Arc<dyn NamespaceClient>,
        root: NodePath,
        config: MountConfig,
    ) -> Self {
        let sync = Arc::new(MutationSynchronizer::new());
        let cache = WatchedTreeCache::start(
            runtime.handle(),
            Arc::clone(&client),
            root.clone(),
            config.retry,
            Arc::clone(&sync) as Arc<dyn crate::cache::CacheListener>,
        );
        Self {
            runtime,
            client,
            root,
            config,
            sync,
            cache,
        }
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// Namespace path of the mount root.
    pub fn root(&self) -> &NodePath {
        &self.root
    }

    pub fn cache(&self) -> &WatchedTreeCache {
        &self.cache
    }

    pub fn synchronizer(&self) -> &MutationSynchronizer {
        &self.sync
    }

    /// Blocks until the mirror is ready, or `timeout` elapses.
    pub fn init(&self, timeout: Option<Duration>) -> NamespaceResult<()> {
        self.cache.wait_ready(timeout)?;
        info!(root = %self.root, "namespace mirror ready");
        Ok(())
    }

    /// Closes the mirror and the client session.
    pub fn destroy(&self) {
        self.cache.close();
        self.runtime.block_on(self.client.close());
        let stats = self.sync.stats();
        info!(
            root = %self.root,
            completed = stats.completed,
            timed_out = stats.timed_out,
            abandoned = stats.abandoned,
            "namespace adapter shut down"
        );
    }

    fn resolve(&self, path: &NodePath) -> NodePath {
        self.root.join_path(path)
    }

    pub fn readdir(&self, path: &NodePath) -> NamespaceResult<Vec<String>> {
        trace!(path = %path, "readdir");
        let mut children = self.cache.get_children(&self.resolve(path))?;
        if self.config.hide_sentinel {
            children.retain(|name| name != SENTINEL_NAME);
        }
        Ok(children)
    }

    pub fn getattr(&self, path: &NodePath) -> NamespaceResult<NodeAttr> {
        trace!(path = %path, "getattr");
        let data = self.cache.get_payload_and_stat(&self.resolve(path))?;
        Ok(NodeAttr::from_stat(&data.stat, path.is_root()))
    }

    /// Returns the payload bytes in `[offset, offset + size)`, clamped.
    pub fn read(&self, path: &NodePath, size: u32, offset: u64) -> NamespaceResult<Bytes> {
        trace!(path = %path, size, offset, "read");
        let payload = self.cache.get_payload_and_stat(&self.resolve(path))?.payload;
        let len = payload.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
        let end = start.saturating_add(size as usize).min(len);
        Ok(payload.slice(start..end))
    }

    /// Creates an empty file.
    pub fn create(&self, path: &NodePath) -> NamespaceResult<()> {
        trace!(path = %path, "create");
        let target = self.resolve(path);
        if self.cache.contains(&target)? {
            return Err(NamespaceError::AlreadyExists(path.to_string()));
        }
        self.create_node(&target)
    }

    /// Creates a directory: the node plus its sentinel child.
    pub fn mkdir(&self, path: &NodePath) -> NamespaceResult<()> {
        trace!(path = %path, "mkdir");
        let target = self.resolve(path);
        if self.cache.contains(&target)? {
            return Err(NamespaceError::AlreadyExists(path.to_string()));
        }
        self.create_node(&target)?;
        self.create_node(&target.join(SENTINEL_NAME))
    }

    /// Replaces the whole payload with `data`. `offset` is ignored.
    pub fn write(&self, path: &NodePath, data: &[u8], offset: u64) -> NamespaceResult<usize> {
        trace!(path = %path, len = data.len(), offset, "write");
        let target = self.resolve(path);
        self.runtime
            .block_on(self.client.set_payload(&target, data))?;
        Ok(data.len())
    }

    /// Accepted and ignored.
    pub fn truncate(&self, path: &NodePath, size: u64) -> NamespaceResult<()> {
        trace!(path = %path, size, "truncate ignored");
        Ok(())
    }

    pub fn unlink(&self, path: &NodePath) -> NamespaceResult<()> {
        trace!(path = %path, "unlink");
        let target = self.resolve(path);
        if self.is_sentinel(path, &target)? {
            debug!(path = %path, "keeping directory sentinel");
            return Ok(());
        }
        self.delete_node(&target)
    }

    /// A sentinel is an empty, childless `.empty` below a directory other
    /// than the mount root. Anything else with that name is a user file.
    fn is_sentinel(&self, path: &NodePath, target: &NodePath) -> NamespaceResult<bool> {
        if path.name() != SENTINEL_NAME || path.parent().is_none_or(|p| p.is_root()) {
            return Ok(false);
        }
        match self.cache.get_payload_and_stat(target) {
            Ok(data) => Ok(data.stat.num_children == 0 && data.payload.is_empty()),
            Err(NamespaceError::NotFound(_)) => Err(NamespaceError::NotFound(path.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Removes a directory and everything below it.
    pub fn rmdir(&self, path: &NodePath) -> NamespaceResult<()> {
        trace!(path = %path, "rmdir");
        self.delete_node(&self.resolve(path))
    }

    fn create_node(&self, target: &NodePath) -> NamespaceResult<()> {
        self.sync.execute(
            target,
            MutationKind::Create,
            self.config.mutation_timeout,
            || self.runtime.block_on(self.client.create(target, &[])),
        )
    }

    fn delete_node(&self, target: &NodePath) -> NamespaceResult<()> {
        if target == &self.root {
            return Err(NamespaceError::Rejected(
                "the mount root cannot be removed".to_string(),
            ));
        }
        self.sync.execute(
            target,
            MutationKind::Delete,
            self.config.mutation_timeout,
            || self.runtime.block_on(self.client.delete(target)),
        )
    }
}

impl Drop for PosixAdapter {
    fn drop(&mut self) {
        self.cache.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_make_a_directory() {
        let stat = NodeStat {
            num_children: 1,
            data_length: 10,
        };
        let attr = NodeAttr::from_stat(&stat, false);
        assert_eq!(attr.kind, NodeKind::Directory);
        assert_eq!(attr.perm, 0o755);
        assert_eq!(attr.size, 0);
    }

    #[test]
    fn test_leaf_is_a_file_sized_by_payload() {
        let stat = NodeStat {
            num_children: 0,
            data_length: 5,
        };
        let attr = NodeAttr::from_stat(&stat, false);
        assert_eq!(attr.kind, NodeKind::RegularFile);
        assert_eq!(attr.perm, 0o777);
        assert_eq!(attr.size, 5);
        assert_eq!(attr.nlink, 1);
    }

    #[test]
    fn test_mount_root_is_always_a_directory() {
        let attr = NodeAttr::from_stat(&NodeStat::default(), true);
        assert_eq!(attr.kind, NodeKind::Directory);
    }
}
