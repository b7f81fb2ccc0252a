//! Inode management for the FUSE filesystem.
//!
//! The kernel addresses everything by inode number while the adapter works
//! on mount-relative paths. This table keeps the two in sync.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use treemount_core::NodePath;

/// The root inode number (FUSE convention).
pub const ROOT_INODE: u64 = 1;

/// An entry in the inode table.
#[derive(Debug)]
pub struct InodeEntry {
    /// Mount-relative path of the node.
    pub path: NodePath,
    /// Lookup count for `forget()` handling.
    nlookup: AtomicU64,
}

impl InodeEntry {
    fn new(path: NodePath, nlookup: u64) -> Self {
        Self {
            path,
            nlookup: AtomicU64::new(nlookup),
        }
    }

    /// Increments the lookup count and returns the new value.
    pub fn inc_nlookup(&self) -> u64 {
        self.nlookup.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Decrements the lookup count by `count`.
    /// Returns `None` if the count would go negative.
    pub fn dec_nlookup(&self, count: u64) -> Option<u64> {
        let old = self.nlookup.fetch_sub(count, Ordering::SeqCst);
        if old < count {
            self.nlookup.fetch_add(count, Ordering::SeqCst);
            None
        } else {
            Some(old - count)
        }
    }

    pub fn nlookup(&self) -> u64 {
        self.nlookup.load(Ordering::SeqCst)
    }
}

/// Thread-safe bidirectional map between inode numbers and paths.
pub struct InodeTable {
    path_to_inode: DashMap<NodePath, u64>,
    inode_to_entry: DashMap<u64, InodeEntry>,
    next_inode: AtomicU64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Creates a table with the root pre-allocated.
    pub fn new() -> Self {
        let table = Self {
            path_to_inode: DashMap::new(),
            inode_to_entry: DashMap::new(),
            // Start at 2 since inode 1 is reserved for root
            next_inode: AtomicU64::new(2),
        };
        table.path_to_inode.insert(NodePath::root(), ROOT_INODE);
        table
            .inode_to_entry
            .insert(ROOT_INODE, InodeEntry::new(NodePath::root(), 1));
        table
    }

    /// Returns the inode for `path`, allocating one if needed, and counts a
    /// kernel lookup against it.
    pub fn get_or_insert(&self, path: NodePath) -> u64 {
        if let Some(inode) = self.path_to_inode.get(&path) {
            let ino = *inode;
            drop(inode);
            if let Some(entry) = self.inode_to_entry.get(&ino) {
                entry.inc_nlookup();
            }
            return ino;
        }
        self.insert_with(path, 1)
    }

    /// Returns the inode for `path` without counting a lookup.
    ///
    /// Used for `readdir` entries, which the kernel does not reference-count.
    pub fn allocate(&self, path: NodePath) -> u64 {
        if let Some(inode) = self.path_to_inode.get(&path) {
            return *inode;
        }
        self.insert_with(path, 0)
    }

    fn insert_with(&self, path: NodePath, nlookup: u64) -> u64 {
        // Entry API avoids racing allocations for the same path
        let inode = self.path_to_inode.entry(path.clone()).or_insert_with(|| {
            let ino = self.next_inode.fetch_add(1, Ordering::SeqCst);
            self.inode_to_entry
                .insert(ino, InodeEntry::new(path, nlookup));
            ino
        });
        *inode
    }

    /// Path of `inode`, if known.
    pub fn path(&self, inode: u64) -> Option<NodePath> {
        self.inode_to_entry.get(&inode).map(|e| e.path.clone())
    }

    pub fn get_inode(&self, path: &NodePath) -> Option<u64> {
        self.path_to_inode.get(path).map(|r| *r)
    }

    /// Decrements the lookup count; evicts the inode when it reaches zero.
    /// Returns `true` if the inode was evicted.
    pub fn forget(&self, inode: u64, nlookup: u64) -> bool {
        if inode == ROOT_INODE {
            return false;
        }

        if let Some(entry) = self.inode_to_entry.get(&inode)
            && let Some(remaining) = entry.dec_nlookup(nlookup)
            && remaining == 0
        {
            drop(entry);
            return self.evict(inode);
        }
        false
    }

    fn evict(&self, inode: u64) -> bool {
        if let Some((_, entry)) = self.inode_to_entry.remove(&inode) {
            self.path_to_inode
                .remove_if(&entry.path, |_, ino| *ino == inode);
            true
        } else {
            false
        }
    }

    /// Drops the path mappings of `path` and everything below it.
    ///
    /// Inode entries stay until the kernel forgets them.
    pub fn invalidate_subtree(&self, path: &NodePath) {
        self.path_to_inode
            .retain(|p, _| !p.starts_with(path) || p.is_root());
    }

    /// Number of inodes currently in the table.
    pub fn len(&self) -> usize {
        self.inode_to_entry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_entry.is_empty()
    }
}
