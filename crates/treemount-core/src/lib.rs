//! Mirror a remote hierarchical coordination namespace as a filesystem.
//!
//! The namespace is a tree of named nodes, each holding a small payload and
//! a set of children, kept consistent by an external coordination service
//! (etcd in production). This crate provides the transport-independent part
//! of mounting such a subtree:
//!
//! - [`client`]: the [`NamespaceClient`] trait with etcd and in-memory backends
//! - [`cache`]: [`WatchedTreeCache`], the watch-driven local mirror
//! - [`sync`]: [`MutationSynchronizer`], which holds mutations until the
//!   mirror has caught up
//! - [`adapter`]: [`PosixAdapter`], the path-based filesystem operations
//!
//! The kernel transport (FUSE) lives in `treemount-fuse`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use treemount_core::{MemoryNamespace, MountConfig, NodePath, PosixAdapter};
//!
//! let runtime = tokio::runtime::Runtime::new().unwrap();
//! let client = Arc::new(MemoryNamespace::new());
//! let adapter = PosixAdapter::new(runtime, client, NodePath::root(), MountConfig::default());
//! adapter.init(None).unwrap();
//!
//! let dir = NodePath::parse("/config").unwrap();
//! adapter.mkdir(&dir).unwrap();
//! assert_eq!(adapter.readdir(&dir).unwrap(), vec![".empty"]);
//! ```

pub mod adapter;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod path;
pub mod sync;

pub use adapter::{DIR_PERM, FILE_PERM, NodeAttr, NodeKind, PosixAdapter, SENTINEL_NAME};
pub use cache::{CacheListener, CacheState, EventKind, WatchedTreeCache};
pub use client::{
    EtcdNamespace, MemoryNamespace, NamespaceClient, NodeData, NodeStat, Notification,
    NotificationStream, RetryPolicy,
};
pub use config::MountConfig;
pub use error::{ErrorCategory, NamespaceError, NamespaceResult};
pub use path::NodePath;
pub use sync::{MutationKind, MutationSynchronizer, SyncStats};
