//! Mutation synchronizer.
//!
//! A mutating filesystem call must not return before its effect is visible
//! in the mirror, otherwise a `create` followed by `getattr` could miss the
//! new node. The handler registers a waiter for `(path, kind)` *before*
//! issuing the remote call, then blocks until the cache reports the
//! matching applied change or the deadline passes.
//!
//! Waiters carry unique ids. Signalling removes them from the registry and
//! a timed-out waiter deregisters itself by id, so a late notification
//! never resolves somebody else's wait on the same path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::cache::{CacheListener, EventKind};
use crate::error::{NamespaceError, NamespaceResult};
use crate::path::NodePath;

/// What a pending mutation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    /// The node appears at exactly this path.
    Create,
    /// The node disappears from exactly this path.
    Delete,
}

impl MutationKind {
    fn from_event(kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::Added => Some(Self::Create),
            EventKind::Removed => Some(Self::Delete),
            EventKind::Updated | EventKind::ChildrenChanged => None,
        }
    }
}

type WaiterKey = (NodePath, MutationKind);

struct Waiter {
    id: u64,
    tx: Sender<()>,
}

/// Snapshot of the synchronizer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub completed: u64,
    pub timed_out: u64,
    pub abandoned: u64,
}

/// Registry of in-flight mutations.
#[derive(Default)]
pub struct MutationSynchronizer {
    waiters: Mutex<HashMap<WaiterKey, Vec<Waiter>>>,
    next_id: AtomicU64,
    completed: AtomicU64,
    timed_out: AtomicU64,
    abandoned: AtomicU64,
}

impl MutationSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `(path, kind)`.
    ///
    /// Must happen before the remote call is issued.
    pub fn register(&self, path: &NodePath, kind: MutationKind) -> PendingMutation<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.waiters
            .lock()
            .entry((path.clone(), kind))
            .or_default()
            .push(Waiter { id, tx });
        trace!(path = %path, ?kind, id, "waiter registered");
        PendingMutation {
            sync: self,
            key: (path.clone(), kind),
            id,
            rx,
        }
    }

    /// Resolves every waiter for `(path, kind)`.
    pub fn notify(&self, path: &NodePath, kind: MutationKind) {
        let waiters = self.waiters.lock().remove(&(path.clone(), kind));
        if let Some(waiters) = waiters {
            for waiter in waiters {
                trace!(path = %path, ?kind, id = waiter.id, "waiter resolved");
                let _ = waiter.tx.try_send(());
            }
        }
    }

    /// Resolves waiters whose outcome is already visible in a rebuilt
    /// mirror: creates whose path exists, deletes whose path is gone.
    pub fn reconcile(&self, exists: &dyn Fn(&NodePath) -> bool) {
        let mut waiters = self.waiters.lock();
        let satisfied: Vec<WaiterKey> = waiters
            .keys()
            .filter(|(path, kind)| match kind {
                MutationKind::Create => exists(path),
                MutationKind::Delete => !exists(path),
            })
            .cloned()
            .collect();
        for key in satisfied {
            if let Some(resolved) = waiters.remove(&key) {
                debug!(path = %key.0, kind = ?key.1, count = resolved.len(), "waiters resolved by resync");
                for waiter in resolved {
                    let _ = waiter.tx.try_send(());
                }
            }
        }
    }

    /// Registers, issues `call`, then waits up to `timeout` for the change.
    ///
    /// A failed call drops the waiter and returns the call's error.
    pub fn execute<F>(
        &self,
        path: &NodePath,
        kind: MutationKind,
        timeout: Duration,
        call: F,
    ) -> NamespaceResult<()>
    where
        F: FnOnce() -> NamespaceResult<()>,
    {
        self.register(path, kind).issue(call)?.wait(timeout)
    }

    /// Number of registered, unresolved waiters.
    pub fn pending_count(&self) -> usize {
        self.waiters.lock().values().map(Vec::len).sum()
    }

    pub fn stats(&self) -> SyncStats {
        SyncStats {
            completed: self.completed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    fn deregister(&self, key: &WaiterKey, id: u64) {
        let mut waiters = self.waiters.lock();
        if let Some(list) = waiters.get_mut(key) {
            list.retain(|w| w.id != id);
            if list.is_empty() {
                waiters.remove(key);
            }
        }
    }
}

impl CacheListener for MutationSynchronizer {
    fn on_applied(&self, path: &NodePath, kind: EventKind) {
        if let Some(kind) = MutationKind::from_event(kind) {
            self.notify(path, kind);
        }
    }

    fn on_resynced(&self, exists: &dyn Fn(&NodePath) -> bool) {
        self.reconcile(exists);
    }
}

/// A registered waiter. Dropping it deregisters.
pub struct PendingMutation<'a> {
    sync: &'a MutationSynchronizer,
    key: WaiterKey,
    id: u64,
    rx: Receiver<()>,
}

impl PendingMutation<'_> {
    /// Runs the remote call. On error the waiter is dropped.
    pub fn issue<F>(self, call: F) -> NamespaceResult<Self>
    where
        F: FnOnce() -> NamespaceResult<()>,
    {
        match call() {
            Ok(()) => Ok(self),
            Err(e) => {
                self.sync.abandoned.fetch_add(1, Ordering::Relaxed);
                debug!(path = %self.key.0, kind = ?self.key.1, error = %e, "mutation failed, waiter dropped");
                Err(e)
            }
        }
    }

    /// Blocks until the change is applied or `timeout` elapses.
    pub fn wait(self, timeout: Duration) -> NamespaceResult<()> {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => {
                self.sync.completed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                self.sync.timed_out.fetch_add(1, Ordering::Relaxed);
                warn!(path = %self.key.0, kind = ?self.key.1, ?timeout, "mutation not observed in time");
                Err(NamespaceError::Timeout {
                    path: self.key.0.to_string(),
                    after: timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(NamespaceError::Unavailable(
                "mutation waiter disconnected".to_string(),
            )),
        }
    }
}

impl Drop for PendingMutation<'_> {
    fn drop(&mut self) {
        self.sync.deregister(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn p(raw: &str) -> NodePath {
        NodePath::parse(raw).unwrap()
    }

    #[test]
    fn test_notify_resolves_matching_waiter() {
        let sync = Arc::new(MutationSynchronizer::new());
        let signaller = Arc::clone(&sync);

        let handle = thread::spawn(move || {
            while signaller.pending_count() == 0 {
                thread::yield_now();
            }
            signaller.on_applied(&p("/a"), EventKind::Added);
        });

        sync.execute(&p("/a"), MutationKind::Create, Duration::from_secs(5), || Ok(()))
            .unwrap();
        handle.join().unwrap();
        assert_eq!(sync.pending_count(), 0);
        assert_eq!(sync.stats().completed, 1);
    }

    #[test]
    fn test_kind_must_match() {
        let sync = MutationSynchronizer::new();
        let pending = sync.register(&p("/a"), MutationKind::Delete);
        sync.on_applied(&p("/a"), EventKind::Added);
        sync.on_applied(&p("/a"), EventKind::Updated);
        assert_eq!(sync.pending_count(), 1);

        let err = pending.wait(Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, NamespaceError::Timeout { .. }));
        assert_eq!(sync.pending_count(), 0);
        assert_eq!(sync.stats().timed_out, 1);
    }

    #[test]
    fn test_failed_call_drops_waiter() {
        let sync = MutationSynchronizer::new();
        let err = sync
            .execute(&p("/a"), MutationKind::Create, Duration::from_secs(5), || {
                Err(NamespaceError::AlreadyExists("/a".into()))
            })
            .unwrap_err();
        assert!(matches!(err, NamespaceError::AlreadyExists(_)));
        assert_eq!(sync.pending_count(), 0);
        assert_eq!(sync.stats().abandoned, 1);
    }

    #[test]
    fn test_late_event_does_not_resolve_new_waiter() {
        let sync = MutationSynchronizer::new();

        let stale = sync.register(&p("/a"), MutationKind::Create);
        assert!(stale.wait(Duration::from_millis(10)).is_err());

        let fresh = sync.register(&p("/a"), MutationKind::Delete);
        sync.on_applied(&p("/a"), EventKind::Added);
        assert_eq!(sync.pending_count(), 1);

        sync.on_applied(&p("/a"), EventKind::Removed);
        fresh.wait(Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_one_event_resolves_all_waiters_on_key() {
        let sync = MutationSynchronizer::new();
        let first = sync.register(&p("/a"), MutationKind::Delete);
        let second = sync.register(&p("/a"), MutationKind::Delete);
        sync.on_applied(&p("/a"), EventKind::Removed);
        first.wait(Duration::from_millis(10)).unwrap();
        second.wait(Duration::from_millis(10)).unwrap();
    }

    #[test]
    fn test_reconcile_after_resync() {
        let sync = MutationSynchronizer::new();
        let created = sync.register(&p("/new"), MutationKind::Create);
        let deleted = sync.register(&p("/gone"), MutationKind::Delete);
        let still_there = sync.register(&p("/kept"), MutationKind::Delete);

        sync.on_resynced(&|path: &NodePath| path.as_str() != "/gone");

        created.wait(Duration::from_millis(10)).unwrap();
        deleted.wait(Duration::from_millis(10)).unwrap();
        assert_eq!(sync.pending_count(), 1);
        drop(still_there);
        assert_eq!(sync.pending_count(), 0);
    }
}
