//! Shared harness for adapter integration tests.
//!
//! Every test gets a fresh in-memory namespace and an adapter mounted on
//! its root, with short timeouts so failure paths run quickly.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use treemount_core::{MemoryNamespace, MountConfig, NodePath, PosixAdapter, RetryPolicy};

pub const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// An adapter over a [`MemoryNamespace`] the test can poke directly.
pub struct TestAdapter {
    pub namespace: Arc<MemoryNamespace>,
    pub adapter: PosixAdapter,
}

impl TestAdapter {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: MountConfig) -> Self {
        Self::mounted_at(Arc::new(MemoryNamespace::new()), NodePath::root(), config)
    }

    /// Mounts `root` of an existing namespace.
    pub fn mounted_at(namespace: Arc<MemoryNamespace>, root: NodePath, config: MountConfig) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("failed to build runtime");
        let adapter = PosixAdapter::new(runtime, namespace.clone(), root, config);
        adapter.init(Some(READY_TIMEOUT)).expect("mirror never became ready");
        Self { namespace, adapter }
    }
}

impl Drop for TestAdapter {
    fn drop(&mut self) {
        self.adapter.destroy();
    }
}

pub fn test_config() -> MountConfig {
    MountConfig::default()
        .mutation_timeout(Duration::from_secs(5))
        .retry(RetryPolicy::new(Duration::from_millis(10), 3).max_delay(Duration::from_millis(100)))
}

pub fn p(raw: &str) -> NodePath {
    NodePath::parse(raw).expect("invalid test path")
}

/// Polls `check` until it holds or five seconds pass.
pub fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
