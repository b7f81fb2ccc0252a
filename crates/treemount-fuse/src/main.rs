//! treemount - Mount a coordination namespace subtree as a FUSE filesystem.
//!
//! Usage: treemount <ENDPOINT> <ROOT> <MOUNTPOINT>
//!
//! `ENDPOINT` is a comma-separated list of etcd endpoints, or `memory://`
//! for a throwaway in-process namespace.
//!
//! ## Debugging with tokio-console
//!
//! Build with the `tokio-console` feature for async task introspection:
//! ```bash
//! cargo build -p treemount-fuse --features tokio-console
//! ```
//!
//! Then run `tokio-console` in another terminal to connect.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use treemount_core::{
    EtcdNamespace, MemoryNamespace, MountConfig, NamespaceClient, NodePath, PosixAdapter,
    RetryPolicy,
};
use treemount_fuse::{TreeFs, mount_options};

/// Endpoint selecting the in-process namespace.
const MEMORY_ENDPOINT: &str = "memory://";

/// How long startup waits for the initial snapshot.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "treemount")]
#[command(about = "Mount a coordination namespace subtree as a FUSE filesystem")]
#[command(version)]
struct Cli {
    /// Comma-separated etcd endpoints, or memory:// for an in-process namespace
    endpoint: String,

    /// Namespace path to mount (e.g. /app/config)
    root: String,

    /// Mountpoint for the filesystem
    mountpoint: PathBuf,

    /// Enable debug logging
    #[arg(short, long, env = "TREEMOUNT_DEBUG")]
    debug: bool,

    /// Mount as read-only (default: read-write)
    #[arg(long, env = "TREEMOUNT_READ_ONLY")]
    read_only: bool,

    /// How long create/delete wait for the change to show up, in milliseconds
    #[arg(long, env = "TREEMOUNT_MUTATION_TIMEOUT_MS", default_value_t = 10_000)]
    mutation_timeout_ms: u64,

    /// Kernel attribute cache TTL, in milliseconds
    #[arg(long, env = "TREEMOUNT_ATTR_TTL_MS", default_value_t = 1_000)]
    attr_ttl_ms: u64,

    /// Initial retry backoff for remote calls, in milliseconds
    #[arg(long, env = "TREEMOUNT_RETRY_BASE_MS", default_value_t = 1_000)]
    retry_base_ms: u64,

    /// Retries for a failing remote call before giving up
    #[arg(long, env = "TREEMOUNT_RETRIES", default_value_t = 5)]
    retries: u32,

    /// Hide the `.empty` directory sentinel from listings
    #[arg(long, env = "TREEMOUNT_HIDE_SENTINEL")]
    hide_sentinel: bool,
}

impl Cli {
    fn mount_config(&self) -> MountConfig {
        MountConfig::default()
            .mutation_timeout(Duration::from_millis(self.mutation_timeout_ms))
            .attr_ttl(Duration::from_millis(self.attr_ttl_ms))
            .retry(RetryPolicy::new(
                Duration::from_millis(self.retry_base_ms),
                self.retries,
            ))
            .hide_sentinel(self.hide_sentinel)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    init_tracing(filter);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("treemount-worker")
        .build()
        .context("Failed to create tokio runtime")?;

    let root = NodePath::parse(&cli.root).context("Invalid namespace root")?;
    let config = cli.mount_config();

    let client: Arc<dyn NamespaceClient> = if cli.endpoint == MEMORY_ENDPOINT {
        warn!("using an in-process namespace; contents are lost on unmount");
        let namespace = MemoryNamespace::new();
        namespace.ensure_path(&root);
        Arc::new(namespace)
    } else {
        let endpoints: Vec<String> = cli
            .endpoint
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect();
        if endpoints.is_empty() {
            anyhow::bail!("No etcd endpoints given");
        }
        info!(endpoints = ?endpoints, root = %root, "Connecting to etcd");
        Arc::new(
            runtime
                .block_on(EtcdNamespace::connect(&endpoints, &root, config.retry))
                .context("Failed to connect to the namespace")?,
        )
    };

    let adapter = PosixAdapter::new(runtime, client, root.clone(), config);
    adapter
        .init(Some(STARTUP_TIMEOUT))
        .context("Namespace mirror did not become ready")?;

    let fsname = format!("treemount:{root}");
    mount_and_wait(&cli, &fsname, TreeFs::new(adapter))
}

/// Adds the tokio-console layer; the console listens on its default address.
#[cfg(feature = "tokio-console")]
fn init_tracing(filter: &str) {
    use tracing_subscriber::Layer;

    let fmt_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::registry()
        .with(console_subscriber::spawn())
        .with(tracing_subscriber::fmt::layer().with_filter(fmt_filter))
        .init();
}

#[cfg(not(feature = "tokio-console"))]
fn init_tracing(filter: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Mount the filesystem and wait for Ctrl+C.
fn mount_and_wait(cli: &Cli, fsname: &str, fs: TreeFs) -> Result<()> {
    let options = mount_options(fsname, cli.read_only);

    let (tx, rx) = mpsc::channel::<()>();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("Failed to set signal handler")?;

    info!("Mounting filesystem (press Ctrl+C to unmount)");

    let session = fuser::spawn_mount2(fs, &cli.mountpoint, &options).map_err(|e| {
        error!(error = %e, "Mount failed");
        anyhow::anyhow!("Failed to mount filesystem: {e}")
    })?;

    info!("Filesystem mounted at {}", cli.mountpoint.display());

    match rx.recv() {
        Ok(()) => info!("Received interrupt signal, unmounting..."),
        Err(_) => warn!("Signal channel closed unexpectedly"),
    }

    drop(session);
    info!("Filesystem unmounted");
    Ok(())
}
