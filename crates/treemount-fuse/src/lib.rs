//! FUSE filesystem exposing a coordination namespace subtree.
//!
//! Kernel requests are translated to mount-relative paths through an inode
//! table and forwarded to [`treemount_core::PosixAdapter`], which answers
//! reads from a watch-driven mirror and synchronizes mutations with it.
//!
//! # Usage
//!
//! ```ignore
//! use treemount_fuse::{TreeFs, mount_options};
//!
//! let fs = TreeFs::new(adapter);
//! let session = fuser::spawn_mount2(fs, mountpoint, &mount_options("etcd:/app", false))?;
//! ```

pub mod filesystem;
pub mod inode;

pub use filesystem::TreeFs;
pub use inode::{InodeEntry, InodeTable, ROOT_INODE};

use fuser::MountOption;

/// Mount options for a namespace mount named `fsname`.
pub fn mount_options(fsname: &str, read_only: bool) -> Vec<MountOption> {
    vec![
        MountOption::FSName(fsname.to_string()),
        MountOption::Subtype("treemount".to_string()),
        MountOption::AutoUnmount,
        if read_only {
            MountOption::RO
        } else {
            MountOption::RW
        },
    ]
}
