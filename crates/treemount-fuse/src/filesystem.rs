//! FUSE filesystem over a mirrored coordination namespace.
//!
//! [`TreeFs`] implements the fuser `Filesystem` trait by resolving inode
//! numbers to mount-relative paths and forwarding to [`PosixAdapter`]. It
//! keeps no state of its own beyond the inode table; attributes and
//! listings always come from the adapter's mirror.

use crate::inode::{InodeTable, ROOT_INODE};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use std::ffi::OsStr;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, trace};
use treemount_core::{
    ErrorCategory, NamespaceError, NodeAttr, NodeKind, NodePath, PosixAdapter,
};

/// Block size for filesystem statistics.
const BLOCK_SIZE: u32 = 4096;

/// Converts an adapter error to an errno, logging remote failures.
fn errno(op: &str, path: &NodePath, e: &NamespaceError) -> c_int {
    match e.category() {
        ErrorCategory::RemoteIo => error!(op, path = %path, error = %e, "remote operation failed"),
        _ => debug!(op, path = %path, error = %e, "operation failed"),
    }
    e.to_errno()
}

fn file_type(kind: NodeKind) -> FileType {
    match kind {
        NodeKind::Directory => FileType::Directory,
        NodeKind::RegularFile => FileType::RegularFile,
    }
}

/// FUSE filesystem backed by a [`PosixAdapter`].
pub struct TreeFs {
    adapter: PosixAdapter,
    inodes: InodeTable,
    /// TTL handed to the kernel for attributes and entries.
    attr_ttl: Duration,
    uid: u32,
    gid: u32,
    /// Reported as every node's timestamps; the namespace keeps none.
    mounted_at: SystemTime,
}

impl TreeFs {
    /// Wraps `adapter`, owning files as the current user.
    pub fn new(adapter: PosixAdapter) -> Self {
        // SAFETY: getuid/getgid cannot fail and have no preconditions.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        Self::with_ownership(adapter, uid, gid)
    }

    pub fn with_ownership(adapter: PosixAdapter, uid: u32, gid: u32) -> Self {
        let attr_ttl = adapter.config().attr_ttl;
        info!(root = %adapter.root(), uid, gid, "TreeFs initialized");
        Self {
            adapter,
            inodes: InodeTable::new(),
            attr_ttl,
            uid,
            gid,
            mounted_at: SystemTime::now(),
        }
    }

    pub fn adapter(&self) -> &PosixAdapter {
        &self.adapter
    }

    fn make_attr(&self, ino: u64, attr: &NodeAttr) -> FileAttr {
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: self.mounted_at,
            mtime: self.mounted_at,
            ctime: self.mounted_at,
            crtime: self.mounted_at,
            kind: file_type(attr.kind),
            perm: attr.perm,
            nlink: attr.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn path_of(&self, ino: u64) -> Result<NodePath, c_int> {
        self.inodes.path(ino).ok_or(libc::ENOENT)
    }

    /// Resolves `name` below the directory `parent`.
    fn child_path(&self, parent: u64, name: &OsStr) -> Result<NodePath, c_int> {
        let parent = self.path_of(parent)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(libc::EINVAL);
        }
        Ok(parent.join(name))
    }

    /// Looks up `path`, counting a kernel reference on success.
    fn entry_attr(&self, op: &str, path: NodePath) -> Result<FileAttr, c_int> {
        let attr = self
            .adapter
            .getattr(&path)
            .map_err(|e| errno(op, &path, &e))?;
        let ino = self.inodes.get_or_insert(path);
        Ok(self.make_attr(ino, &attr))
    }
}

impl Filesystem for TreeFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        self.adapter
            .init(None)
            .map_err(|e| errno("init", &NodePath::root(), &e))?;
        info!("FUSE filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        self.adapter.destroy();
        info!("FUSE filesystem destroyed");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        trace!(parent, name = ?name, "lookup");
        let result = self
            .child_path(parent, name)
            .and_then(|path| self.entry_attr("lookup", path));
        match result {
            Ok(attr) => reply.entry(&self.attr_ttl, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        trace!(inode = ino, nlookup, "forget");
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        trace!(inode = ino, "getattr");
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.adapter.getattr(&path) {
            Ok(attr) => reply.attr(&self.attr_ttl, &self.make_attr(ino, &attr)),
            Err(e) => reply.error(errno("getattr", &path, &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        trace!(inode = ino, mode = ?mode, uid = ?uid, gid = ?gid, size = ?size, "setattr");

        // Modes, ownership and timestamps are fixed; only truncate is routed.
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        if let Some(size) = size
            && let Err(e) = self.adapter.truncate(&path, size)
        {
            reply.error(errno("truncate", &path, &e));
            return;
        }
        match self.adapter.getattr(&path) {
            Ok(attr) => reply.attr(&self.attr_ttl, &self.make_attr(ino, &attr)),
            Err(e) => reply.error(errno("setattr", &path, &e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!(inode = ino, offset, size, "read");
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.adapter.read(&path, size, offset) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &path, &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!(inode = ino, offset, size = data.len(), "write");
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let offset = u64::try_from(offset).unwrap_or(0);
        match self.adapter.write(&path, data, offset) {
            Ok(written) => reply.written(u32::try_from(written).unwrap_or(u32::MAX)),
            Err(e) => reply.error(errno("write", &path, &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        trace!(inode = ino, offset, "readdir");
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let children = match self.adapter.readdir(&path) {
            Ok(c) => c,
            Err(e) => {
                reply.error(errno("readdir", &path, &e));
                return;
            }
        };

        let parent_inode = path
            .parent()
            .and_then(|parent| self.inodes.get_inode(&parent))
            .unwrap_or(ROOT_INODE);

        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_inode, FileType::Directory, "..".to_string()),
        ];
        for name in children {
            let child = path.join(&name);
            // A child removed since the listing still gets an entry
            let kind = self
                .adapter
                .getattr(&child)
                .map_or(FileType::RegularFile, |a| file_type(a.kind));
            entries.push((self.inodes.allocate(child), kind, name));
        }

        let skip = usize::try_from(offset).unwrap_or(0);
        for (i, (entry_ino, kind, name)) in entries.iter().enumerate().skip(skip) {
            // buffer.add returns true if buffer is full
            if reply.add(*entry_ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        trace!(parent, name = ?name, "create");
        let result = self.child_path(parent, name).and_then(|path| {
            self.adapter
                .create(&path)
                .map_err(|e| errno("create", &path, &e))?;
            self.entry_attr("create", path)
        });
        match result {
            Ok(attr) => reply.created(&self.attr_ttl, &attr, 0, 0, 0),
            Err(e) => reply.error(e),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        trace!(parent, name = ?name, "mkdir");
        let result = self.child_path(parent, name).and_then(|path| {
            self.adapter
                .mkdir(&path)
                .map_err(|e| errno("mkdir", &path, &e))?;
            self.entry_attr("mkdir", path)
        });
        match result {
            Ok(attr) => reply.entry(&self.attr_ttl, &attr, 0),
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, name = ?name, "unlink");
        let result = self.child_path(parent, name).and_then(|path| {
            self.adapter
                .unlink(&path)
                .map_err(|e| errno("unlink", &path, &e))?;
            if self.adapter.getattr(&path).is_err() {
                self.inodes.invalidate_subtree(&path);
            }
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        trace!(parent, name = ?name, "rmdir");
        let result = self.child_path(parent, name).and_then(|path| {
            self.adapter
                .rmdir(&path)
                .map_err(|e| errno("rmdir", &path, &e))?;
            self.inodes.invalidate_subtree(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use treemount_core::{MemoryNamespace, MountConfig};

    fn fs() -> TreeFs {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let adapter = PosixAdapter::new(
            runtime,
            Arc::new(MemoryNamespace::new()),
            NodePath::root(),
            MountConfig::default(),
        );
        adapter.init(Some(Duration::from_secs(5))).unwrap();
        TreeFs::with_ownership(adapter, 1000, 1000)
    }

    #[test]
    fn test_make_attr_for_file() {
        let fs = fs();
        let attr = fs.make_attr(
            7,
            &NodeAttr {
                kind: NodeKind::RegularFile,
                perm: 0o777,
                size: 1025,
                nlink: 1,
            },
        );
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.uid, 1000);
        assert_eq!(attr.blksize, BLOCK_SIZE);
    }

    #[test]
    fn test_child_path_validation() {
        let fs = fs();
        assert_eq!(
            fs.child_path(ROOT_INODE, OsStr::new("a")).unwrap(),
            NodePath::parse("/a").unwrap()
        );
        assert_eq!(fs.child_path(ROOT_INODE, OsStr::new("..")), Err(libc::EINVAL));
        assert_eq!(fs.child_path(ROOT_INODE, OsStr::new("")), Err(libc::EINVAL));
        assert_eq!(fs.child_path(999, OsStr::new("a")), Err(libc::ENOENT));
    }

    #[test]
    fn test_entry_attr_allocates_inode() {
        let fs = fs();
        let dir = NodePath::parse("/d").unwrap();
        fs.adapter().mkdir(&dir).unwrap();

        let attr = fs.entry_attr("lookup", dir.clone()).unwrap();
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(fs.inodes.get_inode(&dir), Some(attr.ino));

        let missing = fs.entry_attr("lookup", NodePath::parse("/nope").unwrap());
        assert_eq!(missing.unwrap_err(), libc::ENOENT);
    }
}
