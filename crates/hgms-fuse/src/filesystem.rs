//! `fuser::Filesystem` implementation.
//!
//! A thin, read-only node tree over the alias directory: metadata is
//! fetched from the proxy's stat service per lookup (the kernel's
//! attribute cache does the batching), directory listings come from
//! `op=readdir`, and file contents go through [`FileHandle`]. Every
//! mutating operation is refused: `EROFS` for namespace changes, `EPERM`
//! and `EACCES` for attribute and data writes.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use hgms_core::ssc;
use hgms_core::stat::StatAttr;

use crate::config::MountConfig;
use crate::file::{Backend, FileHandle};
use crate::stat_client::StatClient;
use crate::MountError;

/// The root inode number (FUSE convention).
const ROOT_INODE: u64 = 1;

#[derive(Debug, Clone)]
struct Node {
    /// Path below the proxy webroot, no leading slash; empty for root.
    path: String,
    is_dir: bool,
}

/// Bidirectional inode <-> path table.
struct InodeTable {
    by_ino: HashMap<u64, Node>,
    by_path: HashMap<String, u64>,
    next: u64,
}

impl InodeTable {
    fn new() -> Self {
        let root = Node {
            path: String::new(),
            is_dir: true,
        };
        let mut by_ino = HashMap::new();
        let mut by_path = HashMap::new();
        by_ino.insert(ROOT_INODE, root);
        by_path.insert(String::new(), ROOT_INODE);
        Self {
            by_ino,
            by_path,
            next: ROOT_INODE + 1,
        }
    }

    fn get(&self, ino: u64) -> Option<Node> {
        self.by_ino.get(&ino).cloned()
    }

    fn ino_of(&self, path: &str) -> Option<u64> {
        self.by_path.get(path).copied()
    }

    fn get_or_insert(&mut self, path: &str, is_dir: bool) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            if let Some(node) = self.by_ino.get_mut(&ino) {
                node.is_dir = is_dir;
            }
            return ino;
        }
        let ino = self.next;
        self.next += 1;
        self.by_ino.insert(
            ino,
            Node {
                path: path.to_string(),
                is_dir,
            },
        );
        self.by_path.insert(path.to_string(), ino);
        ino
    }
}

/// Read-only filesystem over an HGMS alias tree.
pub struct HgmFs {
    stat: StatClient,
    backend: Backend,
    inodes: RwLock<InodeTable>,
    handles: Mutex<HashMap<u64, Arc<FileHandle>>>,
    next_fh: AtomicU64,
    attr_ttl: Duration,
}

impl HgmFs {
    pub fn new(config: &MountConfig) -> Result<Self, MountError> {
        let mut base_url = config.proxy_url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        let cache = match &config.cache_path {
            Some(path) => Some(Arc::new(ssc::Cache::open(
                path,
                config.cache_chunk_size,
                config.cache_chunk_count,
            )?)),
            None => None,
        };

        let http = reqwest::blocking::Client::builder()
            .connect_timeout(config.header_timeout)
            .timeout(None::<Duration>)
            .build()?;
        let stat = StatClient::new(&base_url, config.header_timeout)?;

        Ok(Self {
            stat,
            backend: Backend {
                http,
                base_url,
                cache,
                bytes_hit: AtomicU64::new(0),
                bytes_miss: AtomicU64::new(0),
            },
            inodes: RwLock::new(InodeTable::new()),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            attr_ttl: config.attr_ttl,
        })
    }

    fn node(&self, ino: u64) -> Option<Node> {
        self.inodes.read().get(ino)
    }

    fn make_attr(&self, ino: u64, attr: &StatAttr) -> FileAttr {
        let is_dir = attr.is_dir();
        let size = if is_dir {
            0
        } else {
            attr.content_size.unwrap_or(attr.size.max(0) as u64)
        };
        let blksize = if attr.block_size > 0 {
            attr.block_size as u32
        } else {
            4096
        };
        let time = |secs: u64| UNIX_EPOCH + Duration::from_secs(secs);

        FileAttr {
            ino,
            size,
            blocks: size.div_ceil(512),
            atime: time(attr.atime),
            mtime: time(attr.mtime),
            ctime: time(attr.ctime),
            crtime: time(attr.ctime),
            kind: if is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            },
            perm: (attr.mode & 0o555) as u16, // nothing here is writable
            nlink: attr.nlink.max(1) as u32,
            uid: attr.uid,
            gid: attr.gid,
            rdev: attr.rdev as u32,
            blksize,
            flags: 0,
        }
    }

    fn child_path(parent: &str, name: &str) -> String {
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}/{name}")
        }
    }
}

impl Filesystem for HgmFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!(proxy = %self.backend.base_url, "filesystem initialised");
        Ok(())
    }

    fn destroy(&mut self) {
        debug!(
            bytes_hit = self.backend.bytes_hit.load(Ordering::Relaxed),
            bytes_miss = self.backend.bytes_miss.load(Ordering::Relaxed),
            "filesystem shut down"
        );
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_node) = self.node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let path = Self::child_path(&parent_node.path, name);
        trace!(path = %path, "lookup");

        match self.stat.stat(&path) {
            Ok(attr) => {
                let ino = self.inodes.write().get_or_insert(&path, attr.is_dir());
                reply.entry(&self.attr_ttl, &self.make_attr(ino, &attr), 0);
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.stat.stat(&node.path) {
            Ok(attr) => reply.attr(&self.attr_ttl, &self.make_attr(ino, &attr)),
            Err(errno) => reply.error(errno),
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
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !node.is_dir {
            reply.error(libc::ENOTDIR);
            return;
        }

        let entries = match self.stat.read_dir(&node.path) {
            Ok(e) => e,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };

        let parent_ino = node
            .path
            .rsplit_once('/')
            .map_or(ROOT_INODE, |(parent, _)| {
                self.inodes.read().ino_of(parent).unwrap_or(ROOT_INODE)
            });

        let mut listing: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for entry in entries {
            let path = Self::child_path(&node.path, &entry.name);
            let child = self.inodes.write().get_or_insert(&path, entry.is_dir);
            let kind = if entry.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            listing.push((child, kind, entry.name));
        }

        for (i, (ino, kind, name)) in listing.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break; // reply buffer full
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(node) = self.node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if node.is_dir {
            reply.error(libc::EISDIR);
            return;
        }
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(libc::EACCES);
            return;
        }

        let attr = match self.stat.stat(&node.path) {
            Ok(a) => a,
            Err(errno) => {
                reply.error(errno);
                return;
            }
        };
        let content_size = attr.content_size.unwrap_or(attr.size.max(0) as u64);
        let blob_size = attr.blob_size.unwrap_or(0);

        let handle = Arc::new(FileHandle::new(node.path, content_size, blob_size));
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(fh, handle);

        debug!(fh, content_size, blob_size, "file opened");
        reply.opened(fh, fuser::consts::FOPEN_KEEP_CACHE);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(handle) = self.handles.lock().get(&fh).cloned() else {
            reply.error(libc::EBADF);
            return;
        };
        match handle.read(&self.backend, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => {
                handle.release();
                reply.error(errno);
            }
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(handle) = self.handles.lock().remove(&fh) {
            handle.release();
        }
        trace!(fh, "released");
        reply.ok();
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, mask: i32, reply: ReplyEmpty) {
        if mask & libc::W_OK != 0 {
            reply.error(libc::EROFS);
        } else {
            reply.ok();
        }
    }

    // -- everything below refuses to write ---------------------------------

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        _size: Option<u64>,
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
        warn!(ino, "setattr refused");
        reply.error(libc::EPERM);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        reply.error(libc::EACCES);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        reply.error(libc::EROFS);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn rmdir(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EROFS);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::EROFS);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EROFS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_table_roundtrip() {
        let mut table = InodeTable::new();
        assert_eq!(table.ino_of(""), Some(ROOT_INODE));

        let a = table.get_or_insert("music", true);
        let b = table.get_or_insert("music/song.mp3", false);
        assert_ne!(a, b);
        assert_eq!(table.get_or_insert("music", true), a, "stable inodes");
        assert_eq!(table.get(b).unwrap().path, "music/song.mp3");
        assert!(!table.get(b).unwrap().is_dir);
    }

    #[test]
    fn child_path_joins() {
        assert_eq!(HgmFs::child_path("", "x"), "x");
        assert_eq!(HgmFs::child_path("a/b", "x"), "a/b/x");
    }
}
