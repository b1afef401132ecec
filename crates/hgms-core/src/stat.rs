//! Shared stat/readdir RPC types.
//!
//! The FUSE client cannot stat alias files itself when it runs on another
//! host, so the proxy exposes a small JSON stat service. Both sides use
//! the shapes below; the errno-to-HTTP-status table is likewise shared so
//! it stays symmetric.
//!
//! Historical quirk, kept on the wire: `EACCES` travels as HTTP 405. The
//! decoder here maps it back, so the collision with "Method Not Allowed"
//! never leaks past this module.

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// One directory entry, as returned by `op=readdir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatDirent {
    pub name: String,
    pub is_dir: bool,
}

/// File attributes for one path in the alias tree.
///
/// `size` is the size of the alias sidecar itself; for alias files the
/// service additionally reports the user-visible `content_size` and the
/// blob geometry, which is what the filesystem presents and seeks with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatAttr {
    pub inode: u64,
    pub size: i64,
    pub blocks: i64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub block_size: i64,
    /// Plaintext size from the alias, present for alias files only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_size: Option<u64>,
    /// Per-blob plaintext size from the alias, present for alias files only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_size: Option<i64>,
}

impl StatAttr {
    /// True if the mode bits describe a directory.
    pub fn is_dir(&self) -> bool {
        (self.mode & u32::from(libc::S_IFMT)) == u32::from(libc::S_IFDIR)
    }
}

/// Stats a local path into the RPC shape.
pub fn local_stat(path: &Path) -> io::Result<StatAttr> {
    use std::os::unix::fs::MetadataExt;

    let md = std::fs::metadata(path)?;
    Ok(StatAttr {
        inode: md.ino(),
        size: md.size() as i64,
        blocks: md.blocks() as i64,
        atime: md.atime().max(0) as u64,
        mtime: md.mtime().max(0) as u64,
        ctime: md.ctime().max(0) as u64,
        mode: md.mode(),
        nlink: md.nlink(),
        uid: md.uid(),
        gid: md.gid(),
        rdev: md.rdev(),
        block_size: md.blksize() as i64,
        content_size: None,
        blob_size: None,
    })
}

/// Lists a local directory into the RPC shape.
pub fn local_read_dir(path: &Path) -> io::Result<Vec<StatDirent>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        out.push(StatDirent {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: entry.file_type()?.is_dir(),
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Maps an I/O error from the local stat path to the wire status.
pub fn io_error_to_status(err: &io::Error) -> u16 {
    match err.raw_os_error() {
        Some(libc::EPERM) => 403,
        Some(libc::ENOENT) => 404,
        Some(libc::EACCES) => 405,
        _ => 500,
    }
}

/// Inverse of [`io_error_to_status`], used on the FUSE side. Anything the
/// table does not know comes back as `EIO`.
pub fn status_to_errno(status: u16) -> i32 {
    match status {
        403 => libc::EPERM,
        404 => libc::ENOENT,
        405 => libc::EACCES,
        _ => libc::EIO,
    }
}
