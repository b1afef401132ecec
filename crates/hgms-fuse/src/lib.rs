//! Read-only FUSE filesystem over an HGMS alias tree.
//!
//! The filesystem never touches blobs itself: metadata comes from the
//! proxy's stat service, file contents come from ranged `GET`s against
//! the proxy, and a persistent block cache ([`hgms_core::ssc`]) sits in
//! front of the HTTP path to soak up re-reads.

pub mod config;
pub mod file;
pub mod filesystem;
pub mod stat_client;

use std::io;
use std::path::Path;

use fuser::MountOption;
use thiserror::Error;
use tracing::info;

pub use config::MountConfig;
pub use filesystem::HgmFs;

#[derive(Error, Debug)]
pub enum MountError {
    /// The block cache refused to open; a corrupted database aborts the
    /// mount rather than serving unverifiable data.
    #[error("block cache error: {0}")]
    Cache(#[from] hgms_core::ssc::SscError),

    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),

    #[error("mount error: {0}")]
    Io(#[from] io::Error),
}

/// Mounts the filesystem at `mountpoint` and serves until unmounted.
pub fn mount(config: MountConfig, mountpoint: &Path) -> Result<(), MountError> {
    let fs = HgmFs::new(&config)?;
    let options = [
        MountOption::RO,
        MountOption::FSName("hgms".to_string()),
        MountOption::Subtype("hgms".to_string()),
    ];
    info!(mountpoint = %mountpoint.display(), proxy = %config.proxy_url, "mounting");
    fuser::mount2(fs, mountpoint, &options)?;
    Ok(())
}
