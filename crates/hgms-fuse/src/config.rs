//! Mount configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Granularity of cached reads; the block cache is only populated at
/// offsets aligned to this.
pub const LRU_BLOCK_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Base URL of the proxy, webroot included (e.g. `http://host:8080/`).
    pub proxy_url: String,
    /// Block cache database path; `None` disables the cache.
    pub cache_path: Option<PathBuf>,
    /// Value slot size of the block cache. Must be able to hold one
    /// [`LRU_BLOCK_SIZE`] block.
    pub cache_chunk_size: u64,
    /// Number of cache slots.
    pub cache_chunk_count: u64,
    /// How long to wait for the proxy to start answering a request.
    pub header_timeout: Duration,
    /// Kernel attribute cache lifetime.
    pub attr_ttl: Duration,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            proxy_url: "http://localhost:8080/".to_string(),
            cache_path: None,
            cache_chunk_size: LRU_BLOCK_SIZE as u64,
            cache_chunk_count: 16384, // 64 MiB of payload at 4 KiB chunks
            header_timeout: Duration::from_secs(15),
            attr_ttl: Duration::from_secs(1),
        }
    }
}
