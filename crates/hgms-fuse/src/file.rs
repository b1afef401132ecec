//! Per-open-file state and the read hot path.
//!
//! Every open file holds at most one live HTTP connection to the proxy.
//! Sequential reads ride the same connection; a forward seek inside the
//! current blob is served by reading-and-discarding, anything else tears
//! the connection down and reopens with a new `Range:` header. Reads are
//! additionally intercepted by the block cache at 4 KiB granularity.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use hgms_core::ssc;

use crate::config::LRU_BLOCK_SIZE;
use crate::stat_client::encode_path;

/// Process-wide pieces the read path needs.
pub struct Backend {
    /// Data-path client; `Range:` requests go straight to the proxy.
    pub http: reqwest::blocking::Client,
    /// Proxy base URL, webroot included, trailing slash guaranteed.
    pub base_url: String,
    /// Optional persistent block cache.
    pub cache: Option<Arc<ssc::Cache>>,
    /// Bytes served from the cache.
    pub bytes_hit: AtomicU64,
    /// Bytes fetched over HTTP.
    pub bytes_miss: AtomicU64,
}

/// The live connection of one open file.
struct Conn {
    resp: Option<reqwest::blocking::Response>,
    /// Plaintext offset the response body is currently positioned at.
    offset: u64,
}

impl Conn {
    fn reset(&mut self) {
        self.resp = None;
        self.offset = 0;
    }
}

/// One open file.
pub struct FileHandle {
    /// Path below the proxy webroot, no leading slash.
    path: String,
    content_size: u64,
    blob_size: i64,
    conn: Mutex<Conn>,
    /// Offsets of reads currently waiting for the connection, used to
    /// serve concurrent kernel reads in roughly ascending order.
    queue: Mutex<HashMap<u32, u64>>,
}

impl FileHandle {
    pub fn new(path: String, content_size: u64, blob_size: i64) -> Self {
        Self {
            path,
            content_size,
            blob_size,
            conn: Mutex::new(Conn {
                resp: None,
                offset: 0,
            }),
            queue: Mutex::new(HashMap::new()),
        }
    }

    pub fn content_size(&self) -> u64 {
        self.content_size
    }

    /// Drops the live connection, if any.
    pub fn release(&self) {
        self.conn.lock().reset();
    }

    /// Serves one kernel read. Errors are errnos; a short (or empty)
    /// result is a successful read that ran into end of file.
    pub fn read(&self, backend: &Backend, off: u64, size: u32) -> Result<Vec<u8>, i32> {
        if self.blob_size <= 0 {
            return Ok(Vec::new());
        }
        let size = size as usize;

        if let Some(cache) = &backend.cache {
            let key = cache_key(off, &self.path);
            if let Ok(Some(block)) = cache.get(key.as_bytes()) {
                let n = block.len().min(size);
                backend.bytes_hit.fetch_add(n as u64, Ordering::Relaxed);
                trace!(off, n, "cache hit");
                let mut out = block;
                out.truncate(n);
                return Ok(out);
            }
        }

        let rqid: u32 = rand::random();
        self.queue.lock().insert(rqid, off);
        let _guard = QueueGuard { file: self, rqid };

        let mut conn = self.acquire_turn(off);

        // Position the connection at `off`.
        if conn.resp.is_some() && conn.offset != off {
            let cur = conn.offset;
            let blob_size = self.blob_size as u64;
            let same_blob = off / blob_size == cur / blob_size;
            if off > cur && same_blob {
                trace!(from = cur, to = off, "fast-forwarding");
                if discard(&mut conn, off - cur).is_err() {
                    conn.reset();
                }
            } else {
                debug!(from = cur, to = off, "seek resets connection");
                conn.reset();
            }
        }

        if conn.resp.is_none() {
            let url = format!("{}{}", backend.base_url, encode_path(&self.path));
            debug!(url = %url, off, "opening connection");
            let resp = backend
                .http
                .get(&url)
                .header(reqwest::header::RANGE, format!("bytes={off}-"))
                .send()
                .map_err(|e| {
                    warn!(error = %e, "proxy request failed");
                    libc::EIO
                })?;

            let status = resp.status().as_u16();
            if status != 200 && status != 206 {
                warn!(status, "proxy refused read");
                return Err(libc::EIO);
            }

            conn.resp = Some(resp);
            conn.offset = 0;
            if status == 200 && off > 0 {
                // Upstream ignored the Range header; walk there by hand.
                discard(&mut conn, off).map_err(|_| libc::EIO)?;
            } else {
                conn.offset = off;
            }
        }

        // Pull the payload in cache-block-sized chunks so that aligned
        // chunks can be inserted into the cache as they pass through.
        let mut out = Vec::with_capacity(size);
        while out.len() < size {
            let want = LRU_BLOCK_SIZE.min(size - out.len());
            let start = conn.offset;
            let mut chunk = vec![0u8; want];
            let n = read_some(conn.resp.as_mut().expect("connection just ensured"), &mut chunk);
            if n == 0 {
                break; // EOF is a short read, not an error
            }
            chunk.truncate(n);

            if let Some(cache) = &backend.cache {
                // Only whole blocks (or the file's tail) at aligned
                // offsets; a mid-block start must never poison the cache.
                let aligned = start % LRU_BLOCK_SIZE as u64 == 0;
                if aligned && (n == LRU_BLOCK_SIZE || n < want) {
                    let _ = cache.add(cache_key(start, &self.path).as_bytes(), &chunk);
                }
            }

            conn.offset += n as u64;
            out.extend_from_slice(&chunk);
            if n < want {
                break;
            }
        }

        backend.bytes_miss.fetch_add(out.len() as u64, Ordering::Relaxed);
        Ok(out)
    }

    /// Waits until this read is the best next user of the connection.
    ///
    /// The kernel issues concurrent reads out of order; letting the one
    /// whose offset matches the connection go first avoids needless
    /// connection churn. The wait is bounded, nobody starves.
    fn acquire_turn(&self, off: u64) -> MutexGuard<'_, Conn> {
        let mut retry = 0u32;
        loop {
            let conn = self.conn.lock();
            let its_our_turn = {
                let queue = self.queue.lock();
                conn.offset == off
                    || (queue.len() == 1 && retry > 5)
                    || (retry > 2 && next_in_queue(&queue, conn.offset, off))
                    || retry > 10
            };
            if its_our_turn {
                return conn;
            }
            drop(conn);
            retry += 1;
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

/// True if no queued read sits between the connection offset and `want`.
fn next_in_queue(queue: &HashMap<u32, u64>, current: u64, want: u64) -> bool {
    if want < current {
        return false;
    }
    !queue.values().any(|&v| v >= current && v < want)
}

struct QueueGuard<'a> {
    file: &'a FileHandle,
    rqid: u32,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.file.queue.lock().remove(&self.rqid);
    }
}

fn cache_key(off: u64, path: &str) -> String {
    format!("{off}/{path}")
}

/// Reads and throws away `count` bytes, tracking the connection offset.
fn discard(conn: &mut Conn, count: u64) -> Result<(), std::io::Error> {
    let resp = conn.resp.as_mut().expect("discard needs a connection");
    let mut left = count;
    let mut scratch = [0u8; 8192];
    while left > 0 {
        let want = (scratch.len() as u64).min(left) as usize;
        let n = resp.read(&mut scratch[..want])?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        left -= n as u64;
        conn.offset += n as u64;
    }
    Ok(())
}

/// Best-effort read of up to `buf.len()` bytes; transport errors and EOF
/// both end the read early.
fn read_some(resp: &mut reqwest::blocking::Response, buf: &mut [u8]) -> usize {
    let mut n = 0;
    while n < buf.len() {
        match resp.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(_) => break,
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_ordering() {
        let mut queue = HashMap::new();
        queue.insert(1, 100u64);
        queue.insert(2, 300u64);

        // A backward want never cuts the line.
        assert!(!next_in_queue(&queue, 200, 150));
        // Nothing queued between 200 and 300, so 300 may go.
        assert!(next_in_queue(&queue, 200, 300));
        queue.insert(3, 250);
        assert!(!next_in_queue(&queue, 200, 300), "250 goes first");
    }

    #[test]
    fn zero_blob_size_reads_nothing() {
        let handle = FileHandle::new("x".into(), 100, 0);
        let backend = Backend {
            http: reqwest::blocking::Client::new(),
            base_url: "http://127.0.0.1:1/".into(),
            cache: None,
            bytes_hit: AtomicU64::new(0),
            bytes_miss: AtomicU64::new(0),
        };
        assert_eq!(handle.read(&backend, 0, 4096).unwrap(), Vec::<u8>::new());
    }
}
