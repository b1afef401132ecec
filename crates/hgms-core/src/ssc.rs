//! SSC — the single-file persistent block cache.
//!
//! A fixed-geometry key/value store used as the FUSE read cache: keys are
//! hashed to 64 bits with CRC-64, values occupy one fixed-size chunk slot
//! each, and eviction is strictly circular (FIFO by write order — the
//! historical name "LRU" was a misnomer and is not used here).
//!
//! # On-disk layout (all integers little-endian)
//!
//! ```text
//! Offset            Size    Region
//! 0                 4096    superblock:
//!                             0  4   magic        = "!ssc"
//!                             4  1   version      = 1
//!                             5  8   chunk_size   (LE u64)
//!                            13  8   chunk_count  (LE u64)
//!                            21  8   next_chunk_hint (LE u64)
//!                            29  ..  zero padding
//! 4096              24*N    meta table: per chunk
//!                             0  8   key      (LE u64, CRC-64 of the key)
//!                             8  8   len      (LE u64, may be < chunk_size)
//!                            16  8   checksum (LE u64, CRC-64 of the data)
//! 4096 + 24*N       S*N     data region, chunk i at 4096 + 24*N + i*S
//! ```
//!
//! The file size is `4096 + 24*N + S*N` at all times; anything else is a
//! corrupted database. Changing the geometry of an existing file is a
//! hard error.
//!
//! # Crash tolerance
//!
//! Every meta entry loaded from disk starts out *dirty*: the first `get`
//! that touches it verifies the record checksum before trusting the data,
//! and a mismatch demotes the slot to a miss under a fresh random key.
//! The superblock's write-pointer hint is snapshotted only every 512
//! inserts, deliberately overshooting by 520 slots so that a crash cannot
//! resurrect a slot that was about to be overwritten.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crc::{Crc, CRC_64_XZ};
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

const MAGIC: [u8; 4] = *b"!ssc";
const VERSION: u8 = 1;
const SUPERBLOCK_SIZE: u64 = 4096;
const META_ENTRY_SIZE: u64 = 8 * 3;

/// Inserts between superblock hint snapshots.
const HINT_INTERVAL: u32 = 512;
/// Hint overshoot past the true write pointer.
const HINT_OVERSHOOT: u64 = 520;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

#[derive(Error, Debug)]
pub enum SscError {
    /// The file exists but its size, magic, version or geometry does not
    /// match what was asked for.
    #[error("database is corrupted")]
    CorruptedDb,

    /// Zero chunk size or count.
    #[error("invalid cache geometry: {0} chunks of {1} bytes")]
    InvalidGeometry(u64, u64),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, Default)]
struct MetaEntry {
    key: u64,
    len: u64,
    checksum: u64,
}

impl MetaEntry {
    fn to_bytes(self) -> [u8; META_ENTRY_SIZE as usize] {
        let mut b = [0u8; META_ENTRY_SIZE as usize];
        b[0..8].copy_from_slice(&self.key.to_le_bytes());
        b[8..16].copy_from_slice(&self.len.to_le_bytes());
        b[16..24].copy_from_slice(&self.checksum.to_le_bytes());
        b
    }

    fn from_bytes(b: &[u8]) -> Self {
        Self {
            key: u64::from_le_bytes(b[0..8].try_into().unwrap()),
            len: u64::from_le_bytes(b[8..16].try_into().unwrap()),
            checksum: u64::from_le_bytes(b[16..24].try_into().unwrap()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ChunkRef {
    chunk: u64,
    /// True until the on-disk data has passed one checksum verification
    /// in this process.
    dirty: bool,
}

#[derive(Debug)]
struct Inner {
    file: File,
    /// chunk index -> meta entry, mirror of the on-disk table.
    meta: Vec<MetaEntry>,
    /// key hash -> chunk slot.
    chunks: HashMap<u64, ChunkRef>,
    /// Next slot the circular write pointer will claim.
    next_chunk: u64,
    adds_since_hint: u32,
}

/// Process-wide block cache over one database file.
///
/// All operations go through a single mutex: every access repositions the
/// shared file handle, so reads are exclusive too.
#[derive(Debug)]
pub struct Cache {
    chunk_size: u64,
    chunk_count: u64,
    inner: Mutex<Inner>,
}

impl Cache {
    /// Opens (or creates) the database at `path` with `chunk_count` slots
    /// of `chunk_size` bytes.
    ///
    /// A zero-length file is initialised in place; an existing file must
    /// match the requested geometry exactly or [`SscError::CorruptedDb`]
    /// is returned.
    pub fn open(path: &Path, chunk_size: u64, chunk_count: u64) -> Result<Self, SscError> {
        if chunk_size == 0 || chunk_count == 0 {
            return Err(SscError::InvalidGeometry(chunk_count, chunk_size));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let expected = SUPERBLOCK_SIZE + META_ENTRY_SIZE * chunk_count + chunk_size * chunk_count;
        let actual = file.metadata()?.len();

        let mut next_chunk;
        if actual == 0 {
            // Fresh database: start the write pointer at a random slot so
            // parallel deployments do not all wear the same region.
            next_chunk = rand::rng().random_range(0..chunk_count);
            write_superblock(&mut file, chunk_size, chunk_count, next_chunk)?;
            file.set_len(expected)?;
        } else if actual == expected {
            let mut sb = [0u8; 29];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut sb)?;
            if sb[0..4] != MAGIC
                || sb[4] != VERSION
                || u64::from_le_bytes(sb[5..13].try_into().unwrap()) != chunk_size
                || u64::from_le_bytes(sb[13..21].try_into().unwrap()) != chunk_count
            {
                return Err(SscError::CorruptedDb);
            }
            next_chunk = u64::from_le_bytes(sb[21..29].try_into().unwrap());
            if next_chunk >= chunk_count {
                next_chunk = 0;
            }
        } else {
            return Err(SscError::CorruptedDb);
        }

        // Load the whole meta table, deduplicating keys as we go: a key
        // collision (all-zero entries in a fresh file, or torn writes)
        // gets replaced in memory by a random unused key, which makes the
        // slot unfindable until it is recycled.
        let mut meta = Vec::with_capacity(chunk_count as usize);
        let mut chunks = HashMap::with_capacity(chunk_count as usize);

        file.seek(SeekFrom::Start(SUPERBLOCK_SIZE))?;
        let mut table = vec![0u8; (META_ENTRY_SIZE * chunk_count) as usize];
        file.read_exact(&mut table)?;

        for chunk in 0..chunk_count {
            let off = (chunk * META_ENTRY_SIZE) as usize;
            let mut entry = MetaEntry::from_bytes(&table[off..off + META_ENTRY_SIZE as usize]);
            entry.key = find_free_key(&chunks, entry.key);
            chunks.insert(entry.key, ChunkRef { chunk, dirty: true });
            meta.push(entry);
        }

        debug!(
            path = %path.display(),
            chunk_size,
            chunk_count,
            next_chunk,
            "ssc database opened"
        );

        Ok(Self {
            chunk_size,
            chunk_count,
            inner: Mutex::new(Inner {
                file,
                meta,
                chunks,
                next_chunk,
                adds_since_hint: 0,
            }),
        })
    }

    /// Size in bytes of one value slot.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Number of value slots.
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Inserts `value` under `key`. Returns `false` without touching the
    /// store when the key is already present (there are no updates) or the
    /// value does not fit a chunk.
    pub fn add(&self, key: &[u8], value: &[u8]) -> Result<bool, SscError> {
        if value.len() as u64 > self.chunk_size {
            warn!(len = value.len(), chunk_size = self.chunk_size, "value too large for cache");
            return Ok(false);
        }
        let kh = hash64(key);

        let mut inner = self.inner.lock();
        if inner.chunks.contains_key(&kh) {
            return Ok(false);
        }

        let chunk = inner.next_chunk;
        let old_key = inner.meta[chunk as usize].key;
        let new_meta = MetaEntry {
            key: kh,
            len: value.len() as u64,
            checksum: hash64(value),
        };
        self.replace_meta(&mut inner, old_key, new_meta, false)?;

        let data_off = self.data_offset(chunk);
        inner.file.seek(SeekFrom::Start(data_off))?;
        inner.file.write_all(value)?;

        inner.next_chunk = (chunk + 1) % self.chunk_count;
        inner.adds_since_hint += 1;
        if inner.adds_since_hint >= HINT_INTERVAL {
            inner.adds_since_hint = 0;
            let hint = (inner.next_chunk + HINT_OVERSHOOT) % self.chunk_count;
            let (chunk_size, chunk_count) = (self.chunk_size, self.chunk_count);
            write_superblock(&mut inner.file, chunk_size, chunk_count, hint)?;
        }
        Ok(true)
    }

    /// Looks up `key`. `Ok(None)` covers both a plain miss and a record
    /// that failed its first checksum verification (the slot is then
    /// re-keyed so it never matches again).
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SscError> {
        let kh = hash64(key);

        let mut inner = self.inner.lock();
        let Some(entry) = inner.chunks.get(&kh).copied() else {
            return Ok(None);
        };
        let meta = inner.meta[entry.chunk as usize];

        let data_off = self.data_offset(entry.chunk);
        inner.file.seek(SeekFrom::Start(data_off))?;
        let mut data = vec![0u8; meta.len as usize];
        inner.file.read_exact(&mut data)?;

        if entry.dirty {
            if hash64(&data) == meta.checksum {
                if let Some(e) = inner.chunks.get_mut(&kh) {
                    e.dirty = false;
                }
            } else {
                warn!(chunk = entry.chunk, "corrupted cache record, evicting slot");
                let fresh = find_free_key(&inner.chunks, 0);
                self.replace_meta(
                    &mut inner,
                    kh,
                    MetaEntry {
                        key: fresh,
                        len: 0,
                        checksum: 0,
                    },
                    true,
                )?;
                return Ok(None);
            }
        }
        Ok(Some(data))
    }

    /// Swaps the meta entry that currently carries `old_key` for
    /// `new_meta`, in memory and on disk.
    fn replace_meta(
        &self,
        inner: &mut Inner,
        old_key: u64,
        new_meta: MetaEntry,
        dirty: bool,
    ) -> Result<(), SscError> {
        let chunk = inner
            .chunks
            .get(&old_key)
            .expect("ssc: meta table and chunk map out of sync")
            .chunk;
        inner.chunks.remove(&old_key);
        inner.chunks.insert(new_meta.key, ChunkRef { chunk, dirty });
        inner.meta[chunk as usize] = new_meta;

        inner
            .file
            .seek(SeekFrom::Start(SUPERBLOCK_SIZE + META_ENTRY_SIZE * chunk))?;
        inner.file.write_all(&new_meta.to_bytes())?;

        // A divergence here is a bug, not a runtime condition.
        assert!(
            inner.chunks.len() as u64 == self.chunk_count
                && inner.meta.len() as u64 == self.chunk_count,
            "ssc: chunk map corrupted ({} keys, {} meta entries, {} chunks)",
            inner.chunks.len(),
            inner.meta.len(),
            self.chunk_count,
        );
        Ok(())
    }

    fn data_offset(&self, chunk: u64) -> u64 {
        SUPERBLOCK_SIZE + META_ENTRY_SIZE * self.chunk_count + chunk * self.chunk_size
    }
}

fn write_superblock(
    file: &mut File,
    chunk_size: u64,
    chunk_count: u64,
    next_chunk_hint: u64,
) -> Result<(), SscError> {
    let mut sb = [0u8; 29];
    sb[0..4].copy_from_slice(&MAGIC);
    sb[4] = VERSION;
    sb[5..13].copy_from_slice(&chunk_size.to_le_bytes());
    sb[13..21].copy_from_slice(&chunk_count.to_le_bytes());
    sb[21..29].copy_from_slice(&next_chunk_hint.to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&sb)?;
    Ok(())
}

fn hash64(b: &[u8]) -> u64 {
    CRC64.checksum(b)
}

/// Returns `hint` if no live entry uses it, otherwise a random unused key.
fn find_free_key(chunks: &HashMap<u64, ChunkRef>, mut hint: u64) -> u64 {
    let mut rng = rand::rng();
    while chunks.contains_key(&hint) {
        hint = rng.random();
    }
    hint
}
