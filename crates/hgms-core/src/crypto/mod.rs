//! AES-CBC stream codec.
//!
//! Blobs are encrypted in CBC mode with a per-blob IV; the stream shape is
//! driven by three independent quantities:
//!
//! - the *length bound*: how many plaintext bytes the caller wants out of
//!   the codec (`None` = run until the source is exhausted). This is what
//!   truncates the zero-padded final block back to the real content.
//! - the *skip prefix*: bytes to discard from the front of the decrypted
//!   stream, used to honour HTTP range requests. The counter is borrowed
//!   mutably so a single counter can span several per-blob codecs within
//!   one request.
//! - the cipher itself, which always moves in whole 16-byte blocks.
//!
//! For encrypting sources whose length is not a block multiple, wrap the
//! source in [`PadReader`]; the decryptor relies on the length bound, not
//! on the pad contents, so arbitrary pad bytes are fine.

use std::io::{self, Read, Write};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::{Aes128, Aes192, Aes256};
use thiserror::Error;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum CryptError {
    /// Key must be 16, 24 or 32 bytes (AES-128/192/256).
    #[error("invalid AES key length {0} (expected 16, 24 or 32 bytes)")]
    InvalidKeyLength(usize),

    /// The destination stopped accepting bytes mid-block.
    #[error("short write: destination accepted {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug)]
enum Encryptor {
    Aes128(cbc::Encryptor<Aes128>),
    Aes192(cbc::Encryptor<Aes192>),
    Aes256(cbc::Encryptor<Aes256>),
}

#[derive(Debug)]
enum Decryptor {
    Aes128(cbc::Decryptor<Aes128>),
    Aes192(cbc::Decryptor<Aes192>),
    Aes256(cbc::Decryptor<Aes256>),
}

impl Encryptor {
    fn process(&mut self, block: &mut [u8; BLOCK_SIZE]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.encrypt_block_mut(block),
            Self::Aes192(c) => c.encrypt_block_mut(block),
            Self::Aes256(c) => c.encrypt_block_mut(block),
        }
    }
}

impl Decryptor {
    fn process(&mut self, block: &mut [u8; BLOCK_SIZE]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Self::Aes128(c) => c.decrypt_block_mut(block),
            Self::Aes192(c) => c.decrypt_block_mut(block),
            Self::Aes256(c) => c.decrypt_block_mut(block),
        }
    }
}

/// Block-mode AES-CBC pipe between a reader and a writer.
///
/// One instance carries both directions, seeded from the same `(key, iv)`
/// pair; the chaining state of each direction advances independently.
#[derive(Debug)]
pub struct AesCbc {
    enc: Encryptor,
    dec: Decryptor,
    /// Plaintext bytes still allowed out; `None` means unbounded.
    remaining: Option<u64>,
}

impl AesCbc {
    /// Creates a codec. The key length selects the AES variant; the IV is
    /// zero-padded or truncated to one block, matching what the blob
    /// encoder historically embedded.
    pub fn new(key: &[u8], iv: &[u8], limit: Option<u64>) -> Result<Self, CryptError> {
        let mut piv = [0u8; BLOCK_SIZE];
        let n = iv.len().min(BLOCK_SIZE);
        piv[..n].copy_from_slice(&iv[..n]);

        let bad = |_| CryptError::InvalidKeyLength(key.len());
        let (enc, dec) = match key.len() {
            16 => (
                Encryptor::Aes128(cbc::Encryptor::new_from_slices(key, &piv).map_err(bad)?),
                Decryptor::Aes128(cbc::Decryptor::new_from_slices(key, &piv).map_err(bad)?),
            ),
            24 => (
                Encryptor::Aes192(cbc::Encryptor::new_from_slices(key, &piv).map_err(bad)?),
                Decryptor::Aes192(cbc::Decryptor::new_from_slices(key, &piv).map_err(bad)?),
            ),
            32 => (
                Encryptor::Aes256(cbc::Encryptor::new_from_slices(key, &piv).map_err(bad)?),
                Decryptor::Aes256(cbc::Decryptor::new_from_slices(key, &piv).map_err(bad)?),
            ),
            n => return Err(CryptError::InvalidKeyLength(n)),
        };

        Ok(Self {
            enc,
            dec,
            remaining: limit,
        })
    }

    /// Encrypts `src` into `dst` until the source ends or the length bound
    /// is reached. Returns the number of ciphertext bytes written.
    pub fn encrypt_stream<W: Write, R: Read>(
        &mut self,
        dst: &mut W,
        src: &mut R,
    ) -> Result<u64, CryptError> {
        self.run(dst, src, Direction::Encrypt, &mut 0)
    }

    /// Decrypts `src` into `dst`. Returns the number of plaintext bytes
    /// written.
    pub fn decrypt_stream<W: Write, R: Read>(
        &mut self,
        dst: &mut W,
        src: &mut R,
    ) -> Result<u64, CryptError> {
        self.run(dst, src, Direction::Decrypt, &mut 0)
    }

    /// Like [`decrypt_stream`](Self::decrypt_stream), but first discards
    /// `skip` bytes of decrypted output. The counter is decremented as
    /// bytes are skipped, so the caller can thread one counter through the
    /// codecs of consecutive blobs.
    pub fn decrypt_stream_skip<W: Write, R: Read>(
        &mut self,
        dst: &mut W,
        src: &mut R,
        skip: &mut u64,
    ) -> Result<u64, CryptError> {
        self.run(dst, src, Direction::Decrypt, skip)
    }

    fn run<W: Write, R: Read>(
        &mut self,
        dst: &mut W,
        src: &mut R,
        dir: Direction,
        skip: &mut u64,
    ) -> Result<u64, CryptError> {
        let mut block = [0u8; BLOCK_SIZE];
        let mut total = 0u64;

        loop {
            if self.remaining == Some(0) {
                break;
            }

            // A short final read leaves stale bytes in the block tail; that
            // is fine, CBC padding content is never interpreted.
            let got = read_block(src, &mut block)?;
            if got == 0 {
                break;
            }

            match dir {
                Direction::Encrypt => self.enc.process(&mut block),
                Direction::Decrypt => self.dec.process(&mut block),
            }

            let mut from = 0usize;
            let mut to = BLOCK_SIZE;
            if let Some(rem) = self.remaining {
                if to as u64 > rem {
                    to = rem as usize;
                }
            }

            if *skip > 0 {
                let n = (*skip).min((to - from) as u64);
                from += n as usize;
                *skip -= n;
                if let Some(rem) = &mut self.remaining {
                    *rem -= n;
                }
            }
            if from == to {
                continue;
            }

            write_window(dst, &block[from..to])?;
            total += (to - from) as u64;
            if let Some(rem) = &mut self.remaining {
                *rem -= (to - from) as u64;
            }
        }

        dst.flush()?;
        Ok(total)
    }
}

enum Direction {
    Encrypt,
    Decrypt,
}

/// Reads one cipher block, looping over short reads. Returns the number of
/// bytes actually obtained; anything below [`BLOCK_SIZE`] means the source
/// ended inside this block.
fn read_block<R: Read>(src: &mut R, block: &mut [u8; BLOCK_SIZE]) -> io::Result<usize> {
    let mut n = 0;
    while n < BLOCK_SIZE {
        match src.read(&mut block[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

fn write_window<W: Write>(dst: &mut W, window: &[u8]) -> Result<(), CryptError> {
    let mut off = 0;
    while off < window.len() {
        let n = dst.write(&window[off..])?;
        if n == 0 {
            return Err(CryptError::ShortWrite {
                written: off,
                expected: window.len(),
            });
        }
        off += n;
    }
    Ok(())
}

/// Reader adapter that zero-pads its source up to the next block multiple.
///
/// Used on the encrypt side for files whose length is not a multiple of
/// 16; the decryptor's length bound strips the pad again.
pub struct PadReader<R> {
    inner: R,
    produced: u64,
    pad_left: usize,
    eof: bool,
}

impl<R: Read> PadReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            produced: 0,
            pad_left: 0,
            eof: false,
        }
    }
}

impl<R: Read> Read for PadReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.eof {
            let n = self.inner.read(buf)?;
            if n > 0 {
                self.produced += n as u64;
                return Ok(n);
            }
            self.eof = true;
            self.pad_left = ((BLOCK_SIZE as u64 - self.produced % BLOCK_SIZE as u64)
                % BLOCK_SIZE as u64) as usize;
        }
        let n = self.pad_left.min(buf.len());
        buf[..n].fill(0);
        self.pad_left -= n;
        Ok(n)
    }
}
