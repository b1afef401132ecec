//! PNG steganography: recovering ciphertext hidden in image data.
//!
//! A blob is a standards-shaped PNG whose pixel data *is* the AES-CBC
//! ciphertext: the encoder writes the ciphertext as raw truecolour
//! scanlines (filter type 0), compresses them into a single `IDAT` stream
//! and records the decryption sidechannel (`IV`, `CONTENTSIZE`, `BLOBSIZE`)
//! in `tEXt` chunks placed before the image data. [`BlobReader`] reverses
//! this: it scans the ancillary chunks, then exposes the inflated,
//! scanline-stripped payload as an [`io::Read`] byte stream.
//!
//! Chunk CRCs are consumed but not validated; the cipher layer above
//! tolerates no corruption anyway, and a corrupt replica is simply
//! abandoned for the next one.

mod encode;

pub use encode::BlobEncoder;

use std::io::{self, BufReader, Read};

use flate2::read::ZlibDecoder;
use thiserror::Error;
use tracing::trace;

/// The eight-byte PNG signature.
const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a];

/// Ancillary chunks are always smaller than this; the first chunk at or
/// above it is taken to be the `IDAT` payload even if the type field says
/// otherwise. Encoders cooperate by writing all `tEXt` chunks first and
/// making `IDAT` the only large chunk.
const MAX_ANCILLARY_LEN: usize = 4096;

/// Buffer size for the raw source, amortising small reads from the
/// network body underneath the inflater.
const RAW_BUF_SIZE: usize = 1024 * 1024;

/// Refill target for the decoded-ciphertext buffer.
const DECODE_THRESHOLD: usize = 4096;

/// AES block size; reads return a multiple of this whenever possible so
/// the cipher layer rarely has to reassemble blocks.
const AES_BLOCK: usize = 16;

/// Errors raised while parsing a blob's PNG envelope.
///
/// Every one of these is fatal for the blob at hand; the fetcher reacts by
/// trying the next replica.
#[derive(Error, Debug)]
pub enum StegoError {
    /// The first eight bytes are not the PNG signature.
    #[error("not a PNG: bad signature")]
    InvalidHeader,

    /// The `IHDR` chunk declared a scanline of zero bytes, either through
    /// a zero width or an unsupported colour type.
    #[error("invalid scanline configuration (width or colour type)")]
    InvalidScanline,

    /// No `IV` tag was found before the image data.
    #[error("blob carries no IV tag")]
    MissingIv,

    /// A `CONTENTSIZE`/`BLOBSIZE` tag was present but not decimal.
    #[error("malformed {0} tag")]
    BadMetadata(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Streaming decoder for one PNG blob.
///
/// [`BlobReader::open`] consumes the header and every ancillary chunk up
/// to the image data, capturing the sidechannel metadata on the way. The
/// resulting reader yields the embedded ciphertext; end of image data is
/// an ordinary `Ok(0)`.
#[derive(Debug)]
pub struct BlobReader<R: Read> {
    /// Inflater over the remaining source, positioned at the IDAT payload.
    zr: ZlibDecoder<BufReader<R>>,
    /// Inflate output still carrying per-scanline filter bytes.
    uncompressed: Vec<u8>,
    /// Scanline-stripped ciphertext, ready to hand out.
    decoded: Vec<u8>,
    /// Bytes per scanline excluding the filter byte.
    sl_size: usize,
    /// True once the inflater reported end of stream.
    exhausted: bool,
    iv: Vec<u8>,
    content_size: u64,
    blob_size: i64,
}

impl<R: Read> BlobReader<R> {
    /// Parses the PNG header and ancillary chunks of `src` and returns a
    /// reader positioned on the embedded ciphertext.
    ///
    /// The scan stops at the first `IDAT` chunk, or at any chunk whose
    /// declared length reaches 4 KiB (see [`MAX_ANCILLARY_LEN`]). The
    /// source is buffered internally; callers must not read from it again.
    pub fn open(src: R) -> Result<Self, StegoError> {
        let mut src = BufReader::with_capacity(RAW_BUF_SIZE, src);

        let mut hdr = [0u8; 8];
        src.read_exact(&mut hdr)?;
        if hdr != PNG_MAGIC {
            return Err(StegoError::InvalidHeader);
        }

        let mut sl_size = 0usize;
        let mut iv = Vec::new();
        let mut content_size = 0u64;
        let mut blob_size = 0i64;

        loop {
            src.read_exact(&mut hdr)?;
            let qlen = u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]) as usize;
            let ctype = [hdr[4], hdr[5], hdr[6], hdr[7]];

            if &ctype == b"IDAT" || qlen >= MAX_ANCILLARY_LEN {
                break;
            }

            // Chunk payload plus the 4 CRC bytes; the CRC is discarded.
            let mut payload = vec![0u8; qlen + 4];
            src.read_exact(&mut payload)?;
            payload.truncate(qlen);

            match &ctype {
                b"IHDR" => {
                    if payload.len() >= 10 {
                        let width =
                            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
                        let bytes_per_pixel = match payload[9] {
                            0x02 => 3, // truecolour
                            0x06 => 4, // truecolour with alpha
                            _ => 0,
                        };
                        sl_size = width as usize * bytes_per_pixel;
                        trace!(sl_size, "scanline configured");
                    }
                }
                b"tEXt" => {
                    if let Some(eq) = payload.iter().position(|&b| b == b'=') {
                        let (tag, value) = (&payload[..eq], &payload[eq + 1..]);
                        match tag {
                            b"IV" => iv = value.to_vec(),
                            b"CONTENTSIZE" => {
                                content_size = parse_decimal(value, "CONTENTSIZE")?;
                            }
                            b"BLOBSIZE" => {
                                blob_size = parse_decimal_signed(value, "BLOBSIZE")?;
                            }
                            _ => {}
                        }
                    }
                }
                _ => {} // other ancillary chunks carry nothing for us
            }
        }

        if sl_size < 1 {
            return Err(StegoError::InvalidScanline);
        }
        if iv.is_empty() {
            return Err(StegoError::MissingIv);
        }

        Ok(Self {
            zr: ZlibDecoder::new(src),
            uncompressed: Vec::new(),
            decoded: Vec::new(),
            sl_size,
            exhausted: false,
            iv,
            content_size,
            blob_size,
        })
    }

    /// The AES-CBC initialisation vector embedded in this blob.
    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Total plaintext size of the file this blob belongs to.
    pub fn content_size(&self) -> u64 {
        self.content_size
    }

    /// Plaintext bytes stored in this blob.
    pub fn blob_size(&self) -> i64 {
        self.blob_size
    }

    /// Inflate more data and strip scanline filter bytes until the decode
    /// buffer holds at least [`DECODE_THRESHOLD`] bytes or the image data
    /// is exhausted.
    fn refill(&mut self) -> io::Result<()> {
        let mut chunk = [0u8; 8192];
        while !self.exhausted && self.decoded.len() < DECODE_THRESHOLD {
            let n = self.zr.read(&mut chunk)?;
            if n == 0 {
                self.exhausted = true;
            }
            self.uncompressed.extend_from_slice(&chunk[..n]);

            // Peel off complete scanlines: drop the filter byte, keep the rest.
            while self.uncompressed.len() > self.sl_size {
                self.decoded
                    .extend_from_slice(&self.uncompressed[1..=self.sl_size]);
                self.uncompressed.drain(..=self.sl_size);
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for BlobReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.refill()?;
        if self.decoded.is_empty() {
            return Ok(0); // end of blob
        }

        let mut n = self.decoded.len().min(buf.len());
        if n >= AES_BLOCK {
            n -= n % AES_BLOCK;
        }
        buf[..n].copy_from_slice(&self.decoded[..n]);
        self.decoded.drain(..n);
        Ok(n)
    }
}

fn parse_decimal(value: &[u8], tag: &'static str) -> Result<u64, StegoError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or(StegoError::BadMetadata(tag))
}

fn parse_decimal_signed(value: &[u8], tag: &'static str) -> Result<i64, StegoError> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or(StegoError::BadMetadata(tag))
}
