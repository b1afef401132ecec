//! PNG envelope writer, the ingest-side dual of [`BlobReader`].
//!
//! Output shape, in order: signature, `IHDR` (8-bit truecolour), one
//! `tEXt` chunk per sidechannel tag (`IV`, `CONTENTSIZE`, `BLOBSIZE`),
//! a single zlib `IDAT` whose scanlines are the ciphertext with a leading
//! filter byte of 0, and `IEND`. Chunk CRCs are written properly so the
//! images survive re-serving by image-aware hosts.
//!
//! [`BlobReader`]: super::BlobReader

use std::io::{self, Write};

use crc::{Crc, CRC_32_ISO_HDLC};
use flate2::write::ZlibEncoder;
use flate2::Compression;

const PNG_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Builder for blob PNGs.
#[derive(Debug, Clone, Copy)]
pub struct BlobEncoder {
    /// Pixels per scanline; one pixel carries three payload bytes.
    width: u32,
}

impl Default for BlobEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BlobEncoder {
    pub fn new() -> Self {
        // 16 pixels -> 48-byte scanlines, small enough that padding waste
        // stays under one AES block per three rows.
        Self { width: 16 }
    }

    /// Overrides the scanline width in pixels.
    pub fn with_width(width: u32) -> Self {
        Self { width: width.max(1) }
    }

    /// Writes a complete PNG wrapping `ciphertext` to `w`.
    ///
    /// The ciphertext is zero-padded up to a whole number of scanlines;
    /// the decoder never reads past the declared `BLOBSIZE`, so the pad
    /// bytes are inert.
    pub fn encode<W: Write>(
        &self,
        w: &mut W,
        ciphertext: &[u8],
        iv: &[u8],
        content_size: u64,
        blob_size: i64,
    ) -> io::Result<()> {
        if iv.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "blob IV must not be empty",
            ));
        }

        let sl_size = self.width as usize * 3;
        let rows = ciphertext.len().div_ceil(sl_size).max(1);

        w.write_all(&[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a])?;

        // IHDR: width, height, bit depth 8, colour type 2 (truecolour),
        // default compression/filter, no interlacing.
        let mut ihdr = Vec::with_capacity(13);
        ihdr.extend_from_slice(&self.width.to_be_bytes());
        ihdr.extend_from_slice(&(rows as u32).to_be_bytes());
        ihdr.extend_from_slice(&[8, 2, 0, 0, 0]);
        write_chunk(w, b"IHDR", &ihdr)?;

        write_chunk(w, b"tEXt", &tag(b"IV", iv))?;
        write_chunk(w, b"tEXt", &tag(b"CONTENTSIZE", content_size.to_string().as_bytes()))?;
        write_chunk(w, b"tEXt", &tag(b"BLOBSIZE", blob_size.to_string().as_bytes()))?;

        // IDAT: filter byte 0 before every scanline, zlib-compressed.
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        for row in 0..rows {
            enc.write_all(&[0])?;
            let start = row * sl_size;
            let end = ((row + 1) * sl_size).min(ciphertext.len());
            if start < ciphertext.len() {
                enc.write_all(&ciphertext[start..end])?;
            }
            let short = sl_size - (end.saturating_sub(start));
            if short > 0 {
                enc.write_all(&vec![0u8; short])?;
            }
        }
        let idat = enc.finish()?;
        write_chunk(w, b"IDAT", &idat)?;

        write_chunk(w, b"IEND", &[])
    }
}

fn tag(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut v = Vec::with_capacity(key.len() + 1 + value.len());
    v.extend_from_slice(key);
    v.push(b'=');
    v.extend_from_slice(value);
    v
}

fn write_chunk<W: Write>(w: &mut W, ctype: &[u8; 4], payload: &[u8]) -> io::Result<()> {
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(ctype)?;
    w.write_all(payload)?;

    let mut digest = PNG_CRC.digest();
    digest.update(ctype);
    digest.update(payload);
    w.write_all(&digest.finalize().to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_starts_with_signature_and_ihdr() {
        let mut out = Vec::new();
        BlobEncoder::new()
            .encode(&mut out, &[0u8; 96], &[9u8; 16], 96, 96)
            .unwrap();
        assert_eq!(&out[..8], &[0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a]);
        assert_eq!(&out[12..16], b"IHDR");
    }

    #[test]
    fn empty_iv_refused() {
        let mut out = Vec::new();
        let err = BlobEncoder::new()
            .encode(&mut out, &[0u8; 96], &[], 96, 96)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
