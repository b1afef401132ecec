//! End-to-end blob pipeline: plaintext -> AES-CBC -> PNG -> decode -> plaintext.

use std::io::Read;

use hgms_core::crypto::{AesCbc, PadReader};
use hgms_core::stego::{BlobEncoder, BlobReader};

const KEY: [u8; 16] = [0x11; 16];
const IV: [u8; 16] = [0x22; 16];

/// Encrypts `plain` and wraps it into a blob PNG the way the ingest path
/// would.
fn seal(plain: &[u8], content_size: u64) -> Vec<u8> {
    let mut codec = AesCbc::new(&KEY, &IV, None).unwrap();
    let mut ciphertext = Vec::new();
    let mut src = PadReader::new(plain);
    codec.encrypt_stream(&mut ciphertext, &mut src).unwrap();

    let mut png = Vec::new();
    BlobEncoder::new()
        .encode(&mut png, &ciphertext, &IV, content_size, plain.len() as i64)
        .unwrap();
    png
}

/// Decodes a blob PNG and decrypts its payload, optionally skipping a
/// prefix, as the proxy does per blob.
fn unseal(png: &[u8], skip: &mut u64) -> Vec<u8> {
    let mut reader = BlobReader::open(png).unwrap();
    let mut codec = AesCbc::new(&KEY, reader.iv(), Some(reader.blob_size() as u64)).unwrap();
    let mut out = Vec::new();
    codec
        .decrypt_stream_skip(&mut out, &mut reader, skip)
        .unwrap();
    out
}

#[test]
fn full_blob_roundtrip() {
    let plain: Vec<u8> = (0..100_000u32).map(|i| (i * 7 % 253) as u8).collect();
    let png = seal(&plain, plain.len() as u64);

    let mut reader = BlobReader::open(&png[..]).unwrap();
    assert_eq!(reader.iv(), &IV);
    assert_eq!(reader.content_size(), plain.len() as u64);
    assert_eq!(reader.blob_size(), plain.len() as i64);
    drop(reader);

    let mut skip = 0u64;
    assert_eq!(unseal(&png, &mut skip), plain);
}

#[test]
fn non_block_multiple_content() {
    let plain = b"hello"; // 5 bytes, padded to one AES block on disk
    let png = seal(plain, 5);
    let mut skip = 0u64;
    assert_eq!(unseal(&png, &mut skip), plain);
}

#[test]
fn skip_prefix_yields_suffix() {
    let plain: Vec<u8> = (1..=20u8).collect();
    let png = seal(&plain, 20);
    let mut skip = 18u64;
    assert_eq!(unseal(&png, &mut skip), &plain[18..]);
    assert_eq!(skip, 0);
}

#[test]
fn ciphertext_stream_reads_in_blocks() {
    // 4800 is a multiple of both the AES block and the 48-byte scanline,
    // so the decoded stream length matches the ciphertext exactly.
    let plain = vec![9u8; 4800];
    let png = seal(&plain, 4800);
    let mut reader = BlobReader::open(&png[..]).unwrap();

    let mut total = 0usize;
    let mut buf = [0u8; 1000];
    loop {
        let n = reader.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        assert_eq!(n % 16, 0, "reads stay block-aligned until EOF");
        total += n;
    }
    assert_eq!(total, 4800);
}
