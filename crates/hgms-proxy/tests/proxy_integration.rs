//! End-to-end proxy tests against a scripted blob host.
//!
//! The blob host is a minimal HTTP/1.1 responder on a plain TCP listener:
//! it serves a path->bytes map, logs every requested path, and closes the
//! connection after each response. Fixtures are built with the real
//! encoder so the whole PNG -> AES -> HTTP pipeline is exercised.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hgms_core::crypto::{AesCbc, PadReader};
use hgms_core::stego::BlobEncoder;
use hgms_core::Alias;
use hgms_proxy::{ProxyConfig, ProxyServer};

// ---------------------------------------------------------------------------
// Scripted blob host

#[derive(Clone)]
struct BlobHost {
    addr: SocketAddr,
    blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl BlobHost {
    fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let blobs: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::default();
        let log: Arc<Mutex<Vec<String>>> = Arc::default();

        let host = Self { addr, blobs, log };
        let serve = host.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let serve = serve.clone();
                std::thread::spawn(move || serve.answer(stream));
            }
        });
        host
    }

    fn answer(&self, stream: TcpStream) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut line = String::new();
        if reader.read_line(&mut line).is_err() {
            return;
        }
        let path = line.split_whitespace().nth(1).unwrap_or("/").to_string();
        // Drain the remaining request headers.
        loop {
            let mut hdr = String::new();
            match reader.read_line(&mut hdr) {
                Ok(_) if hdr.trim().is_empty() => break,
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
        self.log.lock().unwrap().push(path.clone());

        let body = self.blobs.lock().unwrap().get(&path).cloned();
        let mut stream = stream;
        match body {
            Some(bytes) => {
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    bytes.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(&bytes);
            }
            None => {
                let _ = stream.write_all(
                    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                );
            }
        }
    }

    fn insert(&self, path: &str, bytes: Vec<u8>) {
        self.blobs.lock().unwrap().insert(path.to_string(), bytes);
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn requests(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Fixtures

const KEY: [u8; 16] = [0u8; 16];

fn key_hex() -> String {
    hex::encode(KEY)
}

fn blob_iv(idx: usize) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0] = idx as u8;
    iv[15] = 0x5c;
    iv
}

/// Encrypts one blob's plaintext chunk and wraps it in a PNG.
fn seal_blob(chunk: &[u8], idx: usize, content_size: u64) -> Vec<u8> {
    let iv = blob_iv(idx);
    let mut codec = AesCbc::new(&KEY, &iv, None).unwrap();
    let mut ciphertext = Vec::new();
    let mut src = PadReader::new(chunk);
    codec.encrypt_stream(&mut ciphertext, &mut src).unwrap();

    let mut png = Vec::new();
    BlobEncoder::new()
        .encode(&mut png, &ciphertext, &iv, content_size, chunk.len() as i64)
        .unwrap();
    png
}

/// Publishes `plaintext` as blobs on every listed replica host and writes
/// the alias sidecar. `tag` keeps blob paths unique per fixture.
fn publish(
    alias_root: &Path,
    name: &str,
    tag: &str,
    plaintext: &[u8],
    blob_size: usize,
    created: i64,
    replicas: &[&BlobHost],
) {
    let num_blobs = plaintext.len().div_ceil(blob_size);
    let mut location = Vec::new();
    for (c, host) in replicas.iter().enumerate() {
        let mut row = Vec::new();
        for i in 0..num_blobs {
            let path = format!("/{tag}/r{c}/blob{i}.png");
            let chunk = &plaintext[i * blob_size..((i + 1) * blob_size).min(plaintext.len())];
            host.insert(&path, seal_blob(chunk, i, plaintext.len() as u64));
            row.push(host.url(&path));
        }
        location.push(row);
    }

    let alias = Alias {
        location,
        key: key_hex(),
        created,
        content_size: plaintext.len() as u64,
        blob_size: blob_size as i64,
    };
    let path = alias_root.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, serde_json::to_vec(&alias).unwrap()).unwrap();
}

struct TestProxy {
    rt: tokio::runtime::Runtime,
    server: Option<ProxyServer>,
    _alias_dir: tempfile::TempDir,
    client: reqwest::blocking::Client,
}

impl TestProxy {
    fn start(alias_dir: tempfile::TempDir) -> Self {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let config = ProxyConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            port: 0,
            alias_root: alias_dir.path().to_path_buf(),
            backend_header_timeout: Duration::from_secs(5),
            ..ProxyConfig::default()
        };
        let server = rt.block_on(ProxyServer::start(config)).unwrap();
        let client = reqwest::blocking::Client::builder()
            .no_proxy()
            .build()
            .unwrap();
        Self {
            rt,
            server: Some(server),
            _alias_dir: alias_dir,
            client,
        }
    }

    fn get(&self, path: &str) -> reqwest::blocking::RequestBuilder {
        let url = format!("{}{}", self.server.as_ref().unwrap().url(), path);
        self.client.get(url)
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            self.rt.block_on(server.stop());
        }
    }
}

// ---------------------------------------------------------------------------
// Scenarios

#[test]
fn single_blob_no_range() {
    let host = BlobHost::start();
    let dir = tempfile::TempDir::new().unwrap();
    publish(dir.path(), "x", "s1", b"hello", 16, 1420070400, &[&host]);
    let proxy = TestProxy::start(dir);

    let resp = proxy.get("x").send().unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.content_length(), Some(5));
    assert!(resp.headers().get("last-modified").is_some());
    assert_eq!(resp.headers().get("accept-ranges").unwrap(), "bytes");
    assert_eq!(resp.bytes().unwrap().as_ref(), b"hello");
}

#[test]
fn two_blob_mid_blob_range() {
    let plaintext: Vec<u8> = (1..=20u8).collect();
    let host = BlobHost::start();
    let dir = tempfile::TempDir::new().unwrap();
    publish(dir.path(), "x", "s2", &plaintext, 16, 100, &[&host]);
    let proxy = TestProxy::start(dir);

    let resp = proxy.get("x").header("Range", "bytes=18-").send().unwrap();
    assert_eq!(resp.status().as_u16(), 206);
    assert_eq!(resp.content_length(), Some(2));
    assert_eq!(
        resp.headers().get("content-range").unwrap(),
        "bytes 18-19/20"
    );
    assert_eq!(resp.bytes().unwrap().as_ref(), &[0x13, 0x14]);
}

#[test]
fn if_modified_since() {
    let host = BlobHost::start();
    let dir = tempfile::TempDir::new().unwrap();
    publish(dir.path(), "x", "s3", b"payload!", 16, 100, &[&host]);
    let proxy = TestProxy::start(dir);

    let resp = proxy
        .get("x")
        .header("If-Modified-Since", "Thu, 01 Jan 1970 00:01:40 GMT")
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 304);

    // An If-Modified-Since before the creation time serves normally.
    let resp = proxy
        .get("x")
        .header("If-Modified-Since", "Thu, 01 Jan 1970 00:00:30 GMT")
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.bytes().unwrap().as_ref(), b"payload!");
}

#[test]
fn png_failure_falls_over_to_next_replica() {
    let bad = BlobHost::start();
    let good = BlobHost::start();
    let dir = tempfile::TempDir::new().unwrap();
    publish(dir.path(), "x", "s4", b"precious data", 16, 100, &[&bad, &good]);

    // Replica 0 answers 200 with garbage instead of a PNG.
    bad.insert("/s4/r0/blob0.png", b"mangled beyond recognition".to_vec());
    let proxy = TestProxy::start(dir);

    for _ in 0..5 {
        let resp = proxy.get("x").send().unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.bytes().unwrap().as_ref(), b"precious data");
    }
}

#[test]
fn missing_alias_is_404_and_corrupt_alias_is_500() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("broken"), b"{ not json").unwrap();
    let proxy = TestProxy::start(dir);

    assert_eq!(proxy.get("nope").send().unwrap().status().as_u16(), 404);
    assert_eq!(proxy.get("broken").send().unwrap().status().as_u16(), 500);
}

#[test]
fn all_replicas_down_is_500() {
    let host = BlobHost::start();
    let dir = tempfile::TempDir::new().unwrap();
    publish(dir.path(), "x", "s5", b"unreachable", 16, 100, &[&host]);
    // Remove the only blob so every replica 404s.
    host.blobs.lock().unwrap().clear();
    let proxy = TestProxy::start(dir);

    let resp = proxy.get("x").send().unwrap();
    assert_eq!(resp.status().as_u16(), 500);
}

#[test]
fn range_correctness_across_blobs() {
    let plaintext: Vec<u8> = (0..40u32).map(|i| (i * 3 + 1) as u8).collect();
    let host = BlobHost::start();
    let dir = tempfile::TempDir::new().unwrap();
    publish(dir.path(), "x", "rng", &plaintext, 16, 100, &[&host]);
    let proxy = TestProxy::start(dir);

    for offset in [0u64, 1, 15, 16, 17, 31, 32, 39] {
        let resp = proxy
            .get("x")
            .header("Range", format!("bytes={offset}-"))
            .send()
            .unwrap();
        let expected_status = if offset == 0 { 200 } else { 206 };
        assert_eq!(resp.status().as_u16(), expected_status, "offset {offset}");
        assert_eq!(resp.content_length(), Some(40 - offset));
        if offset > 0 {
            assert_eq!(
                resp.headers().get("content-range").unwrap().to_str().unwrap(),
                format!("bytes {offset}-39/40")
            );
        }
        assert_eq!(
            resp.bytes().unwrap().as_ref(),
            &plaintext[offset as usize..],
            "offset {offset}"
        );
    }

    let resp = proxy.get("x").header("Range", "bytes=40-").send().unwrap();
    assert_eq!(resp.status().as_u16(), 416);
}

#[test]
fn replica_choice_is_randomised() {
    let a = BlobHost::start();
    let b = BlobHost::start();
    let dir = tempfile::TempDir::new().unwrap();
    publish(dir.path(), "x", "rand", b"coinflip", 16, 100, &[&a, &b]);
    let proxy = TestProxy::start(dir);

    let rounds = 200;
    for _ in 0..rounds {
        let resp = proxy.get("x").send().unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let _ = resp.bytes();
    }

    // With both replicas healthy, exactly one backend request per round;
    // the split converges to 1/2 each.
    let hits_a = a.requests().len();
    let hits_b = b.requests().len();
    assert_eq!(hits_a + hits_b, rounds);
    assert!(
        hits_a > rounds / 5 && hits_b > rounds / 5,
        "replica selection looks deterministic: {hits_a} vs {hits_b}"
    );
}

#[test]
fn single_healthy_replica_serves_every_blob() {
    let healthy = BlobHost::start();
    let dead = BlobHost::start();
    let plaintext: Vec<u8> = (0..48u8).collect();
    let dir = tempfile::TempDir::new().unwrap();
    publish(dir.path(), "x", "fb", &plaintext, 16, 100, &[&dead, &healthy]);
    dead.blobs.lock().unwrap().clear();
    let proxy = TestProxy::start(dir);

    for _ in 0..10 {
        let resp = proxy.get("x").send().unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.bytes().unwrap().as_ref(), &plaintext[..]);
    }
}

#[test]
fn download_format_sets_content_disposition() {
    let host = BlobHost::start();
    let dir = tempfile::TempDir::new().unwrap();
    publish(dir.path(), "docs/report.bin", "dl", b"attach me", 16, 100, &[&host]);
    let proxy = TestProxy::start(dir);

    let resp = proxy.get("docs/report.bin?format=download").send().unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("content-disposition").unwrap(),
        "attachment; filename=\"report.bin\""
    );

    // Range requests never carry an attachment header.
    let resp = proxy
        .get("docs/report.bin?format=download")
        .header("Range", "bytes=2-")
        .send()
        .unwrap();
    assert_eq!(resp.status().as_u16(), 206);
    assert!(resp.headers().get("content-disposition").is_none());
}

#[test]
fn directory_listing_and_stat_service() {
    let host = BlobHost::start();
    let dir = tempfile::TempDir::new().unwrap();
    publish(dir.path(), "music/track.mp3", "ls", b"not actual audio", 16, 100, &[&host]);
    let proxy = TestProxy::start(dir);

    // Directory without trailing slash redirects.
    let resp = proxy.get("music").send().unwrap();
    assert_eq!(resp.status().as_u16(), 200, "redirect is followed");
    let html = resp.text().unwrap();
    assert!(html.contains("track.mp3"), "listing names the entry");

    // Playlist rendering.
    let resp = proxy.get("music/?format=m3u").send().unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "audio/x-mpegurl"
    );
    assert!(resp.text().unwrap().contains("track.mp3"));

    // Stat service: file attrs carry the alias geometry.
    let resp = proxy.get("_statsvc/music/track.mp3").send().unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let attr: serde_json::Value = resp.json().unwrap();
    assert_eq!(attr["ContentSize"], 16);
    assert_eq!(attr["BlobSize"], 16);

    // Stat service: readdir.
    let resp = proxy.get("_statsvc/music?op=readdir").send().unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let list: serde_json::Value = resp.json().unwrap();
    assert_eq!(list[0]["Name"], "track.mp3");
    assert_eq!(list[0]["IsDir"], false);

    // Stat service: missing path.
    let resp = proxy.get("_statsvc/absent").send().unwrap();
    assert_eq!(resp.status().as_u16(), 404);
}
