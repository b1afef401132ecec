//! Alias requests: lookup, range handling and the blob reassembly stream.
//!
//! The interesting part happens in [`stream_blobs`], which runs on a
//! blocking thread: for every blob it walks a freshly shuffled replica
//! list, opens the first one whose PNG envelope parses, and pipes
//! PNG-decoder output through the AES codec into a channel that feeds the
//! hyper response body. Response headers are decided by the first replica
//! that answers, which is why they travel back through a oneshot.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header;
use hyper::{Request, Response, StatusCode};
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use hgms_core::crypto::AesCbc;
use hgms_core::stego::BlobReader;
use hgms_core::Alias;

use crate::dirlist;
use crate::server::{full_body, text_response, Body, ProxyState};

const FORMAT_DOWNLOAD: &str = "download";
const FORMAT_M3U: &str = "m3u";

/// Response headers decided once the first replica answers.
enum Head {
    Stream {
        status: StatusCode,
        content_length: u64,
        content_range: Option<String>,
        last_modified: String,
        attachment: Option<String>,
    },
    /// No replica of the first served blob worked.
    Failed,
}

/// Serves `GET /{webroot}{rel_path}`.
pub async fn handle_alias(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
    rel_path: &str,
) -> Response<Body> {
    let format = query_param(req.uri().query(), "format").unwrap_or("");

    // The alias namespace is strictly below the alias root.
    if rel_path.split('/').any(|seg| seg == "..") {
        return text_response(StatusCode::NOT_FOUND, "File not found\n");
    }

    let mut alias_path = state.config.alias_root.join(rel_path.trim_start_matches('/'));

    let Ok(md) = tokio::fs::metadata(&alias_path).await else {
        return text_response(StatusCode::NOT_FOUND, "File not found\n");
    };

    if md.is_dir() {
        if !req.uri().path().ends_with('/') {
            // Trailing-slash redirect keeps relative links working.
            return Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, format!("{}/", req.uri().path()))
                .body(full_body(""))
                .unwrap_or_else(|_| text_response(StatusCode::NOT_FOUND, "File not found\n"));
        }

        let index = alias_path.join("index.html");
        if tokio::fs::metadata(&index).await.is_ok() {
            alias_path = index;
        } else {
            return match format {
                "" => dirlist::render(&state, rel_path, alias_path).await,
                FORMAT_M3U => dirlist::playlist(&state, &req, rel_path, alias_path).await,
                _ => text_response(StatusCode::NOT_IMPLEMENTED, "Unknown format requested\n"),
            };
        }
    }

    serve_file(state, &req, &alias_path, rel_path, format).await
}

/// Serves one alias file: parses the sidecar, evaluates the conditional
/// and range headers, then hands off to the streaming pipeline.
async fn serve_file(
    state: Arc<ProxyState>,
    req: &Request<Incoming>,
    alias_path: &Path,
    rel_path: &str,
    format: &str,
) -> Response<Body> {
    let Ok(content) = tokio::fs::read(alias_path).await else {
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read alias\n");
    };
    let alias = match Alias::from_json(&content) {
        Ok(a) => a,
        Err(e) => {
            warn!(path = %alias_path.display(), error = %e, "corrupted alias");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Corrupted metadata\n");
        }
    };

    if let Some(ims) = if_modified_since(req) {
        if ims > 0 && alias.created <= ims {
            return text_response(StatusCode::NOT_MODIFIED, "Not modified");
        }
    }

    let range_from = range_start(req).unwrap_or(0);
    if range_from >= alias.content_size {
        return text_response(
            StatusCode::RANGE_NOT_SATISFIABLE,
            "Requested range not satisfiable\n",
        );
    }

    let attachment = if range_from == 0 && format == FORMAT_DOWNLOAD {
        basename(rel_path).map(str::to_string)
    } else {
        None
    };

    debug!(
        path = %rel_path,
        range_from,
        attachment = ?attachment,
        "serving alias"
    );

    // Everything from here on is blocking I/O: run the pipeline on the
    // blocking pool and stream its output through a channel body.
    let key = match alias.key_bytes() {
        Ok(k) => k,
        Err(_) => {
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Corrupted metadata\n")
        }
    };
    let (head_tx, head_rx) = oneshot::channel::<Head>();
    let (body_tx, body_rx) = mpsc::channel::<Result<Frame<Bytes>, io::Error>>(8);

    let backend = state.backend.clone();
    let created = alias.created;
    tokio::task::spawn_blocking(move || {
        stream_blobs(&backend, &alias, &key, range_from, created, attachment, head_tx, body_tx);
    });

    match head_rx.await {
        Ok(Head::Stream {
            status,
            content_length,
            content_range,
            last_modified,
            attachment,
        }) => {
            let mut builder = Response::builder()
                .status(status)
                .header(header::LAST_MODIFIED, last_modified)
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::CONTENT_LENGTH, content_length);
            if let Some(range) = content_range {
                builder = builder.header(header::CONTENT_RANGE, range);
            }
            if let Some(name) = attachment {
                builder = builder.header(
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", escape_quotes(&name)),
                );
            }
            let body = BodyExt::boxed(StreamBody::new(ReceiverStream::new(body_rx)));
            builder
                .body(body)
                .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, ":-(\n"))
        }
        Ok(Head::Failed) | Err(_) => {
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error :-(\n")
        }
    }
}

/// Blocking pipeline: blobs in order, replicas in random order, bytes in
/// strictly increasing plaintext-offset order.
#[allow(clippy::too_many_arguments)]
fn stream_blobs(
    backend: &reqwest::blocking::Client,
    alias: &Alias,
    key: &[u8],
    range_from: u64,
    created: i64,
    attachment: Option<String>,
    head_tx: oneshot::Sender<Head>,
    body_tx: mpsc::Sender<Result<Frame<Bytes>, io::Error>>,
) {
    let (first_blob, mut skip) = alias.seek(range_from);
    let num_blobs = alias.num_blobs() as u64;
    let num_copies = alias.num_copies();

    debug!(
        num_copies,
        num_blobs, first_blob, skip, "starting blob stream"
    );

    let mut head_tx = Some(head_tx);
    // The AES layer writes one window per cipher block; buffer those into
    // reasonably sized body frames.
    let mut writer = io::BufWriter::with_capacity(8192, ChannelWriter { tx: body_tx });

    for b_idx in first_blob..num_blobs {
        let mut order: Vec<usize> = (0..num_copies).collect();
        order.shuffle(&mut rand::rng());

        let mut served = false;
        for c in order {
            let url = &alias.location[c][b_idx as usize];
            debug!(replica = c, blob = b_idx, url = %url, "checking replica");

            // Per-replica failures are silent: the next replica is the
            // error handler.
            let resp = match backend.get(url).send() {
                Ok(r) if r.status().is_success() => r,
                Ok(r) => {
                    debug!(replica = c, status = %r.status(), "replica refused request");
                    continue;
                }
                Err(e) => {
                    debug!(replica = c, error = %e, "replica unreachable");
                    continue;
                }
            };

            let mut png = match BlobReader::open(resp) {
                Ok(p) => p,
                Err(e) => {
                    debug!(replica = c, error = %e, "replica payload rejected");
                    continue;
                }
            };

            if let Some(tx) = head_tx.take() {
                if tx
                    .send(make_head(&png, created, range_from, attachment.clone()))
                    .is_err()
                {
                    return; // client went away before headers
                }
            }

            let mut codec = match AesCbc::new(key, png.iv(), Some(png.blob_size().max(0) as u64))
            {
                Ok(c) => c,
                Err(e) => {
                    // The key was validated at alias load; reaching this
                    // means the sidecar changed under us.
                    error!(error = %e, "cannot construct cipher");
                    return;
                }
            };

            debug!(replica = c, blob = b_idx, skip, "replica ok, streaming");
            match codec.decrypt_stream_skip(&mut writer, &mut png, &mut skip) {
                Ok(_) => {
                    served = true;
                }
                Err(e) => {
                    // The client already holds a partial stream; replaying
                    // this blob from another replica would corrupt it.
                    warn!(blob = b_idx, error = %e, "stream aborted mid-blob");
                }
            }
            break;
        }

        if !served {
            if let Some(tx) = head_tx.take() {
                let _ = tx.send(Head::Failed);
            }
            error!(blob = b_idx, "failed to deliver blob, aborting request");
            return;
        }
    }
}

fn make_head(
    png: &BlobReader<reqwest::blocking::Response>,
    created: i64,
    range_from: u64,
    attachment: Option<String>,
) -> Head {
    let content_size = png.content_size();
    let last_modified =
        httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(created.max(0) as u64));

    if range_from == 0 {
        Head::Stream {
            status: StatusCode::OK,
            content_length: content_size,
            content_range: None,
            last_modified,
            attachment,
        }
    } else {
        Head::Stream {
            status: StatusCode::PARTIAL_CONTENT,
            content_length: content_size - range_from,
            content_range: Some(format!(
                "bytes {}-{}/{}",
                range_from,
                content_size.saturating_sub(1),
                content_size
            )),
            last_modified,
            attachment,
        }
    }
}

/// `io::Write` adapter feeding the hyper response body channel. A closed
/// channel (client disconnect) surfaces as `BrokenPipe`, which stops the
/// reassembler at its next write.
struct ChannelWriter {
    tx: mpsc::Sender<Result<Frame<Bytes>, io::Error>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Frame::data(Bytes::copy_from_slice(buf))))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Extracts a single query parameter from a raw query string.
pub fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?.split('&').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        (k == key).then_some(v)
    })
}

/// Parses `Range: bytes=N-`; any other range shape is ignored and the
/// request served from the start.
fn range_start<B>(req: &Request<B>) -> Option<u64> {
    let value = req.headers().get(header::RANGE)?.to_str().ok()?;
    value
        .strip_prefix("bytes=")?
        .strip_suffix('-')?
        .parse()
        .ok()
}

/// Parses `If-Modified-Since` into POSIX seconds.
fn if_modified_since<B>(req: &Request<B>) -> Option<i64> {
    let value = req.headers().get(header::IF_MODIFIED_SINCE)?.to_str().ok()?;
    let when = httpdate::parse_http_date(value).ok()?;
    Some(when.duration_since(UNIX_EPOCH).ok()?.as_secs() as i64)
}

fn basename(path: &str) -> Option<&str> {
    path.rsplit('/').find(|s| !s.is_empty())
}

fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_shapes() {
        let req = |v: &str| {
            Request::builder()
                .header(header::RANGE, v)
                .body(())
                .unwrap()
        };
        assert_eq!(range_start(&req("bytes=0-")), Some(0));
        assert_eq!(range_start(&req("bytes=1234-")), Some(1234));
        assert_eq!(range_start(&req("bytes=0-99")), None, "closed ranges unsupported");
        assert_eq!(range_start(&req("bytes=-500")), None);
        assert_eq!(range_start(&req("chars=5-")), None);
    }

    #[test]
    fn if_modified_since_parses_http_dates() {
        let req = Request::builder()
            .header(header::IF_MODIFIED_SINCE, "Thu, 01 Jan 1970 00:01:40 GMT")
            .body(())
            .unwrap();
        assert_eq!(if_modified_since(&req), Some(100));

        let req = Request::builder()
            .header(header::IF_MODIFIED_SINCE, "not a date")
            .body(())
            .unwrap();
        assert_eq!(if_modified_since(&req), None);
    }

    #[test]
    fn filename_escaping() {
        assert_eq!(escape_quotes(r#"a"b\c"#), r#"a\"b\\c"#);
        assert_eq!(basename("dir/sub/file.bin"), Some("file.bin"));
        assert_eq!(basename("file.bin"), Some("file.bin"));
        assert_eq!(basename(""), None);
    }

    #[test]
    fn query_params() {
        assert_eq!(query_param(Some("format=m3u"), "format"), Some("m3u"));
        assert_eq!(query_param(Some("a=1&format=download"), "format"), Some("download"));
        assert_eq!(query_param(Some("a=1"), "format"), None);
        assert_eq!(query_param(None, "format"), None);
    }
}
