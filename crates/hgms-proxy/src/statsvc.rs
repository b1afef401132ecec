//! Stat service: the JSON RPC endpoint the FUSE client runs against.
//!
//! `GET /{webroot}_statsvc/{path}` returns the attributes of one path in
//! the alias tree; `?op=readdir` returns the directory listing instead.
//! Alias files additionally report the user-visible content size and the
//! blob geometry, so the filesystem never has to parse sidecars itself.

use hyper::body::Incoming;
use hyper::{header, Request, Response, StatusCode};
use tracing::debug;

use hgms_core::stat::{self, StatAttr};
use hgms_core::Alias;

use crate::serve::query_param;
use crate::server::{full_body, Body, ProxyState};

pub async fn handle(state: &ProxyState, req: &Request<Incoming>, rel: &str) -> Response<Body> {
    let readdir = query_param(req.uri().query(), "op") == Some("readdir");
    let path = state.config.alias_root.join(rel.trim_start_matches('/'));

    debug!(path = %path.display(), readdir, "stat request");

    if rel.split('/').any(|seg| seg == "..") {
        return json_response(StatusCode::NOT_FOUND, Vec::new());
    }

    let result = tokio::task::spawn_blocking(move || {
        if readdir {
            stat::local_read_dir(&path).map(|list| serde_json::to_vec(&list))
        } else {
            stat::local_stat(&path).map(|attr| serde_json::to_vec(&augment(attr, &path)))
        }
    })
    .await;

    match result {
        Ok(Ok(Ok(json))) => json_response(StatusCode::OK, json),
        Ok(Ok(Err(_))) | Err(_) => json_response(StatusCode::INTERNAL_SERVER_ERROR, Vec::new()),
        Ok(Err(io_err)) => {
            let status = StatusCode::from_u16(stat::io_error_to_status(&io_err))
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            json_response(status, Vec::new())
        }
    }
}

/// Attaches the alias geometry to file attributes. Files that are not
/// parseable aliases keep their plain stat.
fn augment(mut attr: StatAttr, path: &std::path::Path) -> StatAttr {
    if !attr.is_dir() {
        if let Ok(alias) = Alias::load(path) {
            attr.content_size = Some(alias.content_size);
            attr.blob_size = Some(alias.blob_size);
        }
    }
    attr
}

fn json_response(status: StatusCode, json: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full_body(json))
        .unwrap_or_else(|_| Response::new(full_body("")))
}
