//! Client for the proxy's stat service.

use std::time::Duration;

use hgms_core::stat::{status_to_errno, StatAttr, StatDirent};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Characters escaped within a path segment when building URLs.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?');

/// Percent-encodes a relative path, segment by segment.
pub fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|seg| utf8_percent_encode(seg, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

pub struct StatClient {
    base: String,
    http: reqwest::blocking::Client,
}

impl StatClient {
    /// `base_url` is the proxy root, webroot included; a trailing slash
    /// is added if missing.
    pub fn new(base_url: &str, header_timeout: Duration) -> Result<Self, reqwest::Error> {
        let mut base = base_url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(header_timeout)
            .timeout(None::<Duration>)
            .build()?;
        Ok(Self { base, http })
    }

    /// Stats one path. Errors come back as errnos, decoded from the wire
    /// status (405 means `EACCES`, see [`hgms_core::stat`]).
    pub fn stat(&self, path: &str) -> Result<StatAttr, i32> {
        self.request(&format!("{}_statsvc/{}", self.base, encode_path(path)))
    }

    /// Lists one directory.
    pub fn read_dir(&self, path: &str) -> Result<Vec<StatDirent>, i32> {
        self.request(&format!(
            "{}_statsvc/{}?op=readdir",
            self.base,
            encode_path(path)
        ))
    }

    fn request<T: DeserializeOwned>(&self, url: &str) -> Result<T, i32> {
        debug!(url, "stat rpc");
        let resp = self.http.get(url).send().map_err(|e| {
            debug!(error = %e, "stat rpc failed");
            libc::EIO
        })?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(status_to_errno(status));
        }
        resp.json().map_err(|_| libc::EIO)
    }
}
