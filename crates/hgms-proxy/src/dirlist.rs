//! Directory views: HTML index and M3U playlist.

use std::fmt::Write as _;
use std::path::PathBuf;

use hyper::body::Incoming;
use hyper::{header, Request, Response, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};

use crate::config::ASSETS_PREFIX;
use crate::server::{full_body, text_response, Body, ProxyState};

/// Characters escaped inside one path segment of a link.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'/');

/// File extensions that end up in playlists.
const MEDIA_EXTENSIONS: &[&str] = &[
    "aac", "avi", "flac", "m4a", "m4v", "mkv", "mov", "mp3", "mp4", "mpg", "ogg", "wav", "webm",
];

/// Renders an HTML listing of an alias directory.
pub async fn render(state: &ProxyState, rel: &str, fs_path: PathBuf) -> Response<Body> {
    let Ok(entries) = tokio::task::spawn_blocking(move || hgms_core::stat::local_read_dir(&fs_path))
        .await
        .map(|r| r.unwrap_or_default())
    else {
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Listing failed\n");
    };

    let mut html = String::new();
    let _ = write!(
        html,
        "<html><head><meta charset='UTF-8'>\
         <meta name='viewport' content='width=device-width'>\
         <link rel='stylesheet' href='/{}{}style.css'>\
         <title>{}</title></head><body>\n",
        state.config.webroot,
        ASSETS_PREFIX,
        escape_html(if rel.is_empty() { "/" } else { rel }),
    );
    html.push_str("<a href=\"../\">back</a><br>\n");

    for entry in entries {
        let mut link = utf8_percent_encode(&entry.name, SEGMENT).to_string();
        if entry.is_dir {
            link.push('/');
        }
        let class = if entry.is_dir { "dir" } else { "file" };
        let _ = write!(
            html,
            "<a class=\"{}\" href=\"{}\">{}</a><br>\n",
            class,
            link,
            escape_html(&entry.name)
        );
    }
    html.push_str("<hr><i>hgms</i></body></html>\n");

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html")
        .body(full_body(html))
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "Listing failed\n"))
}

/// Renders a directory as an M3U playlist of its media files, with
/// absolute URLs against the requesting host.
pub async fn playlist(
    state: &ProxyState,
    req: &Request<Incoming>,
    rel: &str,
    fs_path: PathBuf,
) -> Response<Body> {
    let Ok(entries) = tokio::task::spawn_blocking(move || hgms_core::stat::local_read_dir(&fs_path))
        .await
        .map(|r| r.unwrap_or_default())
    else {
        return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Listing failed\n");
    };

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");

    let mut m3u = String::from("#EXTM3U\n");
    for entry in entries {
        if entry.is_dir || !is_media(&entry.name) {
            continue;
        }
        let _ = writeln!(
            m3u,
            "http://{}/{}{}{}",
            host,
            state.config.webroot,
            encode_path(rel),
            utf8_percent_encode(&entry.name, SEGMENT),
        );
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "audio/x-mpegurl")
        .body(full_body(m3u))
        .unwrap_or_else(|_| text_response(StatusCode::INTERNAL_SERVER_ERROR, "Listing failed\n"))
}

fn is_media(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Percent-encodes a relative directory path, keeping the separators.
fn encode_path(rel: &str) -> String {
    rel.split('/')
        .map(|seg| utf8_percent_encode(seg, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_detection() {
        assert!(is_media("song.mp3"));
        assert!(is_media("clip.MKV"));
        assert!(!is_media("notes.txt"));
        assert!(!is_media("noextension"));
    }

    #[test]
    fn html_escaping() {
        assert_eq!(escape_html("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&#39;");
    }

    #[test]
    fn path_encoding_keeps_separators() {
        assert_eq!(encode_path("a b/c"), "a%20b/c");
    }
}
