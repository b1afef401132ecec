//! Static assets embedded into the binary.

use hyper::{header, Response, StatusCode};

use crate::server::{full_body, text_response, Body};

pub fn handle(name: &str) -> Response<Body> {
    let (content_type, bytes): (&str, &[u8]) = match name {
        "style.css" => ("text/css", include_bytes!("assets/style.css")),
        _ => return text_response(StatusCode::NOT_FOUND, "No such asset\n"),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(full_body(bytes))
        .unwrap_or_else(|_| text_response(StatusCode::NOT_FOUND, "No such asset\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_unknown_assets() {
        assert_eq!(handle("style.css").status(), StatusCode::OK);
        assert_eq!(handle("nope.js").status(), StatusCode::NOT_FOUND);
    }
}
