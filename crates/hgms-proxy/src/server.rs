//! HTTP server lifecycle and request routing.
//!
//! One [`ProxyServer`] owns the listening socket and an accept loop; every
//! connection is served by [`route`], which dispatches between the alias
//! namespace, the static assets and the stat service. The backend HTTP
//! client is shared process-wide for connection reuse.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use percent_encoding::percent_decode_str;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::{ProxyConfig, ASSETS_PREFIX, STATSVC_PREFIX};
use crate::{assets, serve, statsvc};

/// Response body used everywhere in the proxy: either a buffered message
/// or a channel-fed decrypt stream.
pub type Body = BoxBody<Bytes, io::Error>;

/// Shared per-process state.
pub struct ProxyState {
    pub config: ProxyConfig,
    /// Backend client for replica fetches. reqwest keeps a connection
    /// pool inside and honours the `HTTP_PROXY`/`HTTPS_PROXY` environment.
    pub backend: reqwest::blocking::Client,
}

/// A running proxy instance.
pub struct ProxyServer {
    /// The actual bound address.
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl ProxyServer {
    /// Binds the listener and spawns the accept loop.
    pub async fn start(config: ProxyConfig) -> Result<Self, io::Error> {
        let config = config.normalize();
        let addr = SocketAddr::new(config.bind_address, config.port);
        let listener = TcpListener::bind(addr).await?;
        let actual_addr = listener.local_addr()?;

        // The blocking client spins up its own I/O thread; build it off
        // the async runtime.
        let header_timeout = config.backend_header_timeout;
        let backend = tokio::task::spawn_blocking(move || {
            reqwest::blocking::Client::builder()
                .connect_timeout(header_timeout)
                .timeout(None::<Duration>) // body streaming must not time out
                .build()
        })
        .await
        .map_err(io::Error::other)?
        .map_err(io::Error::other)?;

        info!(addr = %actual_addr, webroot = %config.webroot, "proxy accepting connections");

        let state = Arc::new(ProxyState { config, backend });
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let server_handle = tokio::spawn(async move {
            tokio::select! {
                () = run_server(listener, state) => {
                    debug!("server loop ended");
                }
                _ = shutdown_rx => {
                    info!("received shutdown signal");
                }
            }
        });

        Ok(Self {
            addr: actual_addr,
            shutdown_tx: Some(shutdown_tx),
            server_handle: Some(server_handle),
        })
    }

    /// Base URL of this server, webroot excluded.
    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Stop the server.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            let _ = handle.await;
        }
        info!("proxy stopped");
    }

    fn stop_sync(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.stop_sync();
    }
}

async fn run_server(listener: TcpListener, state: Arc<ProxyState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(route(state, req).await) }
                    });

                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await
                    {
                        warn!(peer = %peer_addr, error = %e, "HTTP connection error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "failed to accept connection");
            }
        }
    }
}

/// Dispatches one request by path.
async fn route(state: Arc<ProxyState>, req: Request<Incoming>) -> Response<Body> {
    let raw_path = req.uri().path().to_string();
    let decoded = percent_decode_str(&raw_path).decode_utf8_lossy().into_owned();
    let path = decoded.trim_start_matches('/');

    debug!(path = %decoded, method = %req.method(), "request");

    let Some(rest) = path.strip_prefix(state.config.webroot.as_str()) else {
        return text_response(StatusCode::NOT_FOUND, "File not found\n");
    };

    if let Some(stat_path) = rest.strip_prefix(STATSVC_PREFIX) {
        let stat_path = stat_path.to_string();
        return statsvc::handle(&state, &req, &stat_path).await;
    }
    if let Some(asset) = rest.strip_prefix(ASSETS_PREFIX) {
        return assets::handle(asset);
    }
    let rest = rest.to_string();
    serve::handle_alias(state, req, &rest).await
}

/// Builds a buffered body.
pub fn full_body(data: impl Into<Bytes>) -> Body {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Builds a plain-text response with the given status.
pub fn text_response(status: StatusCode, msg: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body(msg))
        .unwrap_or_else(|_| Response::new(full_body(msg)))
}
