//! HGMS reverse proxy.
//!
//! Serves the alias tree over HTTP: a `GET` for an alias streams the
//! decrypted file back to the client, fetching each blob from the first
//! reachable replica, pushing it through the PNG decoder and the AES
//! layer on the way out. Directories render as an HTML index (or an M3U
//! playlist), and a small JSON stat service feeds the FUSE client.

pub mod assets;
pub mod config;
pub mod dirlist;
pub mod serve;
pub mod server;
pub mod statsvc;

pub use config::ProxyConfig;
pub use server::ProxyServer;
