//! Core library for HGMS, a steganographic file store.
//!
//! User files are split into AES-CBC-encrypted blobs, each hidden inside an
//! ordinary PNG image and replicated across one or more public hosting
//! providers. A JSON sidecar (the *alias*) records the replica URLs, the
//! encryption key and the content geometry. This crate holds everything the
//! two front-ends (HTTP proxy, FUSE mount) share:
//!
//! - [`stego`]: streaming PNG decoder that recovers the embedded ciphertext
//!   and sidechannel metadata, plus the matching encoder.
//! - [`crypto`]: AES-CBC stream codec with length bounds and skip-prefix
//!   support for range requests.
//! - [`alias`]: the sidecar data model and its validation rules.
//! - [`ssc`]: the persistent single-file block cache used by the FUSE
//!   read path.
//! - [`stat`]: shared stat/readdir RPC types exchanged between the proxy
//!   and the filesystem.
//!
//! The store is an obfuscation layer, not a security boundary: blobs are
//! confidential only to the extent AES-CBC plus an unremarkable-looking PNG
//! makes them, and no integrity protection is attempted.

pub mod alias;
pub mod crypto;
pub mod ssc;
pub mod stat;
pub mod stego;

pub use alias::Alias;
pub use crypto::AesCbc;
pub use ssc::Cache;
pub use stat::{StatAttr, StatDirent};
pub use stego::BlobReader;
