//! Alias sidecars: the per-file JSON records that tie everything together.
//!
//! An alias names every replica of every blob of one stored file, plus the
//! AES key and the content geometry. Aliases live on the proxy host's
//! local filesystem under a fixed root and are immutable once written by
//! the ingest pipeline.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AliasError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted alias JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("alias has no blob locations")]
    EmptyLocation,

    #[error("replica {0} lists {1} blobs, expected {2}")]
    RaggedLocation(usize, usize, usize),

    #[error("invalid BlobSize {0}")]
    BadBlobSize(i64),

    #[error("ContentSize {content_size} does not fit {num_blobs} blobs of {blob_size} bytes")]
    SizeMismatch {
        content_size: u64,
        num_blobs: usize,
        blob_size: i64,
    },

    #[error("Key is not a valid hex-encoded AES key")]
    BadKey,
}

/// One stored file, as described by its JSON sidecar.
///
/// `location[c][i]` is the URL of blob `i` on replica `c`; all rows have
/// the same length. Unknown JSON fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Alias {
    /// Replica-major matrix of blob URLs.
    pub location: Vec<Vec<String>>,
    /// Hex-encoded AES key (16/24/32 bytes once decoded).
    pub key: String,
    /// File creation time, POSIX seconds. Drives `Last-Modified`.
    #[serde(default)]
    pub created: i64,
    /// Plaintext bytes the user sees.
    #[serde(default)]
    pub content_size: u64,
    /// Plaintext bytes in one full blob; the last blob may be short.
    #[serde(default)]
    pub blob_size: i64,
}

impl Alias {
    /// Parses and validates an alias from its JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self, AliasError> {
        let alias: Self = serde_json::from_slice(bytes)?;
        alias.validate()?;
        Ok(alias)
    }

    /// Reads and validates an alias file from disk.
    pub fn load(path: &Path) -> Result<Self, AliasError> {
        Self::from_json(&std::fs::read(path)?)
    }

    /// Number of replicas (rows of the location matrix).
    pub fn num_copies(&self) -> usize {
        self.location.len()
    }

    /// Number of blobs the file is split into.
    pub fn num_blobs(&self) -> usize {
        self.location.first().map_or(0, Vec::len)
    }

    /// Decodes the hex key, checking it is a legal AES key length.
    pub fn key_bytes(&self) -> Result<Vec<u8>, AliasError> {
        let key = hex::decode(&self.key).map_err(|_| AliasError::BadKey)?;
        match key.len() {
            16 | 24 | 32 => Ok(key),
            _ => Err(AliasError::BadKey),
        }
    }

    /// Maps a plaintext byte offset to `(blob index, bytes to skip inside
    /// that blob)`.
    pub fn seek(&self, offset: u64) -> (u64, u64) {
        let blob_size = self.blob_size as u64;
        (offset / blob_size, offset % blob_size)
    }

    /// Checks the structural invariants. A `BlobSize` of zero (or less) is
    /// rejected here so nothing downstream ever divides by it.
    pub fn validate(&self) -> Result<(), AliasError> {
        if self.location.is_empty() || self.num_blobs() == 0 {
            return Err(AliasError::EmptyLocation);
        }
        let num_blobs = self.num_blobs();
        for (c, row) in self.location.iter().enumerate() {
            if row.len() != num_blobs {
                return Err(AliasError::RaggedLocation(c, row.len(), num_blobs));
            }
        }
        if self.blob_size <= 0 {
            return Err(AliasError::BadBlobSize(self.blob_size));
        }
        self.key_bytes()?;

        let blob_size = self.blob_size as u64;
        let capacity = num_blobs as u64 * blob_size;
        let floor = (num_blobs as u64 - 1) * blob_size;
        if self.content_size > capacity || self.content_size <= floor {
            return Err(AliasError::SizeMismatch {
                content_size: self.content_size,
                num_blobs,
                blob_size: self.blob_size,
            });
        }
        Ok(())
    }

    /// Plaintext size of blob `idx`: `blob_size` for all but the last,
    /// whatever remains for the last.
    pub fn blob_len(&self, idx: u64) -> u64 {
        let blob_size = self.blob_size as u64;
        let full = self.num_blobs() as u64 - 1;
        if idx < full {
            blob_size
        } else {
            self.content_size - full * blob_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Alias {
        Alias {
            location: vec![
                vec!["http://a/0.png".into(), "http://a/1.png".into()],
                vec!["http://b/0.png".into(), "http://b/1.png".into()],
            ],
            key: "00112233445566778899aabbccddeeff".into(),
            created: 1420070400,
            content_size: 20,
            blob_size: 16,
        }
    }

    #[test]
    fn parses_canonical_json() {
        let json = r#"{
            "Location": [["https://x/b0.png","https://x/b1.png"]],
            "Key": "00112233445566778899aabbccddeeff",
            "Created": 1420070400,
            "ContentSize": 20,
            "BlobSize": 16,
            "SomeFutureField": true
        }"#;
        let alias = Alias::from_json(json.as_bytes()).unwrap();
        assert_eq!(alias.num_copies(), 1);
        assert_eq!(alias.num_blobs(), 2);
        assert_eq!(alias.created, 1420070400);
        assert_eq!(alias.key_bytes().unwrap().len(), 16);
    }

    #[test]
    fn seek_maps_offsets_to_blobs() {
        let alias = sample();
        assert_eq!(alias.seek(0), (0, 0));
        assert_eq!(alias.seek(15), (0, 15));
        assert_eq!(alias.seek(16), (1, 0));
        assert_eq!(alias.seek(18), (1, 2));
    }

    #[test]
    fn blob_len_handles_short_tail() {
        let alias = sample();
        assert_eq!(alias.blob_len(0), 16);
        assert_eq!(alias.blob_len(1), 4);
    }

    #[test]
    fn zero_blob_size_rejected() {
        let mut alias = sample();
        alias.blob_size = 0;
        assert!(matches!(
            alias.validate().unwrap_err(),
            AliasError::BadBlobSize(0)
        ));
    }

    #[test]
    fn ragged_location_rejected() {
        let mut alias = sample();
        alias.location[1].pop();
        assert!(matches!(
            alias.validate().unwrap_err(),
            AliasError::RaggedLocation(1, 1, 2)
        ));
    }

    #[test]
    fn content_size_must_fit_blob_count() {
        let mut alias = sample();
        alias.content_size = 33; // 2 blobs of 16 cannot hold 33
        assert!(alias.validate().is_err());
        alias.content_size = 16; // would fit in one blob, but two exist
        assert!(alias.validate().is_err());
        alias.content_size = 17;
        assert!(alias.validate().is_ok());
    }

    #[test]
    fn bad_key_rejected() {
        let mut alias = sample();
        alias.key = "zz".into();
        assert!(matches!(alias.validate().unwrap_err(), AliasError::BadKey));
        alias.key = "0011".into(); // valid hex, wrong length
        assert!(matches!(alias.validate().unwrap_err(), AliasError::BadKey));
    }
}
