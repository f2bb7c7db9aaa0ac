//! Content digests for submitted component source
//!
//! The digest is a SHA-256 over the exact submitted bytes. No normalization
//! is applied, so whitespace-only differences produce distinct cache entries.

use crate::error::{PreviewError, PreviewResult};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a hex-encoded SHA-256 digest
const DIGEST_HEX_LEN: usize = 64;

/// Hex-encoded SHA-256 of a source submission; the cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Hash raw source bytes
    pub fn of(source: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(source);
        Self(hex::encode(hasher.finalize()))
    }

    /// Parse a digest from a cache directory name
    pub fn parse(s: &str) -> PreviewResult<Self> {
        let valid = s.len() == DIGEST_HEX_LEN
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(PreviewError::InvalidDigest(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines and directory prefixes
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A component submission together with its digest
#[derive(Debug, Clone)]
pub struct SourceSubmission {
    pub source: String,
    pub digest: ContentDigest,
}

impl SourceSubmission {
    pub fn new(source: String) -> Self {
        let digest = ContentDigest::of(source.as_bytes());
        Self { source, digest }
    }
}
