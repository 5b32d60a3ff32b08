//! Hashing utilities for content-addressed storage and verification.
//!
//! This module provides:
//! - `ObjectId`: the 64-character identifier every pipeline, step, input,
//!   device and mount is keyed by
//! - `Hashable`: canonical JSON hashing used to derive `ObjectId`s
//! - `Checksum`: an `algo:hex` content checksum naming a source item
//! - `hash_file()` / `hash_bytes()`: streaming digests for verification

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;

pub type HashError = serde_json::Error;

/// A content-addressed identifier.
///
/// The identifier is the full SHA-256 of the canonical JSON encoding of a
/// definition (see [`Hashable`]), rendered as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub String);

impl ObjectId {
  /// The reserved identifier of a pipeline with no steps.
  pub fn empty_tree() -> Self {
    ObjectId(hash_bytes(br#"{"type":"treebuild.empty-tree"}"#))
  }

  /// Parse a user supplied identifier, rejecting anything that is not 64 hex characters.
  pub fn parse(s: &str) -> Option<Self> {
    if s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
      Some(ObjectId(s.to_string()))
    } else {
      None
    }
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Short form for log output.
  pub fn short(&self) -> &str {
    &self.0[..self.0.len().min(12)]
  }
}

impl fmt::Display for ObjectId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Types whose identity is the hash of their serialized form.
///
/// The canonical encoding is compact `serde_json` of the value after a round
/// trip through [`serde_json::Value`]: object keys come out sorted because
/// `serde_json::Map` is ordered by key, and numbers keep serde_json's own
/// formatting. This encoding is part of the on-disk store format; changing it
/// invalidates every existing store entry.
pub trait Hashable: Serialize {
  fn compute_id(&self) -> Result<ObjectId, HashError> {
    let canonical = serde_json::to_value(self)?;
    let serialized = serde_json::to_string(&canonical)?;
    Ok(ObjectId(hash_bytes(serialized.as_bytes())))
  }
}

/// Digest algorithms accepted in checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HashAlgo {
  Sha256,
  Sha384,
  Sha512,
}

impl HashAlgo {
  pub fn as_str(&self) -> &'static str {
    match self {
      HashAlgo::Sha256 => "sha256",
      HashAlgo::Sha384 => "sha384",
      HashAlgo::Sha512 => "sha512",
    }
  }

  fn hex_len(&self) -> usize {
    match self {
      HashAlgo::Sha256 => 64,
      HashAlgo::Sha384 => 96,
      HashAlgo::Sha512 => 128,
    }
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChecksumError {
  #[error("checksum '{0}' is not of the form <algo>:<hex>")]
  Format(String),

  #[error("unsupported checksum algorithm '{0}'")]
  Algorithm(String),

  #[error("checksum '{0}' must have a lowercase hex digest of the algorithm's length")]
  Digest(String),
}

/// A content checksum such as `sha256:9f86d0...`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Checksum {
  pub algo: HashAlgo,
  pub hex: String,
}

impl FromStr for Checksum {
  type Err = ChecksumError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (algo, hex) = s.split_once(':').ok_or_else(|| ChecksumError::Format(s.to_string()))?;
    let algo = match algo {
      "sha256" => HashAlgo::Sha256,
      "sha384" => HashAlgo::Sha384,
      "sha512" => HashAlgo::Sha512,
      other => return Err(ChecksumError::Algorithm(other.to_string())),
    };
    // lowercase only: the checksum string is also the cache file name
    if hex.len() != algo.hex_len() || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
      return Err(ChecksumError::Digest(s.to_string()));
    }
    Ok(Checksum {
      algo,
      hex: hex.to_string(),
    })
  }
}

impl fmt::Display for Checksum {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.algo.as_str(), self.hex)
  }
}

impl Checksum {
  /// Check whether the file at `path` hashes to this checksum.
  pub fn matches_file(&self, path: &Path) -> std::io::Result<bool> {
    Ok(hash_file(path, self.algo)? == self.hex)
  }

  pub fn matches_bytes(&self, data: &[u8]) -> bool {
    let mut hasher = StreamHasher::new(self.algo);
    hasher.update(data);
    hasher.finalize_hex() == self.hex
  }
}

/// Incremental hasher over any supported algorithm.
pub enum StreamHasher {
  Sha256(Sha256),
  Sha384(Sha384),
  Sha512(Sha512),
}

impl StreamHasher {
  pub fn new(algo: HashAlgo) -> Self {
    match algo {
      HashAlgo::Sha256 => StreamHasher::Sha256(Sha256::new()),
      HashAlgo::Sha384 => StreamHasher::Sha384(Sha384::new()),
      HashAlgo::Sha512 => StreamHasher::Sha512(Sha512::new()),
    }
  }

  pub fn update(&mut self, data: &[u8]) {
    match self {
      StreamHasher::Sha256(h) => h.update(data),
      StreamHasher::Sha384(h) => h.update(data),
      StreamHasher::Sha512(h) => h.update(data),
    }
  }

  pub fn finalize_hex(self) -> String {
    match self {
      StreamHasher::Sha256(h) => hex::encode(h.finalize()),
      StreamHasher::Sha384(h) => hex::encode(h.finalize()),
      StreamHasher::Sha512(h) => hex::encode(h.finalize()),
    }
  }
}

/// Hash a file's contents with the given algorithm, returning lowercase hex.
pub fn hash_file(path: &Path, algo: HashAlgo) -> std::io::Result<String> {
  let mut file = fs::File::open(path)?;
  let mut hasher = StreamHasher::new(algo);
  let mut buffer = [0u8; 64 * 1024];

  loop {
    let bytes_read = file.read(&mut buffer)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(hasher.finalize_hex())
}

/// SHA-256 of arbitrary bytes as 64 hex characters.
pub fn hash_bytes(data: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data);
  hex::encode(hasher.finalize())
}
