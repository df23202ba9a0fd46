//! Hashing utilities for content addressing and verification.
//!
//! Every identifier the builder produces is a lowercase hex SHA-512/256 digest:
//! - layer IDs (see `build::id`)
//! - image manifest IDs
//! - squashfs blob digests recorded in layer records
//!
//! This module provides:
//! - `hash_bytes()`: arbitrary byte hashing
//! - `hash_file()`: single file hashing, returning size and digest
//! - `HashingWriter`: a writer that hashes everything passing through it

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512_256};

/// Key under which SHA-512/256 digests appear in `hashes` maps.
pub const SHA512_256: &str = "sha512_256";

/// A full 64-character SHA-512/256 digest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl ContentHash {
  /// The `{"sha512_256": <hex>}` map used by layer records and artifacts.
  pub fn to_hashes(&self) -> BTreeMap<String, String> {
    BTreeMap::from([(SHA512_256.to_string(), self.0.clone())])
  }
}

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  ContentHash(hex::encode(Sha512_256::digest(data)))
}

/// Hash a file's contents, returning its size in bytes and its digest.
pub fn hash_file(path: &Path) -> io::Result<(u64, ContentHash)> {
  let mut file = fs::File::open(path)?;
  let mut writer = HashingWriter::new(io::sink());
  io::copy(&mut file, &mut writer)?;
  Ok(writer.finish().1)
}

/// Forwards writes to an inner writer while hashing and counting them.
pub struct HashingWriter<W> {
  inner: W,
  hasher: Sha512_256,
  written: u64,
}

impl<W: Write> HashingWriter<W> {
  pub fn new(inner: W) -> Self {
    Self {
      inner,
      hasher: Sha512_256::new(),
      written: 0,
    }
  }

  /// Consume the writer, returning the inner writer, the byte count and the digest.
  pub fn finish(self) -> (W, (u64, ContentHash)) {
    let digest = ContentHash(hex::encode(self.hasher.finalize()));
    (self.inner, (self.written, digest))
  }
}

impl<W: Write> Write for HashingWriter<W> {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    let n = self.inner.write(buf)?;
    self.hasher.update(&buf[..n]);
    self.written += n as u64;
    Ok(n)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.inner.flush()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::tempdir;

  #[test]
  fn hash_bytes_is_sha512_256() {
    // Known SHA-512/256 digest of the empty string.
    assert_eq!(
      hash_bytes(b"").0,
      "c672b8d1ef56ed28ab87c3622c5114069bdd3ad7b8f9737498d0c01ecef0967a"
    );
  }

  #[test]
  fn hash_file_matches_hash_bytes() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("layer.squashfs");
    fs::write(&path, b"squashfs contents").unwrap();

    let (size, hash) = hash_file(&path).unwrap();
    assert_eq!(size, 17);
    assert_eq!(hash, hash_bytes(b"squashfs contents"));
  }

  #[test]
  fn hashing_writer_forwards_and_counts() {
    let mut writer = HashingWriter::new(Vec::new());
    writer.write_all(b"hello ").unwrap();
    writer.write_all(b"world").unwrap();

    let (inner, (size, hash)) = writer.finish();
    assert_eq!(inner, b"hello world");
    assert_eq!(size, 11);
    assert_eq!(hash, hash_bytes(b"hello world"));
  }

  #[test]
  fn to_hashes_uses_algorithm_key() {
    let hashes = hash_bytes(b"x").to_hashes();
    assert_eq!(hashes.len(), 1);
    assert_eq!(hashes[SHA512_256], hash_bytes(b"x").0);
  }

  #[test]
  fn hash_file_missing_is_error() {
    let temp = tempdir().unwrap();
    assert!(hash_file(&temp.path().join("missing")).is_err());
  }
}
