//! Remote layer repository client.
//!
//! Layers published by previous builds live in a TUF repository as
//! `/layers/<id>.json` and `/layers/<id>.squashfs` targets. Target metadata
//! (`targets.json`) supplies each target's length and SHA-512, which every
//! download is checked against.
//!
//! Signature verification of the metadata chain is the repository client's
//! concern and is not performed here; only target integrity is checked.

use std::collections::BTreeMap;
use std::path::Path;

use futures::StreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha512};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TufError {
  #[error("unknown target: {0}")]
  UnknownTarget(String),

  #[error("request to {url} failed: {source}")]
  Http {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("unexpected status {status} from {url}")]
  Status { url: String, status: u16 },

  #[error("invalid targets metadata: {0}")]
  Metadata(String),

  #[error("target {target} has length {actual}, expected {expected}")]
  LengthMismatch { target: String, expected: u64, actual: u64 },

  #[error("target {target} failed hash verification")]
  HashMismatch { target: String },

  #[error("failed to write {target}: {source}")]
  Io {
    target: String,
    #[source]
    source: std::io::Error,
  },
}

#[async_trait::async_trait]
pub trait TufClient: Send + Sync {
  /// Download `target` into memory.
  async fn download(&self, target: &str) -> Result<Vec<u8>, TufError>;

  /// Download `target` to `dst`, returning the number of bytes written.
  async fn download_to(&self, target: &str, dst: &Path) -> Result<u64, TufError> {
    let data = self.download(target).await?;
    tokio::fs::write(dst, &data).await.map_err(|source| TufError::Io {
      target: target.to_string(),
      source,
    })?;
    Ok(data.len() as u64)
  }
}

#[derive(Debug, Clone, Deserialize)]
struct TargetMeta {
  length: u64,
  #[serde(default)]
  hashes: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct TargetsSigned {
  targets: BTreeMap<String, TargetMeta>,
}

#[derive(Debug, Deserialize)]
struct TargetsFile {
  signed: TargetsSigned,
}

/// TUF repository client over HTTP.
pub struct HttpTufClient {
  repository: String,
  client: reqwest::Client,
  targets: OnceCell<BTreeMap<String, TargetMeta>>,
}

impl HttpTufClient {
  pub fn new(repository: &str) -> Self {
    Self {
      repository: repository.trim_end_matches('/').to_string(),
      client: reqwest::Client::new(),
      targets: OnceCell::new(),
    }
  }

  async fn get(&self, url: &str) -> Result<reqwest::Response, TufError> {
    let response = self.client.get(url).send().await.map_err(|source| TufError::Http {
      url: url.to_string(),
      source,
    })?;
    let status = response.status();
    if !status.is_success() {
      return Err(TufError::Status {
        url: url.to_string(),
        status: status.as_u16(),
      });
    }
    Ok(response)
  }

  async fn targets(&self) -> Result<&BTreeMap<String, TargetMeta>, TufError> {
    self
      .targets
      .get_or_try_init(|| async {
        let url = format!("{}/targets.json", self.repository);
        let response = self.get(&url).await?;
        let bytes = response.bytes().await.map_err(|source| TufError::Http { url, source })?;
        let file: TargetsFile = serde_json::from_slice(&bytes).map_err(|e| TufError::Metadata(e.to_string()))?;
        debug!(targets = file.signed.targets.len(), "loaded tuf targets");
        Ok(file.signed.targets)
      })
      .await
  }

  async fn target_meta(&self, target: &str) -> Result<TargetMeta, TufError> {
    self
      .targets()
      .await?
      .get(target)
      .cloned()
      .ok_or_else(|| TufError::UnknownTarget(target.to_string()))
  }

  fn target_url(&self, target: &str) -> String {
    format!("{}/targets/{}", self.repository, target.trim_start_matches('/'))
  }
}

fn verify(target: &str, meta: &TargetMeta, length: u64, sha512: &str) -> Result<(), TufError> {
  if length != meta.length {
    return Err(TufError::LengthMismatch {
      target: target.to_string(),
      expected: meta.length,
      actual: length,
    });
  }
  match meta.hashes.get("sha512") {
    Some(expected) if expected != sha512 => Err(TufError::HashMismatch {
      target: target.to_string(),
    }),
    _ => Ok(()),
  }
}

#[async_trait::async_trait]
impl TufClient for HttpTufClient {
  async fn download(&self, target: &str) -> Result<Vec<u8>, TufError> {
    let meta = self.target_meta(target).await?;
    let url = self.target_url(target);
    let data = self
      .get(&url)
      .await?
      .bytes()
      .await
      .map_err(|source| TufError::Http { url, source })?;

    verify(target, &meta, data.len() as u64, &hex::encode(Sha512::digest(&data)))?;
    Ok(data.to_vec())
  }

  async fn download_to(&self, target: &str, dst: &Path) -> Result<u64, TufError> {
    let meta = self.target_meta(target).await?;
    let url = self.target_url(target);
    let response = self.get(&url).await?;

    let io_err = |source| TufError::Io {
      target: target.to_string(),
      source,
    };
    let mut file = tokio::fs::File::create(dst).await.map_err(io_err)?;
    let mut hasher = Sha512::new();
    let mut length = 0u64;
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
      let chunk = chunk.map_err(|source| TufError::Http { url: url.clone(), source })?;
      hasher.update(&chunk);
      length += chunk.len() as u64;
      file.write_all(&chunk).await.map_err(io_err)?;
    }
    file.flush().await.map_err(io_err)?;

    verify(target, &meta, length, &hex::encode(hasher.finalize()))?;
    Ok(length)
  }
}
