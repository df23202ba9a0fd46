//! Two-tier layer cache.
//!
//! Built layers are looked up by layer ID, first in the local cache
//! directory and then, when configured, in the remote TUF repository. A
//! remote hit is downloaded into the local cache before it is returned, so
//! the local tier is always the source of blobs handed to the scheduler.

mod local;
pub mod tuf;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info};

use crate::image::ImageLayer;
use crate::util::size::human_size;

pub use local::LocalCache;
pub use tuf::{HttpTufClient, TufClient, TufError};

#[derive(Debug, Error)]
pub enum CacheError {
  #[error("layer cache I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("corrupt layer record {path}: {source}")]
  Corrupt {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("remote layer cache: {0}")]
  Remote(#[from] TufError),

  #[error("cache task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

pub struct LayerCache {
  local: LocalCache,
  remote: Option<Arc<dyn TufClient>>,
}

impl LayerCache {
  pub fn new(dir: &Path, remote: Option<Arc<dyn TufClient>>) -> Self {
    Self {
      local: LocalCache::new(dir),
      remote,
    }
  }

  pub fn local(&self) -> &LocalCache {
    &self.local
  }

  /// `file://` URL template for blobs in the local cache, with an `{id}` slot.
  pub fn layer_url_template(&self) -> String {
    format!("file://{}/{{id}}.squashfs", self.local.dir().display())
  }

  /// Look up layer `id`, local tier first.
  pub async fn get(&self, name: &str, id: &str) -> Result<Option<ImageLayer>, CacheError> {
    let local = self.local.clone();
    let key = id.to_string();
    if let Some(layer) = tokio::task::spawn_blocking(move || local.get(&key)).await?? {
      debug!(layer = name, id, "layer found in local cache");
      return Ok(Some(layer));
    }

    let Some(remote) = &self.remote else {
      return Ok(None);
    };
    self.fetch_remote(remote.as_ref(), name, id).await
  }

  async fn fetch_remote(&self, remote: &dyn TufClient, name: &str, id: &str) -> Result<Option<ImageLayer>, CacheError> {
    let record_bytes = match remote.download(&format!("/layers/{id}.json")).await {
      Ok(data) => data,
      Err(TufError::UnknownTarget(_)) => return Ok(None),
      Err(e) => return Err(e.into()),
    };
    let layer: ImageLayer = serde_json::from_slice(&record_bytes).map_err(|source| CacheError::Corrupt {
      path: PathBuf::from(format!("/layers/{id}.json")),
      source,
    })?;

    info!(layer = name, id, size = %human_size(layer.length), "fetching layer");
    let start = Instant::now();
    let incoming = self.local.incoming()?;
    remote.download_to(&format!("/layers/{id}.squashfs"), &incoming).await?;

    let local = self.local.clone();
    let key = id.to_string();
    tokio::task::spawn_blocking(move || local.adopt(&key, incoming, &record_bytes)).await??;
    debug!(layer = name, id, duration = ?start.elapsed(), "fetched layer");
    Ok(Some(layer))
  }

  /// Store the blob at `src` as layer `id` in the local tier.
  pub async fn insert(&self, id: &str, src: &Path) -> Result<ImageLayer, CacheError> {
    let local = self.local.clone();
    let key = id.to_string();
    let src = src.to_path_buf();
    Ok(tokio::task::spawn_blocking(move || local.insert(&key, &src)).await??)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;
  use std::sync::Mutex;
  use tempfile::TempDir;
  use tracing_test::traced_test;

  use crate::util::hash::hash_bytes;

  #[derive(Default)]
  struct FakeRemote {
    targets: HashMap<String, Vec<u8>>,
    requests: Mutex<Vec<String>>,
  }

  impl FakeRemote {
    fn with_layer(id: &str, blob: &[u8]) -> Self {
      let record = ImageLayer::squashfs(id, blob.len() as u64, &hash_bytes(blob));
      let mut targets = HashMap::new();
      targets.insert(format!("/layers/{id}.json"), serde_json::to_vec(&record).unwrap());
      targets.insert(format!("/layers/{id}.squashfs"), blob.to_vec());
      Self {
        targets,
        requests: Mutex::new(Vec::new()),
      }
    }
  }

  #[async_trait::async_trait]
  impl TufClient for FakeRemote {
    async fn download(&self, target: &str) -> Result<Vec<u8>, TufError> {
      self.requests.lock().unwrap().push(target.to_string());
      self
        .targets
        .get(target)
        .cloned()
        .ok_or_else(|| TufError::UnknownTarget(target.to_string()))
    }
  }

  #[tokio::test]
  async fn miss_without_remote() {
    let temp = TempDir::new().unwrap();
    let cache = LayerCache::new(temp.path(), None);
    assert_eq!(cache.get("app", "abc").await.unwrap(), None);
  }

  #[tokio::test]
  async fn remote_unknown_target_is_miss() {
    let temp = TempDir::new().unwrap();
    let remote = Arc::new(FakeRemote::default());
    let cache = LayerCache::new(temp.path(), Some(remote));
    assert_eq!(cache.get("app", "abc").await.unwrap(), None);
  }

  #[tokio::test]
  #[traced_test]
  async fn remote_hit_populates_local_cache() {
    let temp = TempDir::new().unwrap();
    let remote = Arc::new(FakeRemote::with_layer("abc", b"remote blob"));
    let cache = LayerCache::new(temp.path(), Some(remote.clone()));

    let layer = cache.get("app", "abc").await.unwrap().unwrap();
    assert_eq!(layer.length, 11);
    assert_eq!(std::fs::read(cache.local().blob_path("abc")).unwrap(), b"remote blob");
    assert!(cache.local().record_path("abc").exists());
    assert!(logs_contain("fetching layer"));

    // Second lookup is served locally.
    remote.requests.lock().unwrap().clear();
    assert_eq!(cache.get("app", "abc").await.unwrap(), Some(layer));
    assert!(remote.requests.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn insert_then_get_locally() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("layer.squashfs");
    std::fs::write(&src, b"built").unwrap();
    let cache = LayerCache::new(&temp.path().join("cache"), None);

    let inserted = cache.insert("abc", &src).await.unwrap();
    assert_eq!(cache.get("app", "abc").await.unwrap(), Some(inserted));
  }

  #[test]
  fn layer_url_template_points_at_cache_dir() {
    let cache = LayerCache::new(Path::new("/var/lib/flynn/layer-cache"), None);
    assert_eq!(cache.layer_url_template(), "file:///var/lib/flynn/layer-cache/{id}.squashfs");
  }
}
