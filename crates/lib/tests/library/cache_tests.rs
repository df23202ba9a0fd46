//! Layer cache behavior across builds.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use flynn_builder_lib::cache::{TufClient, TufError};
use flynn_builder_lib::execute::Builder;
use flynn_builder_lib::image::ImageLayer;
use flynn_builder_lib::util::hash::hash_bytes;
use serde_json::json;

use super::common::{TestEnv, manifest};

#[tokio::test]
async fn warm_cache_submits_nothing() {
  let mut env = TestEnv::new();
  let spec = json!({
    "images": [
      { "id": "a", "layers": [{ "run": ["a"] }] },
      { "id": "b", "base": "a", "layers": [{ "run": ["b"] }] }
    ]
  });

  env.builder(manifest(spec.clone())).run().await.unwrap();
  let first = env.read_build_file("images.json");
  assert_eq!(env.scheduler.submissions().len(), 2);

  env.reset_mocks();
  env.builder(manifest(spec)).run().await.unwrap();

  assert!(env.scheduler.submissions().is_empty());
  assert_eq!(env.share.shared(), 0);
  assert_eq!(env.read_build_file("images.json"), first);
}

#[tokio::test]
async fn missing_record_is_regenerated_from_blob() {
  let mut env = TestEnv::new();
  let spec = json!({ "images": [{ "id": "a", "layers": [{ "run": ["a"] }] }] });

  let builder = env.builder(manifest(spec.clone()));
  builder.run().await.unwrap();
  let artifact = builder.artifact("a").await.unwrap();
  let id = artifact.manifest().unwrap().layers().next().unwrap().id.clone();

  let record_path = env.cache_dir().join(format!("{id}.json"));
  let record = std::fs::read(&record_path).unwrap();
  std::fs::remove_file(&record_path).unwrap();

  env.reset_mocks();
  let builder = env.builder(manifest(spec));
  builder.run().await.unwrap();

  assert!(env.scheduler.submissions().is_empty());
  let regenerated: ImageLayer = serde_json::from_slice(&std::fs::read(&record_path).unwrap()).unwrap();
  let original: ImageLayer = serde_json::from_slice(&record).unwrap();
  assert_eq!(regenerated, original);
  assert_eq!(
    builder.artifact("a").await.unwrap().raw_manifest.get(),
    artifact.raw_manifest.get()
  );
}

#[tokio::test]
async fn record_without_blob_rebuilds() {
  let mut env = TestEnv::new();
  let spec = json!({ "images": [{ "id": "a", "layers": [{ "run": ["a"] }] }] });

  let builder = env.builder(manifest(spec.clone()));
  builder.run().await.unwrap();
  let id = builder.artifact("a").await.unwrap().manifest().unwrap().layers().next().unwrap().id.clone();
  std::fs::remove_file(env.cache_dir().join(format!("{id}.squashfs"))).unwrap();

  env.reset_mocks();
  env.builder(manifest(spec)).run().await.unwrap();
  assert_eq!(env.scheduler.submitted_layers(), vec!["a"]);
  assert!(env.cache_dir().join(format!("{id}.squashfs")).is_file());
}

/// Serves layers from memory, keyed by target path.
#[derive(Default)]
struct MemoryRepository {
  targets: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryRepository {
  fn publish(&self, id: &str, blob: &[u8]) {
    let record = ImageLayer::squashfs(id, blob.len() as u64, &hash_bytes(blob));
    let mut targets = self.targets.lock().unwrap();
    targets.insert(format!("/layers/{id}.json"), serde_json::to_vec(&record).unwrap());
    targets.insert(format!("/layers/{id}.squashfs"), blob.to_vec());
  }
}

#[async_trait::async_trait]
impl TufClient for MemoryRepository {
  async fn download(&self, target: &str) -> Result<Vec<u8>, TufError> {
    self
      .targets
      .lock()
      .unwrap()
      .get(target)
      .cloned()
      .ok_or_else(|| TufError::UnknownTarget(target.to_string()))
  }
}

fn load_blob(cache: &Path, id: &str) -> Vec<u8> {
  std::fs::read(cache.join(format!("{id}.squashfs"))).unwrap()
}

#[tokio::test]
async fn remote_layers_are_fetched_instead_of_built() {
  let mut env = TestEnv::new();
  let spec = json!({ "images": [{ "id": "a", "layers": [{ "run": ["a"] }] }] });

  // Learn the layer ID with a local build, then start from an empty cache.
  let builder = env.builder(manifest(spec.clone()));
  builder.run().await.unwrap();
  let id = builder.artifact("a").await.unwrap().manifest().unwrap().layers().next().unwrap().id.clone();
  std::fs::remove_dir_all(env.cache_dir()).unwrap();
  env.reset_mocks();

  let remote = Arc::new(MemoryRepository::default());
  remote.publish(&id, b"published layer");
  let builder = Builder::new(env.config(), manifest(spec), env.scheduler.clone(), env.share.clone(), Some(remote)).unwrap();
  builder.run().await.unwrap();

  assert!(env.scheduler.submissions().is_empty());
  assert_eq!(load_blob(&env.cache_dir(), &id), b"published layer");
  let layer = builder.artifact("a").await.unwrap().manifest().unwrap().layers().next().unwrap().clone();
  assert_eq!(layer.length, 15);
}

#[tokio::test]
async fn remote_miss_falls_back_to_building() {
  let env = TestEnv::new();
  let remote = Arc::new(MemoryRepository::default());
  let spec = json!({ "images": [{ "id": "a", "layers": [{ "run": ["a"] }] }] });

  let builder = Builder::new(env.config(), manifest(spec), env.scheduler.clone(), env.share.clone(), Some(remote)).unwrap();
  builder.run().await.unwrap();
  assert_eq!(env.scheduler.submitted_layers(), vec!["a"]);
}
