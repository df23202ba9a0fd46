//! Exporting a build and consuming the export as a remote layer cache.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use flynn_builder_lib::cache::{HttpTufClient, TufClient};
use flynn_builder_lib::execute::Builder;
use flynn_builder_lib::export::{ExportConfig, ExportReport, Exporter, read_targets};
use flynn_builder_lib::image::Artifact;
use serde_json::json;
use tempfile::TempDir;

use super::common::{TestEnv, manifest};

fn export(env: &TestEnv, tuf_dir: &Path) -> ExportReport {
  let config = ExportConfig {
    build_dir: env.build_dir(),
    cache_dir: env.cache_dir(),
    repository: "https://dl.flynn.io/tuf".to_string(),
    version: "v20240101.0".to_string(),
  };
  Exporter::new(tuf_dir, config).unwrap().export().unwrap()
}

/// Serve a staged repository the way a TUF HTTP endpoint would.
async fn serve(staged: &Path) -> mockito::ServerGuard {
  let mut server = mockito::Server::new_async().await;
  let targets_path = staged.join("targets.json");
  server
    .mock("GET", "/targets.json")
    .with_body(fs::read(&targets_path).unwrap())
    .create_async()
    .await;
  for target in read_targets(&targets_path).unwrap().keys() {
    let body = fs::read(staged.join("targets").join(target.trim_start_matches('/'))).unwrap();
    server
      .mock("GET", format!("/targets{target}").as_str())
      .with_body(body)
      .create_async()
      .await;
  }
  server
}

fn manifest_ids(artifacts: &BTreeMap<String, Artifact>) -> Vec<(String, String)> {
  artifacts
    .iter()
    .map(|(name, artifact)| (name.clone(), artifact.manifest_id().unwrap().to_string()))
    .collect()
}

#[tokio::test]
async fn exported_repository_serves_a_fresh_build() {
  let env = TestEnv::new();
  let spec = json!({
    "images": [
      { "id": "a", "layers": [{ "run": ["a"] }] },
      { "id": "b", "base": "a", "layers": [{ "run": ["b"] }] }
    ]
  });
  let builder = env.builder(manifest(spec.clone()));
  builder.run().await.unwrap();
  let built = builder.artifacts().await;

  let tuf = TempDir::new().unwrap();
  let report = export(&env, tuf.path());
  assert_eq!(report.images, vec!["a", "b"]);
  assert_eq!(report.layers, 2);

  let server = serve(&tuf.path().join("staged")).await;
  let fresh = TestEnv::new();
  let remote: Arc<dyn TufClient> = Arc::new(HttpTufClient::new(&server.url()));
  let builder = Builder::new(
    fresh.config(),
    manifest(spec),
    fresh.scheduler.clone(),
    fresh.share.clone(),
    Some(remote),
  )
  .unwrap();
  builder.run().await.unwrap();

  assert!(fresh.scheduler.submissions().is_empty());
  assert_eq!(manifest_ids(&builder.artifacts().await), manifest_ids(&built));
}

#[tokio::test]
async fn shared_layers_are_exported_once() {
  let env = TestEnv::new();
  let spec = json!({
    "images": [
      { "id": "a", "layers": [{ "run": ["a"] }] },
      { "id": "b", "base": "a", "layers": [{ "run": ["b"] }] },
      { "id": "c", "base": "a", "layers": [{ "run": ["c"] }] }
    ]
  });
  env.builder(manifest(spec)).run().await.unwrap();

  let tuf = TempDir::new().unwrap();
  let report = export(&env, tuf.path());
  assert_eq!(report.layers, 3);

  let targets = read_targets(&tuf.path().join("staged/targets.json")).unwrap();
  let blobs = targets
    .keys()
    .filter(|t| t.starts_with("/layers/") && t.ends_with(".squashfs"))
    .count();
  assert_eq!(blobs, 3);
  assert_eq!(targets.keys().filter(|t| t.starts_with("/images/")).count(), 3);
}
