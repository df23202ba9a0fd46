//! End-to-end builds against an in-process scheduler.

use std::collections::BTreeMap;

use flynn_builder_lib::image::Artifact;
use flynn_builder_lib::util::hash::hash_bytes;
use serde_json::json;

use super::common::{TestEnv, base_layer, manifest};

fn layer_ids(artifact: &Artifact) -> Vec<String> {
  artifact.manifest().unwrap().layers().map(|l| l.id.clone()).collect()
}

#[tokio::test]
async fn single_image_builds_on_base_layer() {
  let env = TestEnv::new();
  let builder = env.builder(manifest(json!({
    "images": [{ "id": "bootstrap", "layers": [{ "run": ["echo hi > /out/layer.squashfs"] }] }]
  })));

  let report = builder.run().await.unwrap();
  assert_eq!(report.built, vec!["bootstrap"]);

  let submissions = env.scheduler.submissions();
  assert_eq!(submissions.len(), 1);
  assert_eq!(submissions[0].job.mountspecs, vec![base_layer()]);
  assert_eq!(submissions[0].stdin, "echo hi > /out/layer.squashfs");

  let expected_id = hash_bytes(br#"{"name":"bootstrap","run":["echo hi > /out/layer.squashfs"]}"#).0;
  let artifact = builder.artifact("bootstrap").await.unwrap();
  assert_eq!(layer_ids(&artifact), vec![expected_id.clone()]);
  assert!(env.cache_dir().join(format!("{expected_id}.squashfs")).is_file());
  assert!(env.cache_dir().join(format!("{expected_id}.json")).is_file());

  let on_disk: Artifact = serde_json::from_slice(&env.read_build_file("image/bootstrap.json")).unwrap();
  assert_eq!(on_disk.raw_manifest.get(), artifact.raw_manifest.get());

  let images: BTreeMap<String, Artifact> = serde_json::from_slice(&env.read_build_file("images.json")).unwrap();
  assert_eq!(images.keys().collect::<Vec<_>>(), vec!["bootstrap"]);
  assert!(env.staging_is_clean());
}

#[tokio::test]
async fn artifact_hash_covers_exact_manifest_bytes() {
  let env = TestEnv::new();
  let builder = env.builder(manifest(json!({
    "images": [{ "id": "a", "layers": [{ "run": ["true"] }] }]
  })));
  builder.run().await.unwrap();

  let artifact = builder.artifact("a").await.unwrap();
  let raw = artifact.raw_manifest.get().as_bytes();
  assert_eq!(artifact.hashes["sha512_256"], hash_bytes(raw).0);
  assert_eq!(artifact.size, raw.len() as u64);
  assert!(artifact.uri.ends_with(&format!("/images/{}.json", hash_bytes(raw).0)));
}

#[tokio::test]
async fn go_build_runs_inside_go_image_and_extends_base() {
  let env = TestEnv::new();
  env.write_file("service/main.go", "package main\n\nfunc main() {}\n");
  let builder = env.builder(manifest(json!({
    "images": [
      { "id": "go", "layers": [{ "run": ["install go"] }] },
      { "id": "service", "base": "go", "layers": [{ "go_build": { "service": "/bin/service" } }] }
    ]
  })));

  builder.run().await.unwrap();
  assert_eq!(env.scheduler.submitted_layers(), vec!["go", "service"]);

  let go = builder.artifact("go").await.unwrap();
  let service = builder.artifact("service").await.unwrap();
  let go_layers = layer_ids(&go);
  let service_layers = layer_ids(&service);

  // The service job runs on the go image's root filesystem.
  let submission = &env.scheduler.submissions()[1];
  let rootfs: Vec<String> = submission.job.mountspecs.iter().map(|m| m.id.clone()).collect();
  assert_eq!(rootfs, go_layers);
  assert_eq!(submission.stdin, "go build -o /bin/service github.com/flynn/flynn/service");

  // Base layers come first, then the image's own.
  assert_eq!(service_layers.len(), 2);
  assert_eq!(service_layers[..1], go_layers[..]);
}

#[tokio::test]
async fn independent_images_build_concurrently() {
  let env = TestEnv::new();
  env.scheduler.gate(&["b", "c", "d"], 3);
  let builder = env.builder(manifest(json!({
    "images": [
      { "id": "a", "layers": [{ "run": ["a"] }] },
      { "id": "b", "base": "a", "layers": [{ "run": ["b"] }] },
      { "id": "c", "base": "a", "layers": [{ "run": ["c"] }] },
      { "id": "d", "base": "a", "layers": [{ "run": ["d"] }] }
    ]
  })));

  let report = builder.run().await.unwrap();
  assert_eq!(report.built.len(), 4);
  assert_eq!(report.built[0], "a");
  assert_eq!(env.scheduler.submitted_layers()[0], "a");
  assert_eq!(builder.progress(), 4);
}

#[tokio::test]
async fn parallelism_limit_still_builds_everything() {
  let env = TestEnv::new();
  let mut config = env.config();
  config.parallelism = Some(1);
  let builder = flynn_builder_lib::execute::Builder::new(
    config,
    manifest(json!({
      "images": [
        { "id": "a", "layers": [{ "run": ["a"] }] },
        { "id": "b", "layers": [{ "run": ["b"] }] }
      ]
    })),
    env.scheduler.clone(),
    env.share.clone(),
    None,
  )
  .unwrap();

  let report = builder.run().await.unwrap();
  let mut built = report.built.clone();
  built.sort();
  assert_eq!(built, vec!["a", "b"]);
}

#[tokio::test]
async fn copy_order_is_independent_of_declaration() {
  let build = |copy: serde_json::Value| async move {
    let env = TestEnv::new();
    env.write_file("a", "a");
    env.write_file("z", "z");
    let builder = env.builder(manifest(json!({
      "images": [{ "id": "files", "layers": [{ "copy": copy }] }]
    })));
    builder.run().await.unwrap();
    let stdin = env.scheduler.submissions()[0].stdin.clone();
    (layer_ids(&builder.artifact("files").await.unwrap()), stdin)
  };

  let (first_ids, stdin) = build(json!({ "z": "/z", "a": "/a" })).await;
  let (second_ids, _) = build(json!({ "a": "/a", "z": "/z" })).await;

  assert_eq!(stdin, "mkdir -p \"/\" && cp \"a\" \"/a\"\nmkdir -p \"/\" && cp \"z\" \"/z\"");
  assert_eq!(first_ids, second_ids);
}

#[tokio::test]
async fn input_content_changes_layer_id() {
  let env = TestEnv::new();
  env.write_file("script.sh", "echo one");
  let spec = json!({ "images": [{ "id": "app", "layers": [{ "script": "script.sh" }] }] });

  env.builder(manifest(spec.clone())).run().await.unwrap();
  let first = std::fs::read(env.build_dir().join("image/app.json")).unwrap();

  env.write_file("script.sh", "echo two");
  env.builder(manifest(spec)).run().await.unwrap();
  let second = std::fs::read(env.build_dir().join("image/app.json")).unwrap();

  assert_ne!(first, second);
  assert_eq!(env.scheduler.submissions().len(), 2);
}

#[tokio::test]
async fn repeated_builds_are_identical() {
  let mut env = TestEnv::new();
  let spec = json!({
    "images": [
      { "id": "a", "env": { "X": "1" }, "layers": [{ "run": ["a"] }] },
      { "id": "b", "base": "a", "layers": [{ "run": ["b"], "env": { "Y": "2" } }] }
    ]
  });

  env.builder(manifest(spec.clone())).run().await.unwrap();
  let first = env.read_build_file("images.json");

  std::fs::remove_dir_all(env.cache_dir()).unwrap();
  std::fs::remove_dir_all(env.build_dir()).unwrap();
  env.reset_mocks();

  env.builder(manifest(spec)).run().await.unwrap();
  assert_eq!(env.scheduler.submissions().len(), 2);
  assert_eq!(env.read_build_file("images.json"), first);
}

#[tokio::test]
async fn deployment_manifests_embed_artifacts() {
  let env = TestEnv::new();
  env.write_file(
    "bootstrap/manifest_template.json",
    r#"{"steps":[{"artifact":$image_artifact[app]}]}"#,
  );
  let builder = env.builder(manifest(json!({
    "images": [{ "id": "app", "layers": [{ "run": ["true"] }] }],
    "manifests": { "bootstrap/manifest_template.json": "bootstrap-manifest.json" }
  })));
  builder.run().await.unwrap();

  let written: serde_json::Value = serde_json::from_slice(&env.read_build_file("manifests/bootstrap-manifest.json")).unwrap();
  let embedded = &written["steps"][0]["artifact"];
  let artifact = builder.artifact("app").await.unwrap();
  assert_eq!(embedded["uri"], artifact.uri);
  assert_eq!(embedded["meta"]["flynn.component"], "app");
  assert!(embedded["meta"].get("manifest.id").is_none());
}
