//! Failed builds and invalid manifests.

use flynn_builder_lib::build::BuildError;
use flynn_builder_lib::execute::ExecuteError;
use flynn_builder_lib::manifest::{self, Manifest, ManifestError};
use serde_json::json;

use super::common::{TestEnv, manifest};

#[tokio::test]
async fn failure_aborts_dependents_and_skips_images_json() {
  let env = TestEnv::new();
  env.scheduler.fail_layer("b", 1);
  let builder = env.builder(manifest(json!({
    "images": [
      { "id": "a", "layers": [{ "run": ["a"] }] },
      { "id": "b", "base": "a", "layers": [{ "run": ["b"] }] },
      { "id": "c", "base": "b", "layers": [{ "run": ["c"] }] },
      { "id": "d", "base": "a", "layers": [{ "run": ["d"] }] }
    ]
  })));

  let err = builder.run().await.unwrap_err();
  match err {
    ExecuteError::BuildsFailed { failed, aborted } => {
      assert_eq!(failed, vec!["b"]);
      assert_eq!(aborted, vec!["c"]);
    }
    other => panic!("unexpected error: {other}"),
  }

  let mut submitted = env.scheduler.submitted_layers();
  submitted.sort();
  assert_eq!(submitted, vec!["a", "b", "d"]);
  assert!(!env.build_dir().join("images.json").exists());
  assert!(env.build_dir().join("image/d.json").is_file());
  assert!(!env.build_dir().join("image/b.json").exists());
  assert!(env.staging_is_clean());
}

#[tokio::test]
async fn failed_job_reports_exit_code_and_caches_nothing() {
  let env = TestEnv::new();
  env.scheduler.fail_layer("a", 2);
  let builder = env.builder(manifest(json!({
    "images": [{ "id": "a", "layers": [{ "run": ["false"] }] }]
  })));

  let err = builder.build_image(&builder.manifest().images[0].clone()).await.unwrap_err();
  assert!(matches!(
    err,
    ExecuteError::Build { source: BuildError::JobFailed { code: 2, .. }, .. }
  ));
  let cached = std::fs::read_dir(env.cache_dir()).unwrap().count();
  assert_eq!(cached, 0);
  assert!(env.build_dir().join("log/a.log").is_file());
}

#[tokio::test]
async fn empty_manifest_is_rejected() {
  let env = TestEnv::new();
  let builder = env.builder(manifest(json!({ "images": [] })));
  assert!(matches!(builder.run().await.unwrap_err(), ExecuteError::NoImages));
  assert!(env.scheduler.submissions().is_empty());
}

#[test]
fn unknown_template_is_rejected_before_building() {
  let parsed: Manifest = serde_json::from_value(json!({
    "images": [{ "id": "a", "template": "missing" }]
  }))
  .unwrap();
  let err = manifest::prepare(parsed).unwrap_err();
  assert!(matches!(err, ManifestError::UnknownTemplate { .. }));
}

#[test]
fn unknown_base_is_rejected_before_building() {
  let parsed: Manifest = serde_json::from_value(json!({
    "images": [{ "id": "a", "base": "ghost", "layers": [{ "run": ["a"] }] }]
  }))
  .unwrap();
  let err = manifest::prepare(parsed).unwrap_err();
  assert!(matches!(err, ManifestError::UnknownImage { .. }));
}

#[tokio::test]
async fn missing_input_file_fails_the_image() {
  let env = TestEnv::new();
  let builder = env.builder(manifest(json!({
    "images": [{ "id": "a", "layers": [{ "script": "missing.sh" }] }]
  })));

  let err = builder.run().await.unwrap_err();
  assert!(matches!(err, ExecuteError::BuildsFailed { .. }));
  assert!(env.scheduler.submissions().is_empty());
}
