//! Manifest types for the image builder.
//!
//! The manifest is the declarative input of a build: the images to produce,
//! the layers each one is made of, reusable layer templates and the
//! deployment manifests to interpolate once the images exist.
//!
//! # Example
//!
//! ```json
//! {
//!   "tuf": { "repository": "https://dl.flynn.io/tuf", "root_keys": [] },
//!   "base_layer": { "type": "squashfs", "id": "...", "url": "...", "size": 1024, "hashes": {} },
//!   "images": [
//!     { "id": "busybox", "layers": [{ "name": "busybox", "script": "builder/img/busybox.sh" }] },
//!     { "id": "app", "base": "busybox", "layers": [{ "name": "app", "go_build": { "app": "/bin/app" } }] }
//!   ],
//!   "manifests": { "bootstrap/manifest_template.json": "bootstrap-manifest.json" }
//! }
//! ```
//!
//! Maps are [`BTreeMap`]s so iteration order, and everything derived from it,
//! is deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::consts::{DEFAULT_GO_MODULE, GO_IMAGE};
use crate::image::ImageEntrypoint;
use crate::scheduler::Mountspec;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
  #[serde(default)]
  pub tuf: TufConfig,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub base_layer: Option<Mountspec>,
  #[serde(default)]
  pub images: Vec<Image>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub templates: BTreeMap<String, Image>,
  /// Source template path to output file name, both relative paths.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub manifests: BTreeMap<String, String>,
  /// Go import path prefix mapped onto the workspace root.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub go_module: Option<String>,
}

impl Manifest {
  pub fn go_module(&self) -> &str {
    self.go_module.as_deref().unwrap_or(DEFAULT_GO_MODULE)
  }

  pub fn image(&self, id: &str) -> Option<&Image> {
    self.images.iter().find(|image| image.id == id)
  }
}

/// Remote layer repository settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TufConfig {
  #[serde(default)]
  pub repository: String,
  /// Opaque root key objects, exposed to layer environments as JSON.
  #[serde(default)]
  pub root_keys: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
  #[serde(default)]
  pub id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub base: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub template: Option<String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub layers: Vec<Layer>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub entrypoint: Option<ImageEntrypoint>,
}

impl Image {
  /// IDs of the images this image depends on, deduplicated.
  pub fn dependencies(&self) -> Vec<&str> {
    let mut deps: Vec<&str> = Vec::new();
    let referenced = self
      .base
      .as_deref()
      .into_iter()
      .chain(self.layers.iter().filter_map(Layer::build_with_image));
    for dep in referenced {
      if !deps.contains(&dep) {
        deps.push(dep);
      }
    }
    deps
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
  /// Name used in logs and job metadata; defaults to the image ID.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub name: String,
  /// Image whose artifact provides this layer's build environment.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub build_with: Option<String>,
  /// Glob patterns relative to the workspace.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub inputs: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub run: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub script: Option<String>,
  /// Go package directory to output path.
  #[serde(default, alias = "gobuild", skip_serializing_if = "BTreeMap::is_empty")]
  pub go_build: BTreeMap<String, String>,
  /// Like `go_build`, compiled with cgo enabled.
  #[serde(default, alias = "cgobuild", skip_serializing_if = "BTreeMap::is_empty")]
  pub cgo_build: BTreeMap<String, String>,
  /// Source path to destination path.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub copy: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub limits: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub linux_capabilities: Vec<String>,
}

impl Layer {
  pub fn has_go_builds(&self) -> bool {
    !self.go_build.is_empty() || !self.cgo_build.is_empty()
  }

  /// The image this layer is built with.
  ///
  /// Layers that compile Go code without naming a build image use `go`.
  pub fn build_with_image(&self) -> Option<&str> {
    match &self.build_with {
      Some(image) => Some(image.as_str()),
      None if self.has_go_builds() => Some(GO_IMAGE),
      None => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn layer_accepts_legacy_go_build_keys() {
    let layer: Layer = serde_json::from_str(r#"{"name":"app","gobuild":{"app":"/bin/app"},"cgobuild":{"c":"/bin/c"}}"#).unwrap();
    assert_eq!(layer.go_build["app"], "/bin/app");
    assert_eq!(layer.cgo_build["c"], "/bin/c");
  }

  #[test]
  fn go_layers_build_with_go_by_default() {
    let layer = Layer {
      name: "app".to_string(),
      go_build: BTreeMap::from([("app".to_string(), "/bin/app".to_string())]),
      ..Default::default()
    };
    assert_eq!(layer.build_with_image(), Some("go"));

    let explicit = Layer {
      build_with: Some("go-1.9".to_string()),
      ..layer
    };
    assert_eq!(explicit.build_with_image(), Some("go-1.9"));
  }

  #[test]
  fn plain_layers_have_no_build_image() {
    let layer = Layer {
      name: "busybox".to_string(),
      run: vec!["true".to_string()],
      ..Default::default()
    };
    assert_eq!(layer.build_with_image(), None);
  }

  #[test]
  fn dependencies_include_base_and_build_images_once() {
    let image = Image {
      id: "app".to_string(),
      base: Some("go".to_string()),
      layers: vec![
        Layer {
          name: "a".to_string(),
          go_build: BTreeMap::from([("a".to_string(), "/bin/a".to_string())]),
          ..Default::default()
        },
        Layer {
          name: "b".to_string(),
          build_with: Some("builder".to_string()),
          ..Default::default()
        },
      ],
      ..Default::default()
    };
    assert_eq!(image.dependencies(), vec!["go", "builder"]);
  }

  #[test]
  fn go_module_defaults_to_flynn() {
    assert_eq!(Manifest::default().go_module(), "github.com/flynn/flynn");
  }
}
