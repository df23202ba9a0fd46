use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::consts::DEFAULT_ENTRYPOINT;
use crate::util::canonical;
use crate::util::hash::{ContentHash, hash_bytes};

pub const IMAGE_MANIFEST_TYPE_V1: &str = "application/vnd.flynn.image.manifest.v1+json";
pub const IMAGE_LAYER_TYPE_SQUASHFS: &str = "application/vnd.flynn.image.squashfs.v1";
pub const ARTIFACT_TYPE_FLYNN: &str = "flynn";

pub const META_MANIFEST_ID: &str = "manifest.id";
pub const META_COMPONENT: &str = "flynn.component";
pub const META_SYSTEM_IMAGE: &str = "flynn.system-image";

fn is_zero(n: &u64) -> bool {
  *n == 0
}

/// Record describing one built squashfs layer.
///
/// Also stored on disk as `<cache>/<id>.json` next to the blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageLayer {
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub id: String,
  #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
  pub layer_type: String,
  #[serde(default, skip_serializing_if = "is_zero")]
  pub length: u64,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub hashes: BTreeMap<String, String>,
}

impl ImageLayer {
  /// A squashfs layer record for a blob of `length` bytes with digest `hash`.
  pub fn squashfs(id: &str, length: u64, hash: &ContentHash) -> Self {
    Self {
      id: id.to_string(),
      layer_type: IMAGE_LAYER_TYPE_SQUASHFS.to_string(),
      length,
      hashes: hash.to_hashes(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePlatform {
  pub architecture: String,
  pub os: String,
}

impl Default for ImagePlatform {
  fn default() -> Self {
    Self {
      architecture: "amd64".to_string(),
      os: "linux".to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRootfs {
  #[serde(default)]
  pub platform: ImagePlatform,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub layers: Vec<ImageLayer>,
}

/// Process defaults for containers started from an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntrypoint {
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub env: BTreeMap<String, String>,
  #[serde(rename = "cwd", default, skip_serializing_if = "Option::is_none")]
  pub working_dir: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub args: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub linux_capabilities: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub uid: Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub gid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageManifest {
  #[serde(rename = "_type")]
  pub manifest_type: String,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub meta: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub entrypoints: BTreeMap<String, ImageEntrypoint>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub rootfs: Vec<ImageRootfs>,
}

impl ImageManifest {
  /// A single-rootfs manifest for the default platform.
  pub fn new(layers: Vec<ImageLayer>, entrypoint: Option<ImageEntrypoint>) -> Self {
    let mut entrypoints = BTreeMap::new();
    if let Some(entrypoint) = entrypoint {
      entrypoints.insert(DEFAULT_ENTRYPOINT.to_string(), entrypoint);
    }
    Self {
      manifest_type: IMAGE_MANIFEST_TYPE_V1.to_string(),
      meta: BTreeMap::new(),
      entrypoints,
      rootfs: vec![ImageRootfs {
        platform: ImagePlatform::default(),
        layers,
      }],
    }
  }

  /// Canonical JSON encoding of the manifest.
  pub fn raw_manifest(&self) -> Result<Vec<u8>, serde_json::Error> {
    canonical::to_vec(self)
  }

  /// SHA-512/256 of the canonical encoding.
  pub fn id(&self) -> Result<ContentHash, serde_json::Error> {
    Ok(hash_bytes(&self.raw_manifest()?))
  }

  /// All layers across every rootfs, in order.
  pub fn layers(&self) -> impl Iterator<Item = &ImageLayer> {
    self.rootfs.iter().flat_map(|rootfs| rootfs.layers.iter())
  }
}

/// A built image, as published to `build/images.json`.
///
/// `manifest` holds the exact canonical bytes the manifest ID was computed
/// over. They are carried verbatim through serialization and never
/// regenerated from the decoded form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub id: String,
  #[serde(rename = "type")]
  pub artifact_type: String,
  pub uri: String,
  #[serde(default)]
  pub meta: BTreeMap<String, String>,
  #[serde(rename = "manifest")]
  pub raw_manifest: Box<RawValue>,
  #[serde(default)]
  pub hashes: BTreeMap<String, String>,
  #[serde(default)]
  pub size: u64,
  #[serde(default)]
  pub layer_url_template: String,
}

impl Artifact {
  /// Seal `manifest` into an artifact for image `name`.
  ///
  /// The URI points at `/images/<manifest id>.json` under `repository`.
  pub fn seal(
    name: &str,
    manifest: &ImageManifest,
    repository: &str,
    layer_url_template: &str,
  ) -> Result<Self, serde_json::Error> {
    let raw = manifest.raw_manifest()?;
    let id = hash_bytes(&raw);
    let size = raw.len() as u64;
    let raw_manifest = RawValue::from_string(String::from_utf8_lossy(&raw).into_owned())?;

    Ok(Self {
      id: String::new(),
      artifact_type: ARTIFACT_TYPE_FLYNN.to_string(),
      uri: format!("{repository}?name={name}&target=/images/{id}.json"),
      meta: BTreeMap::from([
        (META_MANIFEST_ID.to_string(), id.0.clone()),
        (META_COMPONENT.to_string(), name.to_string()),
        (META_SYSTEM_IMAGE.to_string(), "true".to_string()),
      ]),
      raw_manifest,
      hashes: id.to_hashes(),
      size,
      layer_url_template: layer_url_template.to_string(),
    })
  }

  /// Decode the embedded manifest.
  pub fn manifest(&self) -> Result<ImageManifest, serde_json::Error> {
    serde_json::from_str(self.raw_manifest.get())
  }

  /// The manifest ID this artifact was sealed with.
  pub fn manifest_id(&self) -> Option<&str> {
    self.meta.get(META_MANIFEST_ID).map(String::as_str)
  }

  /// URL from which `layer` can be fetched.
  pub fn layer_url(&self, layer: &ImageLayer) -> String {
    self.layer_url_template.replace("{id}", &layer.id)
  }
}
