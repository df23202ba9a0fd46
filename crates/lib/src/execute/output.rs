//! Build outputs.
//!
//! - `build/image/<id>.json`: the artifact of each image, written as it is built
//! - `build/manifests/<name>`: deployment manifests with artifacts interpolated
//! - `build/images.json`: every artifact keyed by image ID, replaced atomically

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::image::{Artifact, META_COMPONENT, META_SYSTEM_IMAGE};

use super::ExecuteError;

/// `$image_artifact[<name>]`
static IMAGE_ARTIFACT_REGEX: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"\$image_artifact\[[^\]]+\]").expect("image artifact regex is valid"));

const IMAGE_ARTIFACT_PREFIX_LEN: usize = "$image_artifact[".len();

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ExecuteError + use<> {
  let path = path.to_path_buf();
  move |source| ExecuteError::Io { path, source }
}

/// Compact JSON followed by a newline.
fn encode_line<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ExecuteError> {
  let mut data = serde_json::to_vec(value).map_err(ExecuteError::Encode)?;
  data.push(b'\n');
  Ok(data)
}

/// Write `artifact` to `<build_dir>/image/<id>.json`.
pub async fn write_image_artifact(build_dir: &Path, id: &str, artifact: &Artifact) -> Result<PathBuf, ExecuteError> {
  let dir = build_dir.join("image");
  tokio::fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;
  let path = dir.join(format!("{id}.json"));
  tokio::fs::write(&path, encode_line(artifact)?).await.map_err(io_err(&path))?;
  Ok(path)
}

/// Replace every `$image_artifact[<name>]` in `template` with the JSON of
/// the artifact built for image `<name>`.
///
/// The embedded artifact carries only the component and system image meta
/// keys.
pub fn interpolate(template: &str, artifacts: &BTreeMap<String, Artifact>) -> Result<String, ExecuteError> {
  let mut out = String::with_capacity(template.len());
  let mut last = 0;

  for m in IMAGE_ARTIFACT_REGEX.find_iter(template) {
    let raw = m.as_str();
    let name = &raw[IMAGE_ARTIFACT_PREFIX_LEN..raw.len() - 1];
    let artifact = artifacts
      .get(name)
      .ok_or_else(|| ExecuteError::UnknownImage(name.to_string()))?;

    let mut embedded = artifact.clone();
    embedded.meta = BTreeMap::from([
      (META_COMPONENT.to_string(), name.to_string()),
      (META_SYSTEM_IMAGE.to_string(), "true".to_string()),
    ]);
    let json = serde_json::to_string(&embedded).map_err(ExecuteError::Encode)?;

    out.push_str(&template[last..m.start()]);
    out.push_str(&json);
    last = m.end();
  }
  out.push_str(&template[last..]);
  Ok(out)
}

/// Interpolate each `source -> name` entry of `manifests` into
/// `<build_dir>/manifests/<name>`. Sources are relative to `workspace`.
pub async fn write_manifests(
  workspace: &Path,
  build_dir: &Path,
  manifests: &BTreeMap<String, String>,
  artifacts: &BTreeMap<String, Artifact>,
) -> Result<(), ExecuteError> {
  for (src, name) in manifests {
    let src = workspace.join(src);
    let dst = build_dir.join("manifests").join(name);
    debug!(src = %src.display(), dst = %dst.display(), "writing manifest");

    let template = tokio::fs::read_to_string(&src).await.map_err(io_err(&src))?;
    let manifest = interpolate(&template, artifacts)?;
    if let Some(parent) = dst.parent() {
      tokio::fs::create_dir_all(parent).await.map_err(io_err(parent))?;
    }
    tokio::fs::write(&dst, manifest).await.map_err(io_err(&dst))?;
  }
  Ok(())
}

/// Write `<build_dir>/images.json` via a temp file and rename, so readers
/// see either the old file or the complete new one.
pub async fn write_images(build_dir: &Path, artifacts: &BTreeMap<String, Artifact>) -> Result<PathBuf, ExecuteError> {
  tokio::fs::create_dir_all(build_dir).await.map_err(io_err(build_dir))?;
  let path = build_dir.join("images.json");
  let tmp = build_dir.join("images.json.tmp");
  debug!(path = %path.display(), images = artifacts.len(), "writing images");

  let data = encode_line(artifacts)?;
  if let Err(e) = tokio::fs::write(&tmp, data).await {
    let _ = tokio::fs::remove_file(&tmp).await;
    return Err(io_err(&tmp)(e));
  }
  tokio::fs::rename(&tmp, &path).await.map_err(io_err(&path))?;
  Ok(path)
}
