//! Layer identity.
//!
//! A layer ID is the SHA-512/256 of the canonical JSON encoding of everything
//! that determines the layer's contents: its name, commands, environment, the
//! manifest of the image it is built with, and the size and digest of every
//! input file in order. Empty fields are omitted from the encoding.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use serde::Serialize;
use serde_json::value::RawValue;
use tracing::debug;

use crate::image::Artifact;
use crate::inputs::ResolvedLayer;
use crate::util::{canonical, hash};

use super::BuildError;

#[derive(Serialize)]
struct FileInput<'a> {
  path: &'a str,
  size: u64,
  sha: String,
}

/// Empty `run`, `env` and `files` are absent from the encoding rather than
/// written as `[]` or `{}`, matching IDs already published by earlier builds.
#[derive(Serialize)]
struct LayerIdentity<'a> {
  name: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  run: Option<&'a [String]>,
  #[serde(skip_serializing_if = "Option::is_none")]
  env: Option<&'a BTreeMap<String, String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  manifest: Option<&'a RawValue>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  files: Vec<FileInput<'a>>,
}

/// Compute the ID of `layer`, reading its inputs relative to `workspace`.
///
/// This reads and hashes every input file, so call it off the async runtime.
pub fn layer_id(workspace: &Path, layer: &ResolvedLayer, artifact: Option<&Artifact>) -> Result<String, BuildError> {
  let start = Instant::now();

  let mut files = Vec::with_capacity(layer.inputs.len());
  for input in &layer.inputs {
    let (size, sha) = hash::hash_file(&workspace.join(input)).map_err(|source| BuildError::ReadInput {
      path: input.clone(),
      source,
    })?;
    files.push(FileInput {
      path: input,
      size,
      sha: sha.0,
    });
  }

  let identity = LayerIdentity {
    name: &layer.name,
    run: (!layer.run.is_empty()).then_some(layer.run.as_slice()),
    env: (!layer.env.is_empty()).then_some(&layer.env),
    manifest: artifact.map(|a| a.raw_manifest.as_ref()),
    files,
  };
  let data = canonical::to_vec(&identity).map_err(|source| BuildError::Encode {
    what: "layer identity",
    source,
  })?;
  let id = hash::hash_bytes(&data).0;

  debug!(name = %layer.name, id = %id, duration = ?start.elapsed(), "generated layer ID");
  Ok(id)
}
