//! Build manifest loading and validation.
//!
//! `load` reads the manifest JSON, expands layer templates into the images
//! that reference them, names unnamed layers after their image and validates
//! the result:
//! - image IDs are unique
//! - `template` and `layers` are not both set on an image
//! - `base` and `build_with` references name images in the manifest
//! - the image dependency graph is acyclic

mod types;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::execute::dag::ImageGraph;

pub use types::*;

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("failed to read manifest {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse manifest {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("duplicate image: {0}")]
  DuplicateImage(String),

  #[error("image {0} sets both template and layers")]
  TemplateWithLayers(String),

  #[error("image {image} uses unknown template {template}")]
  UnknownTemplate { image: String, template: String },

  #[error("image {image} references unknown image {reference}")]
  UnknownImage { image: String, reference: String },

  #[error("dependency cycle involving image {0}")]
  Cycle(String),
}

/// Load, expand and validate the manifest at `path`.
pub fn load(path: &Path) -> Result<Manifest, ManifestError> {
  let data = std::fs::read(path).map_err(|source| ManifestError::Read {
    path: path.to_path_buf(),
    source,
  })?;
  let manifest = serde_json::from_slice(&data).map_err(|source| ManifestError::Parse {
    path: path.to_path_buf(),
    source,
  })?;
  let manifest = prepare(manifest)?;
  debug!(path = %path.display(), images = manifest.images.len(), "loaded manifest");
  Ok(manifest)
}

/// Expand templates in a parsed manifest and validate it.
pub fn prepare(mut manifest: Manifest) -> Result<Manifest, ManifestError> {
  expand_templates(&mut manifest)?;
  validate(&manifest)?;
  Ok(manifest)
}

fn expand_templates(manifest: &mut Manifest) -> Result<(), ManifestError> {
  for image in &mut manifest.images {
    if let Some(name) = &image.template {
      if !image.layers.is_empty() {
        return Err(ManifestError::TemplateWithLayers(image.id.clone()));
      }
      let template = manifest
        .templates
        .get(name)
        .ok_or_else(|| ManifestError::UnknownTemplate {
          image: image.id.clone(),
          template: name.clone(),
        })?;
      image.layers = template.layers.clone();
    }

    for layer in &mut image.layers {
      if layer.name.is_empty() {
        layer.name = image.id.clone();
      }
    }
  }
  Ok(())
}

fn validate(manifest: &Manifest) -> Result<(), ManifestError> {
  let mut seen = HashSet::new();
  for image in &manifest.images {
    if !seen.insert(image.id.as_str()) {
      return Err(ManifestError::DuplicateImage(image.id.clone()));
    }
  }

  // Reference and cycle checks.
  ImageGraph::new(&manifest.images)?;
  Ok(())
}
