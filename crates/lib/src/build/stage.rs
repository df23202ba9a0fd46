//! Staging directories.
//!
//! Everything a build job can see of the host lives in one scratch directory
//! shared over 9P and mounted at `/mnt`:
//!
//! ```text
//! bin/flynn-builder    the running builder binary, used to package the layer
//! out/                 the job writes out/layer.squashfs here
//! src/<input>          each declared input at its workspace-relative path
//! ```
//!
//! Only declared inputs are copied, so a job cannot read anything its layer
//! ID does not cover. The directory is removed when the `StagingDir` drops.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::error;

use crate::consts::{BUILDER_BIN_NAME, LAYER_OUTPUT_PATH};

use super::BuildError;

const STAGING_PREFIX: &str = "flynn-build-mnt";
const SUBDIRS: &[&str] = &["bin", "out", "src"];

#[derive(Debug)]
pub struct StagingDir {
  dir: TempDir,
}

impl StagingDir {
  /// Create a staging directory under `root`, or the system temp dir.
  pub fn new(root: Option<&Path>) -> Result<Self, BuildError> {
    let root = root.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
    let dir = tempfile::Builder::new()
      .prefix(STAGING_PREFIX)
      .tempdir_in(&root)
      .map_err(|source| BuildError::Stage { path: root, source })?;

    set_dir_mode(dir.path()).map_err(|source| BuildError::Stage {
      path: dir.path().to_path_buf(),
      source,
    })?;
    for sub in SUBDIRS {
      let path = dir.path().join(sub);
      create_dir(&path).map_err(|source| BuildError::Stage { path, source })?;
    }
    Ok(Self { dir })
  }

  pub fn path(&self) -> &Path {
    self.dir.path()
  }

  /// Where the job is expected to leave the built layer.
  pub fn layer_output(&self) -> PathBuf {
    self.dir.path().join(LAYER_OUTPUT_PATH)
  }

  /// Copy each workspace-relative input to `src/<input>`, keeping its mode.
  pub fn stage_inputs(&self, workspace: &Path, inputs: &[String]) -> Result<(), BuildError> {
    for input in inputs {
      let dst = self.dir.path().join("src").join(checked_relative(input)?);
      copy_file(&workspace.join(input), &dst).map_err(|source| {
        error!(input = %input, err = %source, "error copying input");
        BuildError::Stage { path: dst, source }
      })?;
    }
    Ok(())
  }

  /// Copy the builder binary to `bin/flynn-builder`.
  pub fn install_builder(&self, bin: &Path) -> Result<(), BuildError> {
    let dst = self.dir.path().join("bin").join(BUILDER_BIN_NAME);
    copy_file(bin, &dst).map_err(|source| {
      error!(err = %source, "error copying flynn-builder binary");
      BuildError::Stage { path: dst, source }
    })
  }
}

/// Reject inputs that would land outside `src/`.
fn checked_relative(input: &str) -> Result<&Path, BuildError> {
  let path = Path::new(input);
  let escapes = path
    .components()
    .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
  if escapes {
    return Err(BuildError::Stage {
      path: path.to_path_buf(),
      source: io::Error::new(io::ErrorKind::InvalidInput, "input must be a relative path inside the workspace"),
    });
  }
  Ok(path)
}

fn copy_file(src: &Path, dst: &Path) -> io::Result<()> {
  if let Some(parent) = dst.parent() {
    create_dir(parent)?;
  }
  // fs::copy carries permission bits over.
  fs::copy(src, dst)?;
  Ok(())
}

#[cfg(unix)]
fn create_dir(path: &Path) -> io::Result<()> {
  use std::os::unix::fs::DirBuilderExt;
  fs::DirBuilder::new().recursive(true).mode(0o755).create(path)
}

#[cfg(not(unix))]
fn create_dir(path: &Path) -> io::Result<()> {
  fs::create_dir_all(path)
}

#[cfg(unix)]
fn set_dir_mode(path: &Path) -> io::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) -> io::Result<()> {
  Ok(())
}
