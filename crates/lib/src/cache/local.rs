//! On-disk layer cache.
//!
//! Each layer is two files in the cache directory: `<id>.squashfs` holds the
//! blob and `<id>.json` its `ImageLayer` record. Files are written to a
//! temporary name and renamed into place, blob first, so a record on disk
//! always describes a complete blob.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::image::ImageLayer;
use crate::util::hash::{HashingWriter, hash_file};

use super::CacheError;

#[derive(Debug, Clone)]
pub struct LocalCache {
  dir: PathBuf,
}

impl LocalCache {
  pub fn new(dir: &Path) -> Self {
    Self { dir: dir.to_path_buf() }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn blob_path(&self, id: &str) -> PathBuf {
    self.dir.join(format!("{id}.squashfs"))
  }

  pub fn record_path(&self, id: &str) -> PathBuf {
    self.dir.join(format!("{id}.json"))
  }

  fn ensure_dir(&self) -> Result<(), CacheError> {
    fs::create_dir_all(&self.dir).map_err(|source| CacheError::Io {
      path: self.dir.clone(),
      source,
    })
  }

  /// Look up `id`.
  ///
  /// A record without its blob is a miss. A blob without its record has the
  /// record regenerated by hashing the blob.
  pub fn get(&self, id: &str) -> Result<Option<ImageLayer>, CacheError> {
    let record_path = self.record_path(id);
    let blob_path = self.blob_path(id);

    match fs::read(&record_path) {
      Ok(data) => {
        if !blob_path.is_file() {
          warn!(id, path = %blob_path.display(), "layer record has no blob, ignoring");
          return Ok(None);
        }
        let record = serde_json::from_slice(&data).map_err(|source| CacheError::Corrupt {
          path: record_path.clone(),
          source,
        })?;
        Ok(Some(record))
      }
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        if !blob_path.is_file() {
          return Ok(None);
        }
        debug!(id, "regenerating layer record from blob");
        let (length, hash) = hash_file(&blob_path).map_err(|source| CacheError::Io {
          path: blob_path.clone(),
          source,
        })?;
        let record = ImageLayer::squashfs(id, length, &hash);
        self.write_record(&record)?;
        Ok(Some(record))
      }
      Err(source) => Err(CacheError::Io {
        path: record_path,
        source,
      }),
    }
  }

  /// Copy `src` into the cache as layer `id`, hashing it on the way.
  pub fn insert(&self, id: &str, src: &Path) -> Result<ImageLayer, CacheError> {
    self.ensure_dir()?;
    let io_err = |path: &Path| {
      let path = path.to_path_buf();
      move |source| CacheError::Io { path, source }
    };

    let mut input = fs::File::open(src).map_err(io_err(src))?;
    let temp = NamedTempFile::new_in(&self.dir).map_err(io_err(&self.dir))?;
    let mut writer = HashingWriter::new(temp);
    io::copy(&mut input, &mut writer).map_err(io_err(src))?;
    writer.flush().map_err(io_err(src))?;
    let (temp, (length, hash)) = writer.finish();

    let blob_path = self.blob_path(id);
    make_readable(temp.path()).map_err(io_err(temp.path()))?;
    temp
      .persist(&blob_path)
      .map_err(|e| CacheError::Io {
        path: blob_path.clone(),
        source: e.error,
      })?;

    let record = ImageLayer::squashfs(id, length, &hash);
    self.write_record(&record)?;
    Ok(record)
  }

  /// Move an already-downloaded blob into place and store its record bytes.
  pub fn adopt(&self, id: &str, blob: tempfile::TempPath, record: &[u8]) -> Result<(), CacheError> {
    let blob_path = self.blob_path(id);
    make_readable(&blob).map_err(|source| CacheError::Io {
      path: blob.to_path_buf(),
      source,
    })?;
    blob.persist(&blob_path).map_err(|e| CacheError::Io {
      path: blob_path.clone(),
      source: e.error,
    })?;
    self.write_atomic(&self.record_path(id), record)
  }

  fn write_record(&self, record: &ImageLayer) -> Result<(), CacheError> {
    let path = self.record_path(&record.id);
    let data = serde_json::to_vec(record).map_err(|source| CacheError::Corrupt {
      path: path.clone(),
      source,
    })?;
    self.write_atomic(&path, &data)
  }

  fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), CacheError> {
    self.ensure_dir()?;
    let io_err = |source| CacheError::Io {
      path: path.to_path_buf(),
      source,
    };
    let mut temp = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
    temp.write_all(data).map_err(io_err)?;
    make_readable(temp.path()).map_err(io_err)?;
    temp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
  }

  /// A temp file in the cache directory for an incoming blob.
  pub fn incoming(&self) -> Result<tempfile::TempPath, CacheError> {
    self.ensure_dir()?;
    let temp = NamedTempFile::new_in(&self.dir).map_err(|source| CacheError::Io {
      path: self.dir.clone(),
      source,
    })?;
    Ok(temp.into_temp_path())
  }
}

/// Cache files are read by other processes through `file://` layer URLs,
/// so they are not left with the owner-only mode of a fresh temp file.
#[cfg(unix)]
fn make_readable(path: &Path) -> io::Result<()> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn make_readable(_path: &Path) -> io::Result<()> {
  Ok(())
}
