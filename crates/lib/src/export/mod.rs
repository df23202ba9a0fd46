//! Publishing build output to a TUF repository.
//!
//! Targets are staged under `<repo>/staged/targets/`, where a TUF file
//! system store commits them from:
//!
//! - `images/<manifest id>.json`: each image manifest, byte for byte
//! - `layers/<id>.json` and `layers/<id>.squashfs`: each layer record and blob
//! - `<version>/images.json.gz` and `<version>/<name>.gz` for every deployment
//!   manifest, with local layer URLs pointed at the repository
//! - `<version>/<bin>.gz` and `<bin>.gz` for every file in `build/bin`
//!
//! Images and layers already listed in the committed `repository/targets.json`
//! are not staged again. The staged `targets.json` lists every committed and
//! staged target with its length and SHA-512; signing it is left to the
//! repository tooling.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::cache::LocalCache;
use crate::image::{Artifact, IMAGE_LAYER_TYPE_SQUASHFS, ImageLayer};
use crate::util::hash::hash_bytes;
use crate::util::size::human_size;

#[derive(Debug, Error)]
pub enum ExportError {
  #[error("not a directory: {0}")]
  NotADirectory(PathBuf),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to decode {path}: {source}")]
  Decode {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to encode {what}: {source}")]
  Encode {
    what: &'static str,
    #[source]
    source: serde_json::Error,
  },

  #[error("layer {id} has unsupported type {layer_type:?}")]
  UnsupportedLayer { id: String, layer_type: String },

  #[error("layer {id}: expected {expected} bytes, copied {actual}")]
  LengthMismatch { id: String, expected: u64, actual: u64 },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> ExportError + use<> {
  let path = path.to_path_buf();
  move |source| ExportError::Io { path, source }
}

/// Length, hashes and custom metadata of one repository target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetMeta {
  pub length: u64,
  #[serde(default)]
  pub hashes: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub custom: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignedTargets {
  #[serde(rename = "_type", default)]
  targets_type: String,
  #[serde(default)]
  targets: BTreeMap<String, TargetMeta>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TargetsFile {
  signed: SignedTargets,
  #[serde(default)]
  signatures: Vec<serde_json::Value>,
}

/// Read the target list of a `targets.json`, empty if the file is absent.
pub fn read_targets(path: &Path) -> Result<BTreeMap<String, TargetMeta>, ExportError> {
  let data = match fs::read(path) {
    Ok(data) => data,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
    Err(e) => return Err(io_err(path)(e)),
  };
  let file: TargetsFile = serde_json::from_slice(&data).map_err(|source| ExportError::Decode {
    path: path.to_path_buf(),
    source,
  })?;
  Ok(file.signed.targets)
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
  /// Directory holding `images.json`, `manifests/` and `bin/`.
  pub build_dir: PathBuf,
  /// Local layer cache the blobs are copied from.
  pub cache_dir: PathBuf,
  /// Public URL of the repository.
  pub repository: String,
  pub version: String,
}

/// What an export staged.
#[derive(Debug, Default)]
pub struct ExportReport {
  /// Names of the images whose manifests were staged.
  pub images: Vec<String>,
  pub layers: usize,
  /// Gzipped manifests and binaries.
  pub files: usize,
  /// Images already present in the repository.
  pub skipped: usize,
}

pub struct Exporter {
  dir: PathBuf,
  config: ExportConfig,
  cache: LocalCache,
  committed: BTreeMap<String, TargetMeta>,
  staged: BTreeMap<String, TargetMeta>,
}

impl Exporter {
  /// Open the repository at `dir`, which must already exist.
  pub fn new(dir: &Path, config: ExportConfig) -> Result<Self, ExportError> {
    if !dir.is_dir() {
      return Err(ExportError::NotADirectory(dir.to_path_buf()));
    }
    let committed = read_targets(&dir.join("repository").join("targets.json"))?;
    debug!(dir = %dir.display(), targets = committed.len(), "opened tuf repository");

    Ok(Self {
      dir: dir.to_path_buf(),
      cache: LocalCache::new(&config.cache_dir),
      config,
      committed,
      staged: BTreeMap::new(),
    })
  }

  pub fn staged_dir(&self) -> PathBuf {
    self.dir.join("staged")
  }

  fn staged_path(&self, target: &str) -> PathBuf {
    self.staged_dir().join("targets").join(target.trim_start_matches('/'))
  }

  fn exists(&self, target: &str) -> bool {
    self.committed.contains_key(target) || self.staged.contains_key(target)
  }

  /// Stage everything in the build directory, replacing any earlier staging.
  pub fn export(mut self) -> Result<ExportReport, ExportError> {
    info!(version = %self.config.version, repository = %self.config.repository, "exporting build");
    let staged = self.staged_dir();
    if staged.exists() {
      fs::remove_dir_all(&staged).map_err(io_err(&staged))?;
    }

    let mut report = ExportReport::default();
    let images_path = self.config.build_dir.join("images.json");
    let data = fs::read(&images_path).map_err(io_err(&images_path))?;
    let artifacts: BTreeMap<String, Artifact> =
      serde_json::from_slice(&data).map_err(|source| ExportError::Decode {
        path: images_path.clone(),
        source,
      })?;

    for (name, path) in self.binaries()? {
      let versioned = format!("{}/{name}", self.config.version);
      self.export_file(&path, &versioned)?;
      self.export_file(&path, &name)?;
      report.files += 2;
    }

    let local_templates: BTreeSet<&str> = artifacts
      .values()
      .map(|a| a.layer_url_template.as_str())
      .filter(|t| !t.is_empty())
      .collect();
    let mut manifests = vec![("images.json".to_string(), data.clone())];
    for (name, path) in self.manifests()? {
      manifests.push((name, fs::read(&path).map_err(io_err(&path))?));
    }
    for (name, data) in manifests {
      let data = self.rewrite_layer_urls(data, &local_templates);
      info!(name = %name, "exporting manifest");
      let target = format!("{}/{name}", self.config.version);
      self.export_data(&mut data.as_slice(), &target)?;
      report.files += 1;
    }

    for (name, artifact) in &artifacts {
      if self.export_image(name, artifact, &mut report)? {
        report.images.push(name.clone());
      } else {
        report.skipped += 1;
      }
    }

    self.write_targets()?;
    Ok(report)
  }

  /// Files directly under `build/bin`, sorted by name.
  fn binaries(&self) -> Result<Vec<(String, PathBuf)>, ExportError> {
    let dir = self.config.build_dir.join("bin");
    if !dir.is_dir() {
      return Ok(Vec::new());
    }
    self.files_under(&dir, 1)
  }

  /// Files under `build/manifests`, keyed by their relative path.
  fn manifests(&self) -> Result<Vec<(String, PathBuf)>, ExportError> {
    let dir = self.config.build_dir.join("manifests");
    if !dir.is_dir() {
      return Ok(Vec::new());
    }
    self.files_under(&dir, usize::MAX)
  }

  fn files_under(&self, dir: &Path, max_depth: usize) -> Result<Vec<(String, PathBuf)>, ExportError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).max_depth(max_depth).sort_by_file_name() {
      let entry = entry.map_err(|e| {
        let path = e.path().unwrap_or(dir).to_path_buf();
        ExportError::Io {
          path,
          source: e.into(),
        }
      })?;
      if !entry.file_type().is_file() {
        continue;
      }
      let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
      files.push((rel.to_string_lossy().into_owned(), entry.path().to_path_buf()));
    }
    Ok(files)
  }

  /// Point local `file://` layer URLs at the repository's layer targets.
  fn rewrite_layer_urls(&self, data: Vec<u8>, local_templates: &BTreeSet<&str>) -> Vec<u8> {
    let Ok(mut text) = String::from_utf8(data.clone()) else {
      return data;
    };
    let remote = format!("{}?target=/layers/{{id}}.squashfs", self.config.repository);
    for template in local_templates {
      text = text.replace(template, &remote);
    }
    text.into_bytes()
  }

  fn export_file(&mut self, path: &Path, target: &str) -> Result<(), ExportError> {
    info!(path = %path.display(), target, "exporting file");
    let mut file = fs::File::open(path).map_err(io_err(path))?;
    self.export_data(&mut file, target)
  }

  /// Gzip `data` into target `<target>.gz`.
  fn export_data(&mut self, data: &mut dyn Read, target: &str) -> Result<(), ExportError> {
    let target = format!("{}.gz", normalize(target));
    let path = self.staged_path(&target);
    create_parent(&path)?;

    let file = fs::File::create(&path).map_err(io_err(&path))?;
    let mut gz = GzEncoder::new(file, Compression::best());
    let written = io::copy(data, &mut gz).and_then(|_| gz.finish().map(|_| ()));
    if let Err(e) = written {
      let _ = fs::remove_file(&path);
      return Err(io_err(&path)(e));
    }
    self.add_target(&target)
  }

  /// Stage `artifact`'s layers and manifest. Returns false when the image is
  /// already in the repository.
  fn export_image(&mut self, name: &str, artifact: &Artifact, report: &mut ExportReport) -> Result<bool, ExportError> {
    let raw = artifact.raw_manifest.get().as_bytes();
    let id = hash_bytes(raw).0;
    let target = format!("/images/{id}.json");
    if self.exists(&target) {
      debug!(name, image.id = %id, "image already exported");
      return Ok(false);
    }
    info!(name, image.id = %id, "exporting image");

    let manifest = artifact.manifest().map_err(|source| ExportError::Decode {
      path: PathBuf::from(&target),
      source,
    })?;
    for layer in manifest.layers() {
      if self.export_layer(layer)? {
        report.layers += 1;
      }
    }

    let path = self.staged_path(&target);
    create_parent(&path)?;
    fs::write(&path, raw).map_err(io_err(&path))?;
    self.add_target(&target)?;
    Ok(true)
  }

  fn export_layer(&mut self, layer: &ImageLayer) -> Result<bool, ExportError> {
    let blob_target = format!("/layers/{}.squashfs", layer.id);
    if self.exists(&blob_target) {
      return Ok(false);
    }
    if layer.layer_type != IMAGE_LAYER_TYPE_SQUASHFS {
      return Err(ExportError::UnsupportedLayer {
        id: layer.id.clone(),
        layer_type: layer.layer_type.clone(),
      });
    }
    info!(layer.id = %layer.id, layer.size = %human_size(layer.length), "exporting layer");

    let record_target = format!("/layers/{}.json", layer.id);
    let mut record = serde_json::to_vec(layer).map_err(|source| ExportError::Encode {
      what: "layer record",
      source,
    })?;
    record.push(b'\n');
    let record_path = self.staged_path(&record_target);
    create_parent(&record_path)?;
    fs::write(&record_path, record).map_err(io_err(&record_path))?;
    self.add_target(&record_target)?;

    let src = self.cache.blob_path(&layer.id);
    let dst = self.staged_path(&blob_target);
    let mut input = fs::File::open(&src).map_err(io_err(&src))?;
    let mut output = fs::File::create(&dst).map_err(io_err(&dst))?;
    let copied = io::copy(&mut input, &mut output).map_err(io_err(&dst))?;
    if copied != layer.length {
      let _ = fs::remove_file(&dst);
      return Err(ExportError::LengthMismatch {
        id: layer.id.clone(),
        expected: layer.length,
        actual: copied,
      });
    }
    self.add_target(&blob_target)?;
    Ok(true)
  }

  fn add_target(&mut self, target: &str) -> Result<(), ExportError> {
    let path = self.staged_path(target);
    let mut file = fs::File::open(&path).map_err(io_err(&path))?;
    let mut hasher = Sha512::new();
    let length = io::copy(&mut file, &mut hasher).map_err(io_err(&path))?;

    self.staged.insert(
      target.to_string(),
      TargetMeta {
        length,
        hashes: BTreeMap::from([("sha512".to_string(), hex::encode(hasher.finalize()))]),
        custom: Some(serde_json::json!({ "version": self.config.version })),
      },
    );
    Ok(())
  }

  /// Write `staged/targets.json` with the committed targets plus the staged ones.
  fn write_targets(&self) -> Result<(), ExportError> {
    let mut targets = self.committed.clone();
    targets.extend(self.staged.iter().map(|(k, v)| (k.clone(), v.clone())));
    let file = TargetsFile {
      signed: SignedTargets {
        targets_type: "Targets".to_string(),
        targets,
      },
      signatures: Vec::new(),
    };

    let path = self.staged_dir().join("targets.json");
    let mut data = serde_json::to_vec_pretty(&file).map_err(|source| ExportError::Encode {
      what: "targets",
      source,
    })?;
    data.push(b'\n');
    create_parent(&path)?;
    let mut out = fs::File::create(&path).map_err(io_err(&path))?;
    out.write_all(&data).map_err(io_err(&path))?;
    debug!(path = %path.display(), staged = self.staged.len(), "wrote staged targets");
    Ok(())
  }
}

/// Target names are absolute, slash-separated paths.
fn normalize(target: &str) -> String {
  format!("/{}", target.trim_start_matches('/'))
}

fn create_parent(path: &Path) -> Result<(), ExportError> {
  match path.parent() {
    Some(parent) => fs::create_dir_all(parent).map_err(io_err(parent)),
    None => Ok(()),
  }
}
