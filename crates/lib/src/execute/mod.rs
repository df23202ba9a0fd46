//! Image build orchestration.
//!
//! Builds every image of a manifest, each as soon as the images it depends
//! on are done:
//! - images whose dependencies are all built start immediately, concurrently
//! - each image builds its layers in order, publishing its artifact at the end
//! - a failed image aborts every image that transitively depends on it
//!
//! Workers report back on a single completion channel; only the scheduling
//! loop touches the dependency bookkeeping.

pub mod dag;
pub mod output;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore, mpsc};
use tracing::{debug, error, info};

use crate::build::{BuildError, FileShare, LayerBuilder, LayerBuilderConfig, layer_id};
use crate::cache::{LayerCache, TufClient};
use crate::image::{Artifact, ImageManifest};
use crate::inputs::InputResolver;
use crate::manifest::{Image, Manifest, ManifestError};
use crate::scheduler::Scheduler;

use dag::ImageGraph;

#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error(transparent)]
  Manifest(#[from] ManifestError),

  #[error("no images to build")]
  NoImages,

  #[error("image {image}: {source}")]
  Build {
    image: String,
    #[source]
    source: BuildError,
  },

  #[error("missing {0:?} artifact")]
  MissingArtifact(String),

  #[error("{} builds failed: {}", .failed.len(), .failed.join(", "))]
  BuildsFailed { failed: Vec<String>, aborted: Vec<String> },

  #[error("unknown image {0:?}")]
  UnknownImage(String),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid artifact for image {image}: {source}")]
  InvalidArtifact {
    image: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to encode JSON: {0}")]
  Encode(#[source] serde_json::Error),

  #[error("image build panicked: {0}")]
  Panic(String),

  #[error("build completion channel closed")]
  ChannelClosed,
}

/// Settings for a build run.
#[derive(Debug, Clone)]
pub struct BuildConfig {
  /// Root that manifest paths and layer inputs are relative to.
  pub workspace: PathBuf,
  /// Where artifacts, manifests and logs are written.
  pub build_dir: PathBuf,
  pub cache_dir: PathBuf,
  /// Parent of staging directories, the system temp dir if unset.
  pub staging_root: Option<PathBuf>,
  /// Binary copied into each build job.
  pub builder_bin: PathBuf,
  pub version: String,
  /// Maximum number of images built at once, unbounded if unset.
  pub parallelism: Option<usize>,
}

/// Outcome of a successful `build_all`.
#[derive(Debug, Clone, Default)]
pub struct BuildReport {
  /// Image IDs in completion order.
  pub built: Vec<String>,
  pub duration: Duration,
}

/// Builds the images of one manifest.
pub struct Builder {
  inner: Arc<Inner>,
}

struct Inner {
  config: BuildConfig,
  manifest: Manifest,
  resolver: InputResolver,
  layers: LayerBuilder,
  artifacts: RwLock<BTreeMap<String, Artifact>>,
  progress: AtomicUsize,
}

enum Outcome {
  Built,
  Failed(ExecuteError),
  Aborted,
}

struct Completion {
  id: String,
  outcome: Outcome,
  started: Instant,
}

impl Builder {
  /// `remote` is the TUF repository consulted on local cache misses.
  pub fn new(
    config: BuildConfig,
    manifest: Manifest,
    scheduler: Arc<dyn Scheduler>,
    share: Arc<dyn FileShare>,
    remote: Option<Arc<dyn TufClient>>,
  ) -> Result<Self, ExecuteError> {
    let root_keys = serde_json::to_string(&manifest.tuf.root_keys).map_err(ExecuteError::Encode)?;
    let template_values = BTreeMap::from([
      ("TUFRootKeys".to_string(), root_keys),
      ("TUFRepository".to_string(), manifest.tuf.repository.clone()),
    ]);
    let resolver = InputResolver::new(&config.workspace, manifest.go_module(), template_values);

    let cache = Arc::new(LayerCache::new(&config.cache_dir, remote));
    let layer_config = LayerBuilderConfig {
      workspace: config.workspace.clone(),
      log_dir: config.build_dir.join("log"),
      staging_root: config.staging_root.clone(),
      builder_bin: config.builder_bin.clone(),
      version: config.version.clone(),
      base_layer: manifest.base_layer.clone(),
    };
    let layers = LayerBuilder::new(layer_config, cache, scheduler, share);

    Ok(Self {
      inner: Arc::new(Inner {
        config,
        manifest,
        resolver,
        layers,
        artifacts: RwLock::new(BTreeMap::new()),
        progress: AtomicUsize::new(0),
      }),
    })
  }

  pub fn manifest(&self) -> &Manifest {
    &self.inner.manifest
  }

  /// Number of images finished (built, failed or aborted) so far.
  pub fn progress(&self) -> usize {
    self.inner.progress.load(Ordering::Relaxed)
  }

  pub async fn artifact(&self, id: &str) -> Option<Artifact> {
    self.inner.artifacts.read().await.get(id).cloned()
  }

  pub async fn artifacts(&self) -> BTreeMap<String, Artifact> {
    self.inner.artifacts.read().await.clone()
  }

  /// Build everything, then write the deployment manifests and `images.json`.
  ///
  /// Nothing aggregate is written unless every image built.
  pub async fn run(&self) -> Result<BuildReport, ExecuteError> {
    let report = self.build_all().await?;
    self.write_manifests().await?;
    self.write_images().await?;
    Ok(report)
  }

  /// Build every image in dependency order.
  pub async fn build_all(&self) -> Result<BuildReport, ExecuteError> {
    let images = &self.inner.manifest.images;
    if images.is_empty() {
      return Err(ExecuteError::NoImages);
    }
    let graph = ImageGraph::new(images)?;
    let total = graph.len();
    let start = Instant::now();
    info!(count = total, "building images");

    let semaphore = self.inner.config.parallelism.map(|n| Arc::new(Semaphore::new(n.max(1))));
    let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();

    let mut remaining: HashMap<String, usize> = images
      .iter()
      .map(|image| (image.id.clone(), graph.dependencies(&image.id).len()))
      .collect();
    let mut aborted: HashSet<String> = HashSet::new();

    for id in graph.topological_order() {
      if remaining[id] == 0 {
        self.start(id, false, &semaphore, &tx);
      }
    }

    let mut report = BuildReport::default();
    let mut failed: BTreeMap<String, ExecuteError> = BTreeMap::new();
    let mut finished = 0;

    while finished < total {
      let completion = rx.recv().await.ok_or(ExecuteError::ChannelClosed)?;
      finished += 1;
      self.inner.progress.store(finished, Ordering::Relaxed);
      let duration = completion.started.elapsed();

      let propagate_abort = match completion.outcome {
        Outcome::Built => {
          debug!(image = %completion.id, ?duration, "build done");
          report.built.push(completion.id.clone());
          false
        }
        Outcome::Failed(e) => {
          error!(image = %completion.id, ?duration, err = %e, "build error");
          failed.insert(completion.id.clone(), e);
          true
        }
        Outcome::Aborted => {
          debug!(image = %completion.id, "build abort");
          true
        }
      };
      info!(progress = %format!("{finished}/{total}"), "image finished");

      for dependent in graph.dependents(&completion.id) {
        if propagate_abort {
          aborted.insert(dependent.to_string());
        }
        let count = remaining.entry(dependent.to_string()).or_default();
        *count = count.saturating_sub(1);
        if *count == 0 {
          self.start(dependent, aborted.contains(dependent), &semaphore, &tx);
        }
      }
    }

    if !failed.is_empty() {
      error!("the following builds failed:");
      for (id, err) in &failed {
        error!(image = %id, err = %err, "* {id}");
      }
      let mut aborted: Vec<String> = aborted.into_iter().collect();
      aborted.sort();
      return Err(ExecuteError::BuildsFailed {
        failed: failed.into_keys().collect(),
        aborted,
      });
    }

    report.duration = start.elapsed();
    Ok(report)
  }

  /// Start the worker for image `id`, or report it aborted straight away.
  fn start(&self, id: &str, abort: bool, semaphore: &Option<Arc<Semaphore>>, tx: &mpsc::UnboundedSender<Completion>) {
    let started = Instant::now();
    if abort {
      let _ = tx.send(Completion {
        id: id.to_string(),
        outcome: Outcome::Aborted,
        started,
      });
      return;
    }

    debug!(image = %id, "build start");
    let inner = self.inner.clone();
    let semaphore = semaphore.clone();
    let tx = tx.clone();
    let id = id.to_string();

    tokio::spawn(async move {
      let _permit = match &semaphore {
        Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
        None => None,
      };
      let result = AssertUnwindSafe(inner.build_image_by_id(&id)).catch_unwind().await;
      let outcome = match result {
        Ok(Ok(())) => Outcome::Built,
        Ok(Err(e)) => Outcome::Failed(e),
        Err(panic) => Outcome::Failed(ExecuteError::Panic(panic_message(panic.as_ref()))),
      };
      let _ = tx.send(Completion { id, outcome, started });
    });
  }

  /// Build a single image whose dependencies have already been built.
  pub async fn build_image(&self, image: &Image) -> Result<Artifact, ExecuteError> {
    self.inner.build_image(image).await
  }

  /// Interpolate the manifest's deployment manifests into `build/manifests`.
  pub async fn write_manifests(&self) -> Result<(), ExecuteError> {
    let artifacts = self.inner.artifacts.read().await;
    output::write_manifests(
      &self.inner.config.workspace,
      &self.inner.config.build_dir,
      &self.inner.manifest.manifests,
      &artifacts,
    )
    .await
  }

  /// Write `build/images.json`.
  pub async fn write_images(&self) -> Result<PathBuf, ExecuteError> {
    let artifacts = self.inner.artifacts.read().await;
    output::write_images(&self.inner.config.build_dir, &artifacts).await
  }
}

impl Inner {
  async fn build_image_by_id(&self, id: &str) -> Result<(), ExecuteError> {
    let image = self
      .manifest
      .image(id)
      .ok_or_else(|| ExecuteError::UnknownImage(id.to_string()))?;
    self.build_image(image).await.map(|_| ())
  }

  async fn artifact(&self, id: &str) -> Result<Artifact, ExecuteError> {
    self
      .artifacts
      .read()
      .await
      .get(id)
      .cloned()
      .ok_or_else(|| ExecuteError::MissingArtifact(id.to_string()))
  }

  async fn build_image(&self, image: &Image) -> Result<Artifact, ExecuteError> {
    let build_err = |source: BuildError| ExecuteError::Build {
      image: image.id.clone(),
      source,
    };

    let mut layers = Vec::with_capacity(image.layers.len());
    for layer in &image.layers {
      let resolved = self
        .resolver
        .resolve(image, layer)
        .await
        .map_err(|e| build_err(e.into()))?;

      let artifact = match layer.build_with_image().or(image.base.as_deref()) {
        Some(with) => Some(self.artifact(with).await?),
        None => None,
      };

      let id = {
        let workspace = self.config.workspace.clone();
        let resolved = resolved.clone();
        let artifact = artifact.clone();
        tokio::task::spawn_blocking(move || layer_id(&workspace, &resolved, artifact.as_ref()))
          .await
          .map_err(|e| build_err(e.into()))?
          .map_err(build_err)?
      };

      let start = Instant::now();
      let record = self
        .layers
        .build(layer, &id, &resolved, artifact.as_ref())
        .await
        .map_err(build_err)?;
      debug!(layer.name = %resolved.name, layer.id = %id, duration = ?start.elapsed(), "layer done");
      layers.push(record);
    }

    let mut rootfs = Vec::new();
    if let Some(base) = &image.base {
      let manifest = self
        .artifact(base)
        .await?
        .manifest()
        .map_err(|source| ExecuteError::InvalidArtifact {
          image: base.clone(),
          source,
        })?;
      rootfs.extend(manifest.layers().cloned());
    }
    rootfs.extend(layers);

    let manifest = ImageManifest::new(rootfs, image.entrypoint.clone());
    let artifact = Artifact::seal(
      &image.id,
      &manifest,
      &self.manifest.tuf.repository,
      &self.layers.cache().layer_url_template(),
    )
    .map_err(ExecuteError::Encode)?;

    self.artifacts.write().await.insert(image.id.clone(), artifact.clone());
    output::write_image_artifact(&self.config.build_dir, &image.id, &artifact).await?;
    Ok(artifact)
  }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic".to_string()
  }
}
