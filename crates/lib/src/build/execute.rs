//! Single layer realization.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::cache::LayerCache;
use crate::image::{Artifact, ImageLayer};
use crate::inputs::ResolvedLayer;
use crate::manifest::Layer;
use crate::scheduler::{Mountspec, Scheduler};

use super::job;
use super::log::JobLog;
use super::share::FileShare;
use super::stage::StagingDir;
use super::BuildError;

/// How long to wait for job output to drain once the job has exited.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct LayerBuilderConfig {
  /// Root that input paths are relative to.
  pub workspace: PathBuf,
  /// Directory for per-layer job logs.
  pub log_dir: PathBuf,
  /// Parent of staging directories, the system temp dir if unset.
  pub staging_root: Option<PathBuf>,
  /// Binary copied into each job to package the layer.
  pub builder_bin: PathBuf,
  /// Exported to jobs as `FLYNN_VERSION`.
  pub version: String,
  /// Root filesystem for layers with no image to build with.
  pub base_layer: Option<Mountspec>,
}

/// Builds layers that miss the cache as scheduler jobs.
pub struct LayerBuilder {
  config: LayerBuilderConfig,
  cache: Arc<LayerCache>,
  scheduler: Arc<dyn Scheduler>,
  share: Arc<dyn FileShare>,
}

impl LayerBuilder {
  pub fn new(
    config: LayerBuilderConfig,
    cache: Arc<LayerCache>,
    scheduler: Arc<dyn Scheduler>,
    share: Arc<dyn FileShare>,
  ) -> Self {
    Self {
      config,
      cache,
      scheduler,
      share,
    }
  }

  pub fn cache(&self) -> &LayerCache {
    &self.cache
  }

  /// Return the cached layer `id`, building it first if needed.
  ///
  /// `artifact` is the image whose rootfs the job runs in. The staging
  /// directory and its share are torn down before this returns, and the
  /// cache only sees the layer once the job has succeeded.
  pub async fn build(
    &self,
    layer: &Layer,
    id: &str,
    resolved: &ResolvedLayer,
    artifact: Option<&Artifact>,
  ) -> Result<ImageLayer, BuildError> {
    let name = resolved.name.as_str();
    if let Some(cached) = self.cache.get(name, id).await? {
      return Ok(cached);
    }

    let mountspecs = job::mountspecs(name, artifact, self.config.base_layer.as_ref())?;
    let staging = self.stage(resolved).await?;
    let shared = self.share.share(staging.path()).await.map_err(BuildError::Share)?;
    let (job, stdin) = job::build_job(layer, resolved, &self.config.version, shared.mount(), mountspecs)?;
    let log = JobLog::create(&self.config.log_dir, name).await?;

    info!(layer.name = %name, layer.id = %id, job = %job.id, "building layer");
    let handle = self.scheduler.submit(&job, Some(stdin)).await.inspect_err(|e| {
      error!(layer.name = %name, err = %e, "error running the build job");
    })?;
    let output = self.scheduler.stream(&handle).await?;
    let mut pump = tokio::spawn(log.pump(output));

    let status = self.scheduler.wait(&handle).await;
    match tokio::time::timeout(LOG_DRAIN_TIMEOUT, &mut pump).await {
      Ok(Ok(Ok(()))) => {}
      Ok(Ok(Err(e))) => warn!(layer.name = %name, err = %e, "error writing build log"),
      Ok(Err(e)) => warn!(layer.name = %name, err = %e, "build log task failed"),
      Err(_) => {
        warn!(layer.name = %name, "timed out waiting for build output");
        pump.abort();
      }
    }

    let code = status.inspect_err(|e| error!(layer.name = %name, err = %e, "error running the build job"))?;
    if code != 0 {
      error!(layer.name = %name, code, "build job failed");
      return Err(BuildError::JobFailed {
        name: name.to_string(),
        code,
      });
    }
    drop(shared);

    let output = staging.layer_output();
    tokio::fs::metadata(&output).await.map_err(|source| BuildError::Ingest {
      name: name.to_string(),
      source,
    })?;
    let record = self.cache.insert(id, &output).await?;
    Ok(record)
  }

  async fn stage(&self, resolved: &ResolvedLayer) -> Result<StagingDir, BuildError> {
    let root = self.config.staging_root.clone();
    let workspace = self.config.workspace.clone();
    let builder_bin = self.config.builder_bin.clone();
    let inputs = resolved.inputs.clone();

    tokio::task::spawn_blocking(move || {
      let staging = StagingDir::new(root.as_deref())?;
      staging.stage_inputs(&workspace, &inputs)?;
      staging.install_builder(&builder_bin)?;
      Ok(staging)
    })
    .await?
  }
}
