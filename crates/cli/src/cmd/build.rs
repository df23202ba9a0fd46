//! Implementation of the `flynn-builder build` command.
//!
//! Loads the manifest, builds every image on the cluster, then writes the
//! deployment manifests and `build/images.json`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use tracing::info;

use flynn_builder_lib::build::FileShare;
use flynn_builder_lib::cache::{HttpTufClient, TufClient};
use flynn_builder_lib::consts::{DEFAULT_BUILD_DIR, DEFAULT_MANIFEST_PATH, DEFAULT_VERSION};
use flynn_builder_lib::execute::{BuildConfig, Builder};
use flynn_builder_lib::manifest;
use flynn_builder_lib::platform::{self, paths};
use flynn_builder_lib::scheduler::HostClient;

use crate::output::{OutputFormat, print_json, print_stat, print_success, truncate_hash};

#[derive(Args, Debug)]
pub struct BuildArgs {
  /// Version recorded in every build job's FLYNN_VERSION
  #[arg(short = 'x', long = "version", default_value = DEFAULT_VERSION)]
  pub flynn_version: String,

  /// Manifest path, relative to the workspace
  #[arg(long, default_value = DEFAULT_MANIFEST_PATH)]
  pub manifest: PathBuf,

  /// Workspace root (default: current directory)
  #[arg(long)]
  pub workspace: Option<PathBuf>,

  /// Local layer cache directory
  #[arg(long, env = paths::CACHE_DIR_ENV)]
  pub cache_dir: Option<PathBuf>,

  /// Host API URL of the cluster that runs build jobs
  #[arg(long, env = paths::HOST_URL_ENV)]
  pub host: Option<String>,

  /// Maximum number of images to build at once (default: unbounded)
  #[arg(short, long)]
  pub jobs: Option<usize>,

  /// Parent directory for staging directories (default: system temp dir)
  #[arg(long)]
  pub tmp_dir: Option<PathBuf>,

  /// Output format
  #[arg(short = 'o', long, value_enum, default_value = "text")]
  pub output: OutputFormat,
}

impl BuildArgs {
  fn workspace(&self) -> Result<PathBuf> {
    match &self.workspace {
      Some(dir) => Ok(dir.clone()),
      None => std::env::current_dir().context("Failed to determine current directory"),
    }
  }

  fn build_dir(&self) -> Result<PathBuf> {
    Ok(self.workspace()?.join(DEFAULT_BUILD_DIR))
  }

  /// `build/log/build-<unix nanos>.log`
  pub fn debug_log_path(&self) -> Result<PathBuf> {
    let nanos = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_nanos())
      .unwrap_or_default();
    Ok(self.build_dir()?.join("log").join(format!("build-{nanos}.log")))
  }
}

#[derive(Serialize)]
struct BuildSummary {
  built: Vec<String>,
  duration_ms: u128,
  images: PathBuf,
  manifest_ids: Vec<(String, String)>,
}

#[cfg(target_os = "linux")]
fn file_share() -> Result<Arc<dyn FileShare>> {
  use flynn_builder_lib::build::ninep::NinePShare;

  let ip = platform::external_ip()?;
  Ok(Arc::new(NinePShare::new(ip)))
}

#[cfg(not(target_os = "linux"))]
fn file_share() -> Result<Arc<dyn FileShare>> {
  anyhow::bail!("serving build inputs over 9P requires Linux")
}

/// Execute the build command.
pub fn cmd_build(args: BuildArgs) -> Result<()> {
  let workspace = args.workspace()?;
  let manifest_path = workspace.join(&args.manifest);
  let manifest = manifest::load(&manifest_path).context("Failed to load manifest")?;

  let host_url = args.host.clone().unwrap_or_else(platform::host_url);
  let remote: Option<Arc<dyn TufClient>> = if manifest.tuf.repository.is_empty() {
    None
  } else {
    Some(Arc::new(HttpTufClient::new(&manifest.tuf.repository)))
  };

  let config = BuildConfig {
    build_dir: args.build_dir()?,
    workspace,
    cache_dir: args.cache_dir.clone().unwrap_or_else(platform::cache_dir),
    staging_root: args.tmp_dir.clone(),
    builder_bin: std::env::current_exe().context("Failed to locate the running executable")?,
    version: args.flynn_version.clone(),
    parallelism: args.jobs,
  };
  info!(manifest = %manifest_path.display(), host = %host_url, cache = %config.cache_dir.display(), "starting build");
  let images_path = config.build_dir.join("images.json");

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let (report, artifacts) = rt
    .block_on(async {
      let scheduler = Arc::new(HostClient::new(&host_url));
      let builder = Builder::new(config, manifest, scheduler, file_share()?, remote)?;
      let report = builder.run().await?;
      anyhow::Ok((report, builder.artifacts().await))
    })
    .context("Build failed")?;

  let manifest_ids: Vec<(String, String)> = artifacts
    .iter()
    .map(|(id, artifact)| (id.clone(), artifact.manifest_id().unwrap_or_default().to_string()))
    .collect();

  if args.output.is_json() {
    print_json(&BuildSummary {
      built: report.built,
      duration_ms: report.duration.as_millis(),
      images: images_path,
      manifest_ids,
    })?;
  } else {
    println!();
    print_success("Build complete!");
    print_stat("Images built", &report.built.len().to_string());
    print_stat("Duration", &crate::output::format_duration(report.duration));
    print_stat("Images file", &images_path.display().to_string());
    for (id, manifest_id) in &manifest_ids {
      print_stat(id, truncate_hash(manifest_id));
    }
  }

  Ok(())
}
