//! Implementation of the `flynn-builder export` command.
//!
//! Stages the images, layers, manifests and binaries of the last build as
//! targets of a TUF repository.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;
use serde::Serialize;

use flynn_builder_lib::consts::{DEFAULT_BUILD_DIR, DEFAULT_MANIFEST_PATH, DEFAULT_VERSION};
use flynn_builder_lib::export::{ExportConfig, Exporter};
use flynn_builder_lib::manifest;
use flynn_builder_lib::platform::{self, paths};

use crate::output::{OutputFormat, print_json, print_stat, print_success};

#[derive(Args, Debug)]
pub struct ExportArgs {
  /// TUF repository directory
  pub tuf_dir: PathBuf,

  /// Version the manifests and binaries are filed under
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

  /// Public repository URL (default: the manifest's tuf.repository)
  #[arg(long)]
  pub repository: Option<String>,

  /// Output format
  #[arg(short = 'o', long, value_enum, default_value = "text")]
  pub output: OutputFormat,
}

#[derive(Serialize)]
struct ExportSummary {
  images: Vec<String>,
  layers: usize,
  files: usize,
  skipped: usize,
  staged: PathBuf,
}

/// Execute the export command.
pub fn cmd_export(args: ExportArgs) -> Result<()> {
  let workspace = match &args.workspace {
    Some(dir) => dir.clone(),
    None => std::env::current_dir().context("Failed to determine current directory")?,
  };

  let repository = match &args.repository {
    Some(url) => url.clone(),
    None => {
      let manifest = manifest::load(&workspace.join(&args.manifest)).context("Failed to load manifest")?;
      manifest.tuf.repository
    }
  };
  if repository.is_empty() {
    bail!("no TUF repository configured; set tuf.repository or pass --repository");
  }

  let config = ExportConfig {
    build_dir: workspace.join(DEFAULT_BUILD_DIR),
    cache_dir: args.cache_dir.clone().unwrap_or_else(platform::cache_dir),
    repository,
    version: args.flynn_version.clone(),
  };
  let exporter = Exporter::new(&args.tuf_dir, config).context("Failed to open TUF repository")?;
  let staged = exporter.staged_dir();
  let report = exporter.export().context("Export failed")?;

  if args.output.is_json() {
    print_json(&ExportSummary {
      images: report.images,
      layers: report.layers,
      files: report.files,
      skipped: report.skipped,
      staged,
    })?;
  } else {
    println!();
    print_success("Export complete!");
    print_stat("Images exported", &report.images.len().to_string());
    print_stat("Images already present", &report.skipped.to_string());
    print_stat("Layers exported", &report.layers.to_string());
    print_stat("Files exported", &report.files.to_string());
    print_stat("Staged in", &staged.display().to_string());
  }

  Ok(())
}
