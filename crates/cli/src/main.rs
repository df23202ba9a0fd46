mod cmd;
mod output;

use std::fs::File;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use cmd::{BuildArgs, ExportArgs, RunArgs, cmd_build, cmd_export, cmd_run};

/// flynn-builder - reproducible, content-addressed image builds
#[derive(Parser)]
#[command(name = "flynn-builder")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build every image in the manifest
  Build(BuildArgs),

  /// Run a command, then package the root filesystem as a squashfs layer
  Run(RunArgs),

  /// Stage the built images, layers and manifests as TUF repository targets
  Export(ExportArgs),
}

/// Install the stderr logger and, when `debug_log` is set, a debug-level file logger.
fn init_logging(verbose: bool, debug_log: Option<&Path>) -> Result<()> {
  let default_level = if verbose { "debug" } else { "info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false).with_filter(filter);

  let file = match debug_log {
    Some(path) => {
      if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
      }
      let file = File::create(path).with_context(|| format!("Failed to create log file {}", path.display()))?;
      Some(
        fmt::layer()
          .with_ansi(false)
          .with_writer(Mutex::new(file))
          .with_filter(LevelFilter::DEBUG),
      )
    }
    None => None,
  };

  tracing_subscriber::registry().with(stderr).with(file).init();
  Ok(())
}

fn main() -> Result<ExitCode> {
  let cli = Cli::parse();

  match cli.command {
    Commands::Build(args) => {
      let debug_log = args.debug_log_path()?;
      init_logging(cli.verbose, Some(&debug_log))?;
      cmd_build(args)?;
      Ok(ExitCode::SUCCESS)
    }
    Commands::Run(args) => {
      init_logging(cli.verbose, None)?;
      cmd_run(args)
    }
    Commands::Export(args) => {
      init_logging(cli.verbose, None)?;
      cmd_export(args)?;
      Ok(ExitCode::SUCCESS)
    }
  }
}
