//! Implementation of the `flynn-builder run` command.
//!
//! This is what a layer build job executes inside its container: the layer's
//! commands arrive on stdin for `bash -exs`, and once they succeed the root
//! filesystem is packaged into the staging directory's output slot.

use std::path::PathBuf;
use std::process::{Command, ExitCode, ExitStatus};

use anyhow::{Context, Result};
use clap::Args;
use tracing::{debug, error};

/// Paths under the root that are never packaged.
const EXCLUDED_PATHS: &[&str] = &["mnt", "proc", "sys", "dev", "tmp"];

#[derive(Args, Debug)]
pub struct RunArgs {
  /// Where to write the squashfs layer
  #[arg(long, default_value = "/mnt/out/layer.squashfs")]
  pub out: PathBuf,

  /// Root directory to package
  #[arg(long, default_value = "/")]
  pub root: PathBuf,

  /// Command to run, with its arguments
  #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
  pub command: Vec<String>,
}

fn exit_code(status: ExitStatus) -> ExitCode {
  match status.code() {
    Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
    None => ExitCode::FAILURE,
  }
}

fn mksquashfs_args(args: &RunArgs) -> Vec<String> {
  let mut argv = vec![
    args.root.display().to_string(),
    args.out.display().to_string(),
    "-noappend".to_string(),
    "-all-root".to_string(),
    "-e".to_string(),
  ];
  argv.extend(EXCLUDED_PATHS.iter().map(|p| p.to_string()));
  argv
}

/// Execute the run command, returning the process exit status.
pub fn cmd_run(args: RunArgs) -> Result<ExitCode> {
  let (program, rest) = args.command.split_first().context("No command given")?;

  debug!(command = ?args.command, "running build command");
  let status = Command::new(program)
    .args(rest)
    .status()
    .with_context(|| format!("Failed to run {program}"))?;
  if !status.success() {
    error!(command = %program, %status, "build command failed");
    return Ok(exit_code(status));
  }

  debug!(root = %args.root.display(), out = %args.out.display(), "creating squashfs layer");
  let status = Command::new("mksquashfs")
    .args(mksquashfs_args(&args))
    .status()
    .context("Failed to run mksquashfs")?;
  if !status.success() {
    error!(%status, "mksquashfs failed");
    return Ok(exit_code(status));
  }

  Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mksquashfs_excludes_virtual_filesystems() {
    let args = RunArgs {
      out: PathBuf::from("/mnt/out/layer.squashfs"),
      root: PathBuf::from("/"),
      command: vec!["bash".to_string(), "-exs".to_string()],
    };
    assert_eq!(
      mksquashfs_args(&args),
      vec!["/", "/mnt/out/layer.squashfs", "-noappend", "-all-root", "-e", "mnt", "proc", "sys", "dev", "tmp"]
    );
  }
}
