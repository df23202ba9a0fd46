//! Layer input resolution.
//!
//! Turns a declared layer into the concrete values its identity is computed
//! from: the command list, the merged and interpolated environment, and the
//! ordered list of workspace files it reads.
//!
//! Commands and inputs are assembled in a fixed order:
//! 1. `run` commands as declared
//! 2. `script`, run as `bash -e <script>` and added as an input
//! 3. declared `inputs` glob matches
//! 4. `go_build` then `cgo_build`, directories in sorted order
//! 5. `copy`, sources in sorted order

pub mod constraint;
pub mod golang;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::consts::{DEFAULT_GOARCH, DEFAULT_GOOS};
use crate::manifest::{Image, Layer};
use crate::placeholder::{self, PlaceholderError};

use self::constraint::{BuildContext, ConstraintError};
use self::golang::GoWalker;

#[derive(Debug, Error)]
pub enum InputError {
  #[error("invalid input pattern {pattern:?}: {source}")]
  Pattern {
    pattern: String,
    #[source]
    source: glob::PatternError,
  },

  #[error("failed to expand input pattern {pattern:?}: {source}")]
  Glob {
    pattern: String,
    #[source]
    source: glob::GlobError,
  },

  #[error("go package {dir}: {message}")]
  GoPackage { dir: String, message: String },

  #[error("go import {import}: {message}")]
  GoImport { import: String, message: String },

  #[error(transparent)]
  Constraint(#[from] ConstraintError),

  #[error("env {key}: {source}")]
  Env {
    key: String,
    #[source]
    source: PlaceholderError,
  },

  #[error("input task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

/// A layer with its commands, environment and inputs made concrete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedLayer {
  pub name: String,
  pub run: Vec<String>,
  pub env: BTreeMap<String, String>,
  pub inputs: Vec<String>,
}

/// Resolves layers against a workspace.
///
/// Go walkers are shared per target platform for the life of the resolver,
/// so a package is scanned at most once per platform per build.
pub struct InputResolver {
  workspace: PathBuf,
  go_module: String,
  template_values: BTreeMap<String, String>,
  walkers: Mutex<HashMap<BuildContext, Arc<GoWalker>>>,
}

impl InputResolver {
  /// `template_values` are the names available to `{{ .Name }}` in env values.
  pub fn new(workspace: &Path, go_module: &str, template_values: BTreeMap<String, String>) -> Self {
    Self {
      workspace: workspace.to_path_buf(),
      go_module: go_module.to_string(),
      template_values,
      walkers: Mutex::new(HashMap::new()),
    }
  }

  pub async fn resolve(&self, image: &Image, layer: &Layer) -> Result<ResolvedLayer, InputError> {
    let mut run = layer.run.clone();
    let mut inputs = Vec::new();

    if let Some(script) = &layer.script {
      inputs.push(script.clone());
      run.push(format!("bash -e {script}"));
    }

    for pattern in &layer.inputs {
      inputs.extend(self.glob(pattern)?);
    }

    let mut env = image.env.clone();
    env.extend(layer.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    if layer.has_go_builds() {
      let walker = self.walker(&env);
      for (dir, out) in &layer.go_build {
        inputs.extend(walker.load(dir).await?);
        run.push(format!("go build -o {} {}", out, walker.import_path(dir)));
      }
      for (dir, out) in &layer.cgo_build {
        inputs.extend(walker.load(dir).await?);
        run.push(format!("cgo build -o {} {}", out, walker.import_path(dir)));
      }
    }

    for (src, dst) in &layer.copy {
      inputs.push(src.clone());
      run.push(format!("mkdir -p {} && cp {} {}", quote(&parent_dir(dst)), quote(src), quote(dst)));
    }

    let env = self.interpolate_env(env)?;

    Ok(ResolvedLayer {
      name: layer.name.clone(),
      run,
      env,
      inputs,
    })
  }

  /// Expand a workspace-relative glob into sorted workspace-relative paths.
  fn glob(&self, pattern: &str) -> Result<Vec<String>, InputError> {
    let root = glob::Pattern::escape(&self.workspace.to_string_lossy());
    let full = format!("{}/{}", root.trim_end_matches('/'), pattern);
    let entries = glob::glob(&full).map_err(|source| InputError::Pattern {
      pattern: pattern.to_string(),
      source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
      let path = entry.map_err(|source| InputError::Glob {
        pattern: pattern.to_string(),
        source,
      })?;
      let rel = path.strip_prefix(&self.workspace).unwrap_or(&path);
      paths.push(rel.to_string_lossy().into_owned());
    }
    Ok(paths)
  }

  fn walker(&self, env: &BTreeMap<String, String>) -> Arc<GoWalker> {
    let goos = env.get("GOOS").map(String::as_str).unwrap_or(DEFAULT_GOOS);
    let goarch = env.get("GOARCH").map(String::as_str).unwrap_or(DEFAULT_GOARCH);
    let cgo = env.get("CGO_ENABLED").is_none_or(|v| v != "0");
    let ctx = BuildContext::new(goos, goarch, cgo);

    let mut walkers = self.walkers.lock().unwrap_or_else(|e| e.into_inner());
    walkers
      .entry(ctx.clone())
      .or_insert_with(|| Arc::new(GoWalker::new(&self.workspace, &self.go_module, ctx)))
      .clone()
  }

  fn interpolate_env(&self, env: BTreeMap<String, String>) -> Result<BTreeMap<String, String>, InputError> {
    env
      .into_iter()
      .map(|(key, value)| match placeholder::substitute(&value, &self.template_values) {
        Ok(value) => Ok((key, value)),
        Err(source) => Err(InputError::Env { key, source }),
      })
      .collect()
  }
}

/// Directory part of a path, `.` when there is none.
fn parent_dir(path: &str) -> String {
  match Path::new(path).parent() {
    Some(parent) if parent.as_os_str().is_empty() => ".".to_string(),
    Some(parent) => parent.to_string_lossy().into_owned(),
    None => path.to_string(),
  }
}

/// Double-quote a path for the build shell.
fn quote(s: &str) -> String {
  format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}
