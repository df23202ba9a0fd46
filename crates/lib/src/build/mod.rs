//! Layer build execution.
//!
//! A layer that misses the cache is built by a container job:
//! 1. Inputs are staged into a scratch directory (`stage`)
//! 2. The directory is exported to the job over 9P (`share`)
//! 3. A job spec is assembled and submitted (`job`)
//! 4. Job output is captured to `build/log/<name>.log` (`log`)
//! 5. The squashfs the job leaves in `out/` is ingested into the cache
//!
//! `id` computes the content address the cache is keyed by.

mod execute;
pub mod id;
pub mod job;
pub mod log;
#[cfg(target_os = "linux")]
pub mod ninep;
pub mod share;
pub mod stage;

use std::path::PathBuf;

use thiserror::Error;

use crate::cache::CacheError;
use crate::inputs::InputError;
use crate::scheduler::SchedulerError;

pub use execute::{LayerBuilder, LayerBuilderConfig};
pub use id::layer_id;
pub use share::{FileShare, SharedDir};

#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Input(#[from] InputError),

  #[error(transparent)]
  Cache(#[from] CacheError),

  #[error(transparent)]
  Scheduler(#[from] SchedulerError),

  #[error("failed to read input {path}: {source}")]
  ReadInput {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to stage {path}: {source}")]
  Stage {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to share staging directory: {0}")]
  Share(#[source] std::io::Error),

  #[error("failed to write build log {path}: {source}")]
  Log {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("layer {name} exited with status {code}")]
  JobFailed { name: String, code: i32 },

  #[error("failed to ingest layer {name}: {source}")]
  Ingest {
    name: String,
    #[source]
    source: std::io::Error,
  },

  #[error("no base layer configured for layer {0} without a build image")]
  NoBaseLayer(String),

  #[error("failed to encode {what}: {source}")]
  Encode {
    what: &'static str,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to decode {what}: {source}")]
  Decode {
    what: &'static str,
    #[source]
    source: serde_json::Error,
  },

  #[error("build task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}
