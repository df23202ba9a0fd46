//! Cluster scheduler interface.
//!
//! Layer builds run as container jobs on a cluster host. The `Scheduler`
//! trait is the seam between the build executor and the cluster:
//! - `submit`: start a job, optionally feeding it stdin
//! - `stream`: follow the job's output lines
//! - `wait`: block until the job exits and return its exit code
//!
//! `HostClient` implements it over the host's HTTP API.

mod host;
pub mod resource;
mod types;

use futures::stream::BoxStream;
use thiserror::Error;

pub use host::HostClient;
pub use resource::{ResourceLimit, ResourceType, Resources};
pub use types::*;

#[derive(Debug, Error)]
pub enum SchedulerError {
  #[error("failed to start job {job}: {message}")]
  StartFailed { job: String, message: String },

  #[error("request to {url} failed: {source}")]
  Http {
    url: String,
    #[source]
    source: reqwest::Error,
  },

  #[error("unexpected status {status} from {url}: {body}")]
  Status { url: String, status: u16, body: String },

  #[error("invalid job output: {0}")]
  Output(String),

  #[error("unknown resource type: {0}")]
  UnknownResource(String),

  #[error("invalid {resource} limit: {value:?}")]
  InvalidLimit { resource: String, value: String },
}

#[async_trait::async_trait]
pub trait Scheduler: Send + Sync {
  /// Submit `job` for execution, writing `stdin` to its standard input.
  async fn submit(&self, job: &Job, stdin: Option<String>) -> Result<JobHandle, SchedulerError>;

  /// Stream the job's output lines until it exits.
  async fn stream(&self, handle: &JobHandle) -> Result<BoxStream<'static, Result<OutputLine, SchedulerError>>, SchedulerError>;

  /// Wait for the job to exit and return its exit status.
  async fn wait(&self, handle: &JobHandle) -> Result<i32, SchedulerError>;
}
