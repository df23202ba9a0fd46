use bytes::BytesMut;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use super::{Job, JobHandle, OutputLine, Scheduler, SchedulerError};

/// Longest log line accepted from a job, in bytes.
const MAX_LOG_LINE: usize = 64 * 1024;

/// Newline framing that drops lines over the length limit and keeps reading.
struct BoundedLines(LinesCodec);

impl BoundedLines {
  fn new(max_length: usize) -> Self {
    Self(LinesCodec::new_with_max_length(max_length))
  }
}

impl Decoder for BoundedLines {
  type Item = String;
  type Error = LinesCodecError;

  fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, LinesCodecError> {
    loop {
      match self.0.decode(buf) {
        Err(LinesCodecError::MaxLineLengthExceeded) => warn!("dropping over-long job log line"),
        other => return other,
      }
    }
  }

  fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, LinesCodecError> {
    loop {
      match self.0.decode_eof(buf) {
        Err(LinesCodecError::MaxLineLengthExceeded) => warn!("dropping over-long job log line"),
        other => return other,
      }
    }
  }
}

/// Request body for `PUT /host/jobs/{id}`.
#[derive(Debug, Serialize)]
struct AddJobRequest<'a> {
  job: &'a Job,
  #[serde(skip_serializing_if = "Option::is_none")]
  stdin: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum JobStatus {
  Starting,
  Running,
  Done,
  Crashed,
  Failed,
}

/// Response body for `GET /host/jobs/{id}/wait`.
#[derive(Debug, Deserialize)]
struct WaitResponse {
  status: JobStatus,
  #[serde(default)]
  exit_status: Option<i32>,
  #[serde(default)]
  error: Option<String>,
}

/// Scheduler backed by a cluster host's HTTP API.
#[derive(Debug, Clone)]
pub struct HostClient {
  base_url: String,
  client: reqwest::Client,
}

impl HostClient {
  pub fn new(base_url: &str) -> Self {
    Self {
      base_url: base_url.trim_end_matches('/').to_string(),
      client: reqwest::Client::new(),
    }
  }

  fn job_url(&self, id: &str) -> String {
    format!("{}/host/jobs/{}", self.base_url, id)
  }

  async fn get(&self, url: String) -> Result<reqwest::Response, SchedulerError> {
    let response = self
      .client
      .get(&url)
      .send()
      .await
      .map_err(|source| SchedulerError::Http { url: url.clone(), source })?;
    check_status(url, response).await
  }
}

async fn check_status(url: String, response: reqwest::Response) -> Result<reqwest::Response, SchedulerError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().await.unwrap_or_default();
  Err(SchedulerError::Status {
    url,
    status: status.as_u16(),
    body,
  })
}

#[async_trait::async_trait]
impl Scheduler for HostClient {
  async fn submit(&self, job: &Job, stdin: Option<String>) -> Result<JobHandle, SchedulerError> {
    let url = self.job_url(&job.id);
    debug!(job = %job.id, url = %url, "submitting job");

    let response = self
      .client
      .put(&url)
      .json(&AddJobRequest { job, stdin })
      .send()
      .await
      .map_err(|source| SchedulerError::Http { url: url.clone(), source })?;

    match check_status(url, response).await {
      Ok(_) => Ok(JobHandle { id: job.id.clone() }),
      Err(SchedulerError::Status { body, .. }) => Err(SchedulerError::StartFailed {
        job: job.id.clone(),
        message: body,
      }),
      Err(e) => Err(e),
    }
  }

  async fn stream(&self, handle: &JobHandle) -> Result<BoxStream<'static, Result<OutputLine, SchedulerError>>, SchedulerError> {
    let url = format!("{}/logs?follow=true", self.job_url(&handle.id));
    let response = self.get(url).await?;

    let bytes = response.bytes_stream().map(|chunk| chunk.map_err(std::io::Error::other));
    let lines = FramedRead::new(StreamReader::new(bytes), BoundedLines::new(MAX_LOG_LINE));

    Ok(
      lines
        .filter_map(|line| async move {
          match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(serde_json::from_str::<OutputLine>(&line).map_err(|e| SchedulerError::Output(e.to_string()))),
            Err(e) => Some(Err(SchedulerError::Output(e.to_string()))),
          }
        })
        .boxed(),
    )
  }

  async fn wait(&self, handle: &JobHandle) -> Result<i32, SchedulerError> {
    let url = format!("{}/wait", self.job_url(&handle.id));
    let response = self.get(url.clone()).await?;
    let wait: WaitResponse = response
      .json()
      .await
      .map_err(|source| SchedulerError::Http { url, source })?;

    match wait.status {
      JobStatus::Failed => Err(SchedulerError::StartFailed {
        job: handle.id.clone(),
        message: wait.error.unwrap_or_else(|| "job failed to start".to_string()),
      }),
      _ => Ok(wait.exit_status.unwrap_or(-1)),
    }
  }
}
