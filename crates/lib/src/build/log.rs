//! Build job output capture.
//!
//! Every line a job writes to stdout or stderr is prefixed with a timestamp
//! and the layer name, echoed to the builder's stderr and appended to
//! `build/log/<name>.log`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::warn;

use crate::scheduler::{OutputLine, SchedulerError};

use super::BuildError;

pub struct JobLog {
  name: String,
  path: PathBuf,
  file: BufWriter<File>,
}

impl JobLog {
  /// Create (or truncate) the log for layer `name` in `dir`.
  pub async fn create(dir: &Path, name: &str) -> Result<Self, BuildError> {
    let log_err = |path: &Path| {
      let path = path.to_path_buf();
      move |source| BuildError::Log { path, source }
    };

    tokio::fs::create_dir_all(dir).await.map_err(log_err(dir))?;
    let path = dir.join(format!("{name}.log"));
    let file = File::create(&path).await.map_err(log_err(&path))?;
    Ok(Self {
      name: name.to_string(),
      path,
      file: BufWriter::new(file),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  async fn write(&mut self, data: &str) -> std::io::Result<()> {
    for line in data.lines() {
      let line = format_line(Local::now(), &self.name, line);
      eprintln!("{line}");
      self.file.write_all(line.as_bytes()).await?;
      self.file.write_all(b"\n").await?;
    }
    Ok(())
  }

  /// Copy `output` into the log until the stream ends.
  pub async fn pump(mut self, mut output: BoxStream<'static, Result<OutputLine, SchedulerError>>) -> Result<(), BuildError> {
    while let Some(line) = output.next().await {
      match line {
        Ok(line) => self.write(&line.data).await.map_err(|source| BuildError::Log {
          path: self.path.clone(),
          source,
        })?,
        Err(e) => {
          warn!(layer = %self.name, err = %e, "error reading job output");
          break;
        }
      }
    }
    self.file.flush().await.map_err(|source| BuildError::Log {
      path: self.path.clone(),
      source,
    })
  }
}

/// `HH:MM:SS.mmm: <name>: <line>`
pub fn format_line(at: DateTime<Local>, name: &str, line: &str) -> String {
  format!("{}: {}: {}", at.format("%H:%M:%S%.3f"), name, line)
}
