use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::resource::Resources;

pub const MOUNTSPEC_TYPE_SQUASHFS: &str = "squashfs";

/// Reference to a root filesystem layer the scheduler mounts for a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mountspec {
  #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
  pub spec_type: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub id: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub url: String,
  #[serde(default)]
  pub size: u64,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub hashes: BTreeMap<String, String>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub meta: BTreeMap<String, String>,
}

/// A filesystem mount made inside the job's container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
  pub location: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub target: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub device: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub data: String,
  #[serde(default)]
  pub writeable: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
  pub args: Vec<String>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  #[serde(default)]
  pub mounts: Vec<Mount>,
  #[serde(default)]
  pub stdin: bool,
  #[serde(default)]
  pub working_dir: String,
  #[serde(default)]
  pub host_network: bool,
  #[serde(default)]
  pub linux_capabilities: Vec<String>,
  /// The host keeps no log of its own; output is only streamed to the submitter.
  #[serde(default)]
  pub disable_log: bool,
}

/// A container job submitted to a cluster host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
  pub id: String,
  #[serde(default)]
  pub mountspecs: Vec<Mountspec>,
  #[serde(default)]
  pub metadata: BTreeMap<String, String>,
  pub config: ContainerConfig,
  #[serde(default)]
  pub resources: Resources,
}

/// Identifies a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
  pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
  Stdout,
  Stderr,
}

/// One line of job output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
  pub stream: OutputStream,
  pub data: String,
}
