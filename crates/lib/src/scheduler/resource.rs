//! Job resource limits.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::util::size::parse_size;

use super::SchedulerError;

const GIB: i64 = 1 << 30;

pub const DEFAULT_MEMORY: i64 = GIB;
pub const DEFAULT_CPU: i64 = 1000;
pub const DEFAULT_MAX_FD: i64 = 10000;
pub const DEFAULT_TEMP_DISK: i64 = GIB;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
  Memory,
  Cpu,
  MaxFd,
  MaxProcs,
  TempDisk,
}

impl ResourceType {
  pub fn as_str(self) -> &'static str {
    match self {
      ResourceType::Memory => "memory",
      ResourceType::Cpu => "cpu",
      ResourceType::MaxFd => "max_fd",
      ResourceType::MaxProcs => "max_procs",
      ResourceType::TempDisk => "temp_disk",
    }
  }

  /// Whether limits of this type are byte sizes.
  fn is_size(self) -> bool {
    matches!(self, ResourceType::Memory | ResourceType::TempDisk)
  }
}

impl fmt::Display for ResourceType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ResourceType {
  type Err = SchedulerError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "memory" => Ok(ResourceType::Memory),
      "cpu" => Ok(ResourceType::Cpu),
      "max_fd" => Ok(ResourceType::MaxFd),
      "max_procs" => Ok(ResourceType::MaxProcs),
      "temp_disk" => Ok(ResourceType::TempDisk),
      other => Err(SchedulerError::UnknownResource(other.to_string())),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimit {
  pub limit: i64,
}

pub type Resources = BTreeMap<ResourceType, ResourceLimit>;

/// Default limits applied to every build job.
pub fn default_resources() -> Resources {
  BTreeMap::from([
    (ResourceType::Memory, ResourceLimit { limit: DEFAULT_MEMORY }),
    (ResourceType::Cpu, ResourceLimit { limit: DEFAULT_CPU }),
    (ResourceType::MaxFd, ResourceLimit { limit: DEFAULT_MAX_FD }),
    (ResourceType::TempDisk, ResourceLimit { limit: DEFAULT_TEMP_DISK }),
  ])
}

/// Parse a single limit value; sizes accept human units, others integers.
pub fn parse_limit(resource: ResourceType, value: &str) -> Result<i64, SchedulerError> {
  let invalid = || SchedulerError::InvalidLimit {
    resource: resource.to_string(),
    value: value.to_string(),
  };
  if resource.is_size() {
    parse_size(value).map_err(|_| invalid())
  } else {
    value.trim().parse().map_err(|_| invalid())
  }
}

/// Default resources overridden by a layer's `limits`.
pub fn resources_with_limits(limits: &BTreeMap<String, String>) -> Result<Resources, SchedulerError> {
  let mut resources = default_resources();
  for (name, value) in limits {
    let resource: ResourceType = name.parse()?;
    let limit = parse_limit(resource, value)?;
    resources.insert(resource, ResourceLimit { limit });
  }
  Ok(resources)
}
