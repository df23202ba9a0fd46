//! Build job specs.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::consts::{BUILDER_BIN_NAME, CONTAINER_MOUNT_DIR};
use crate::image::Artifact;
use crate::inputs::ResolvedLayer;
use crate::manifest::Layer;
use crate::scheduler::{ContainerConfig, Job, MOUNTSPEC_TYPE_SQUASHFS, Mount, Mountspec, resource};

use super::BuildError;

/// Capabilities every build job gets.
pub const DEFAULT_CAPABILITIES: &[&str] = &[
  "CAP_CHOWN",
  "CAP_DAC_OVERRIDE",
  "CAP_FSETID",
  "CAP_FOWNER",
  "CAP_MKNOD",
  "CAP_NET_RAW",
  "CAP_SETGID",
  "CAP_SETUID",
  "CAP_SETFCAP",
  "CAP_SETPCAP",
  "CAP_NET_BIND_SERVICE",
  "CAP_SYS_CHROOT",
  "CAP_KILL",
  "CAP_AUDIT_WRITE",
];

pub const META_APP_NAME: &str = "flynn-controller.app_name";
pub const META_JOB_TYPE: &str = "flynn-controller.type";
const BUILDER_APP_NAME: &str = "builder";
const VERSION_ENV: &str = "FLYNN_VERSION";

/// Root filesystem for a job: the layers of `artifact`, or `base_layer` when
/// the layer has no image to build with.
pub fn mountspecs(
  name: &str,
  artifact: Option<&Artifact>,
  base_layer: Option<&Mountspec>,
) -> Result<Vec<Mountspec>, BuildError> {
  let Some(artifact) = artifact else {
    return base_layer
      .map(|base| vec![base.clone()])
      .ok_or_else(|| BuildError::NoBaseLayer(name.to_string()));
  };

  let manifest = artifact.manifest().map_err(|source| BuildError::Decode {
    what: "artifact manifest",
    source,
  })?;
  Ok(
    manifest
      .layers()
      .map(|layer| Mountspec {
        spec_type: MOUNTSPEC_TYPE_SQUASHFS.to_string(),
        id: layer.id.clone(),
        url: artifact.layer_url(layer),
        size: layer.length,
        hashes: layer.hashes.clone(),
        meta: artifact.meta.clone(),
      })
      .collect(),
  )
}

/// Default capabilities plus `extra`, without duplicates.
pub fn capabilities(extra: &[String]) -> Vec<String> {
  let mut caps: Vec<String> = DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect();
  for cap in extra {
    if !caps.contains(cap) {
      caps.push(cap.clone());
    }
  }
  caps
}

/// Assemble the job that runs `resolved`'s commands, returning it with the
/// stdin to feed it.
///
/// The commands run as `bash -exs` under `flynn-builder run`, which packages
/// the resulting root filesystem into `out/layer.squashfs`. `FLYNN_VERSION`
/// is set here rather than in the layer env so it does not affect the ID.
pub fn build_job(
  layer: &Layer,
  resolved: &ResolvedLayer,
  version: &str,
  mount: Mount,
  mountspecs: Vec<Mountspec>,
) -> Result<(Job, String), BuildError> {
  let mut env = resolved.env.clone();
  env.insert(VERSION_ENV.to_string(), version.to_string());

  let config = ContainerConfig {
    args: vec![
      format!("{CONTAINER_MOUNT_DIR}/bin/{BUILDER_BIN_NAME}"),
      "run".to_string(),
      "bash".to_string(),
      "-exs".to_string(),
    ],
    env,
    mounts: vec![mount],
    stdin: true,
    working_dir: format!("{CONTAINER_MOUNT_DIR}/src"),
    // Shares the host network namespace, so builds can observe host ports.
    host_network: true,
    linux_capabilities: capabilities(&layer.linux_capabilities),
    disable_log: true,
  };

  let job = Job {
    id: format!("builder-{}", Uuid::new_v4()),
    mountspecs,
    metadata: BTreeMap::from([
      (META_APP_NAME.to_string(), BUILDER_APP_NAME.to_string()),
      (META_JOB_TYPE.to_string(), resolved.name.clone()),
    ]),
    config,
    resources: resource::resources_with_limits(&layer.limits)?,
  };
  Ok((job, resolved.run.join("\n")))
}
