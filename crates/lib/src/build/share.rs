//! Exposing staging directories to build jobs.
//!
//! A job reaches its staging directory through a network filesystem mount at
//! `/mnt`. `FileShare` starts serving a directory and hands back the `Mount`
//! entry the job spec needs; dropping the `SharedDir` stops serving it.

use std::io;
use std::net::IpAddr;
use std::path::Path;

use crate::consts::CONTAINER_MOUNT_DIR;
use crate::scheduler::Mount;

#[async_trait::async_trait]
pub trait FileShare: Send + Sync {
  /// Start serving `dir`.
  async fn share(&self, dir: &Path) -> io::Result<Box<dyn SharedDir>>;
}

/// A directory being served. Serving stops on drop.
pub trait SharedDir: Send + Sync {
  /// Mount entry for the job that uses this directory.
  fn mount(&self) -> Mount;
}

/// 9P-over-TCP mount of a share listening on `ip:port`.
pub fn ninep_mount(ip: IpAddr, port: u16) -> Mount {
  Mount {
    location: CONTAINER_MOUNT_DIR.to_string(),
    target: ip.to_string(),
    device: "9p".to_string(),
    data: format!("trans=tcp,port={port}"),
    writeable: true,
  }
}
