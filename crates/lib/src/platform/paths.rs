//! Locations and addresses taken from the process environment.
//!
//! - `LAYER_CACHE_DIR`: local layer cache, default `/var/lib/flynn/layer-cache`
//! - `EXTERNAL_IP`: address build jobs reach the 9P server on, default `127.0.0.1`
//! - `FLYNN_HOST_URL`: host API the build jobs are submitted to

use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::consts::{DEFAULT_CACHE_DIR, DEFAULT_EXTERNAL_IP, DEFAULT_HOST_URL};

pub const CACHE_DIR_ENV: &str = "LAYER_CACHE_DIR";
pub const EXTERNAL_IP_ENV: &str = "EXTERNAL_IP";
pub const HOST_URL_ENV: &str = "FLYNN_HOST_URL";

#[derive(Debug, Error)]
#[error("invalid {var} {value:?}: {source}")]
pub struct EnvError {
  pub var: &'static str,
  pub value: String,
  #[source]
  pub source: std::net::AddrParseError,
}

fn non_empty_var(name: &str) -> Option<String> {
  std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Returns the local layer cache directory
pub fn cache_dir() -> PathBuf {
  non_empty_var(CACHE_DIR_ENV)
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR))
}

/// Returns the IP the 9P server binds to
pub fn external_ip() -> Result<IpAddr, EnvError> {
  let value = non_empty_var(EXTERNAL_IP_ENV).unwrap_or_else(|| DEFAULT_EXTERNAL_IP.to_string());
  value.parse().map_err(|source| EnvError {
    var: EXTERNAL_IP_ENV,
    value,
    source,
  })
}

/// Returns the base URL of the host API
pub fn host_url() -> String {
  non_empty_var(HOST_URL_ENV).unwrap_or_else(|| DEFAULT_HOST_URL.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn defaults_when_unset() {
    temp_env::with_vars(
      [
        (CACHE_DIR_ENV, None::<&str>),
        (EXTERNAL_IP_ENV, None::<&str>),
        (HOST_URL_ENV, None::<&str>),
      ],
      || {
        assert_eq!(cache_dir(), PathBuf::from("/var/lib/flynn/layer-cache"));
        assert_eq!(external_ip().unwrap().to_string(), "127.0.0.1");
        assert_eq!(host_url(), "http://192.0.2.100:1113");
      },
    );
  }

  #[test]
  #[serial]
  fn environment_overrides() {
    temp_env::with_vars(
      [
        (CACHE_DIR_ENV, Some("/tmp/layers")),
        (EXTERNAL_IP_ENV, Some("10.0.0.5")),
        (HOST_URL_ENV, Some("http://host:1113")),
      ],
      || {
        assert_eq!(cache_dir(), PathBuf::from("/tmp/layers"));
        assert_eq!(external_ip().unwrap().to_string(), "10.0.0.5");
        assert_eq!(host_url(), "http://host:1113");
      },
    );
  }

  #[test]
  #[serial]
  fn empty_values_fall_back_to_defaults() {
    temp_env::with_var(CACHE_DIR_ENV, Some(""), || {
      assert_eq!(cache_dir(), PathBuf::from("/var/lib/flynn/layer-cache"));
    });
  }

  #[test]
  #[serial]
  fn invalid_external_ip() {
    temp_env::with_var(EXTERNAL_IP_ENV, Some("not-an-ip"), || {
      let err = external_ip().unwrap_err();
      assert_eq!(err.var, "EXTERNAL_IP");
      assert_eq!(err.value, "not-an-ip");
    });
  }
}
