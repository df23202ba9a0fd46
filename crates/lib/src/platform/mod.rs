//! Host environment lookups.

pub mod paths;

pub use paths::{cache_dir, external_ip, host_url};
