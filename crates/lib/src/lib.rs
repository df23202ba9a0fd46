//! flynn-builder-lib: reproducible, content-addressed image builds.
//!
//! This crate provides the pieces of the Flynn image builder:
//! - `manifest`: the build manifest (images, layers, templates)
//! - `image`: image manifests, layer records and artifacts
//! - `inputs`: resolving a layer's commands, environment and input files
//! - `build`: layer identity, staging and execution on the cluster scheduler
//! - `cache`: the local and remote layer caches
//! - `execute`: building all images of a manifest in dependency order
//! - `export`: staging build output as TUF repository targets

pub mod build;
pub mod cache;
pub mod consts;
pub mod execute;
pub mod export;
pub mod image;
pub mod inputs;
pub mod manifest;
pub mod placeholder;
pub mod platform;
pub mod scheduler;
pub mod util;
