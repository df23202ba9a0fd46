//! Image manifests, layer records and artifacts.
//!
//! An image is an ordered list of squashfs layers. Its manifest is encoded as
//! canonical JSON and the SHA-512/256 of those bytes is the manifest ID. An
//! artifact wraps the manifest bytes together with the repository URI from
//! which the image can be pulled.

mod types;

pub use types::*;
