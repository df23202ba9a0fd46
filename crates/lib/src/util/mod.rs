//! Shared utilities.
//!
//! Hashing, canonical JSON encoding and size formatting used across the crate.

pub mod canonical;
pub mod hash;
pub mod size;
