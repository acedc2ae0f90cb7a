#![forbid(unsafe_code)]
//! Broken Fuse public API facade.
//!
//! Re-exports the core filesystem surface and the mount entrypoints
//! through one crate for downstream consumers (CLI, harness).

pub use bf_core::*;
pub use bf_fuse::{mount, mount_background, MountOptions};
