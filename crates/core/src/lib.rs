//! Core library for the rockcraft build lifecycle
//!
//! This crate contains the lifecycle orchestration around a generic step engine:
//! base image resolution, run-scoped environment hooks (apt configuration clone,
//! overlay package upgrade), scoped mounts, prime pruning against the base layer,
//! logging, settings, and error handling.

pub mod config;
pub mod environment;
pub mod errors;
pub mod hooks;
pub mod image;
pub mod layers;
pub mod lifecycle;
pub mod logging;
pub mod mount;
pub mod overlay;
pub mod process;
pub mod step;
pub mod usrmerge;

// Re-export IndexMap for use by dependent crates (manager arguments are ordered)
pub use indexmap::IndexMap;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
