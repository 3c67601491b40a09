//! Core domain types for chain connection management.
//!
//! This crate provides:
//! - Connection status and observable state (`types` module)
//! - Chain properties and the shared registry (`registry` module)
//! - Connection tunables and chain group membership (`config` module)
//!
//! With the `persistence` feature enabled, configuration can be loaded from
//! and saved to a JSON file in the platform config directory.

pub mod config;
pub mod registry;
pub mod types;

pub use config::*;
pub use registry::*;
pub use types::*;
