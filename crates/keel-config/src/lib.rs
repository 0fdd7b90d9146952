//! Configuration types and loaders for Keel.
//!
//! This crate owns the on-disk `keel.toml` schema so the host and any tools
//! share a single source of truth.

pub mod config;

pub use config::{KeelConfig, LoggingSection, ProjectSection, RuntimeSection};
