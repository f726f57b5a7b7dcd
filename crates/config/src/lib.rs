//! Configuration module for Stream Super Daemon
//!
//! Handles loading daemon configuration from TOML files with environment
//! variable overrides, and loading/validating per-channel job specifications.

pub mod config;
pub mod spec;

pub use config::*;
pub use spec::*;
