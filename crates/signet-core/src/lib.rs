//! Signet Core - configuration for the Signet code signing tool
//!
//! This crate provides configuration types, discovery of configuration
//! files, loading and validation.

pub mod config;
pub mod error;

pub use config::{Config, PackageConfig, SigningConfig, ToolConfig};
pub use error::{ConfigError, Result};
