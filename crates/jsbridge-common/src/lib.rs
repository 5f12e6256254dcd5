//! Common types, errors, and configuration for jsbridge.
//!
//! This crate provides shared functionality used across the jsbridge workspace:
//! - Error types using `thiserror`, including the translated form of script
//!   exceptions
//! - Configuration structures for engine and execution settings
//! - The TOML configuration file read by the CLI

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{EngineConfig, ExecutionConfig, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError, HostConfig, PreloadEntry};
pub use error::{BridgeError, HostError, ScriptException};
