//! Configuration file structures for jsbridge.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`HostConfig`]: Which host bindings are installed
//! - [`PreloadEntry`]: Script evaluated into every new environment

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.engine]
/// max_heap_mb = 64
/// stack_trace_limit = 20
///
/// [runtime.execution]
/// timeout_ms = 1000
///
/// [host]
/// console = true
/// sleep = false
///
/// [[preload]]
/// path = "./lib/prelude.js"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration (engine + execution settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Host binding configuration.
    #[serde(default)]
    pub host: HostConfig,

    /// Scripts to evaluate into every environment before user code.
    #[serde(default)]
    pub preload: Vec<PreloadEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Host binding configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// Install the `console` object.
    #[serde(default = "defaults::console")]
    pub console: bool,

    /// Install the blocking `sleep(ms)` function.
    #[serde(default)]
    pub sleep: bool,

    /// Keep console output in memory in addition to logging it.
    #[serde(default)]
    pub capture_logs: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            console: defaults::console(),
            sleep: false,
            capture_logs: false,
        }
    }
}

/// A script to preload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreloadEntry {
    /// Path to the script file. Also used as its script name.
    pub path: String,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub const fn console() -> bool {
        true
    }
}
