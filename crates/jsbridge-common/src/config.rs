//! Configuration structures for jsbridge.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Per-engine settings (heap limits, stack capture, flags)
//! - [`ExecutionConfig`]: Per-operation limits (timeout)

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// It can be loaded from files (TOML, JSON) as part of a
/// [`ConfigFile`](crate::ConfigFile).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Engine configuration.
///
/// These settings are applied when an engine instance is created and cannot
/// be changed afterwards.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Initial heap size in megabytes. `0` keeps the engine default.
    #[serde(default)]
    pub initial_heap_mb: usize,

    /// Maximum heap size in megabytes. `0` keeps the engine default.
    #[serde(default)]
    pub max_heap_mb: usize,

    /// Number of stack frames captured for uncaught exceptions.
    #[serde(default = "defaults::stack_trace_limit")]
    pub stack_trace_limit: i32,

    /// Engine flags, e.g. `"--stack-size=2000"`.
    ///
    /// Flags are process-wide: only the flags of the first engine created in
    /// the process take effect.
    #[serde(default)]
    pub flags: Option<String>,

    /// Name prefix for engine threads.
    #[serde(default = "defaults::thread_name_prefix")]
    pub thread_name_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_heap_mb: 0,
            max_heap_mb: 0,
            stack_trace_limit: defaults::stack_trace_limit(),
            flags: None,
            thread_name_prefix: defaults::thread_name_prefix(),
        }
    }
}

impl EngineConfig {
    /// Heap limits in bytes as `(initial, max)`, if a maximum is configured.
    pub fn heap_limits(&self) -> Option<(usize, usize)> {
        if self.max_heap_mb == 0 {
            return None;
        }
        let initial = self.initial_heap_mb.min(self.max_heap_mb);
        Some((initial * 1024 * 1024, self.max_heap_mb * 1024 * 1024))
    }
}

/// Execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Execution timeout in milliseconds. `0` disables the timeout.
    ///
    /// When the timeout elapses the running script is terminated.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::timeout_ms(),
        }
    }
}

impl ExecutionConfig {
    /// Get the timeout as a `Duration`, if one is configured.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn stack_trace_limit() -> i32 {
        10
    }

    pub fn thread_name_prefix() -> String {
        "jsbridge-engine".to_string()
    }

    pub const fn timeout_ms() -> u64 {
        0
    }
}
