//! Host bindings for jsbridge environments.
//!
//! This crate provides host-side functions that scripts can call, built on
//! the callback bridge of `jsbridge-core`.
//!
//! # Bindings
//!
//! - [`console`]: `console.debug/log/info/warn/error` forwarded to `tracing`
//! - [`sleep`]: Blocking `sleep(ms)`
//! - [`capabilities`]: Selection of which bindings an environment receives
//! - [`linker`]: Installation of bindings and preload scripts

pub mod capabilities;
pub mod console;
pub mod linker;
pub mod sleep;

pub use capabilities::Capabilities;
pub use console::{ConsoleHost, LogEntry, LogLevel};
pub use linker::{HostBindings, install_all, preload};
