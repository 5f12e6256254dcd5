//! Core V8 embedding layer for jsbridge.
//!
//! This crate exposes a JavaScript engine to host code through handles:
//! - [`Engine`]: An isolated engine instance running on its own thread
//! - [`Environment`]: A global scope inside an engine
//! - [`Value`]: A persistent handle to a script value
//! - [`Loc`]: Script location passed to raw-mode callbacks
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Engine                           │
//! │  (Dedicated thread owning the isolate)                  │
//! │  - Serialized job queue                                 │
//! │  - Termination of the running job                       │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                     Environment                         │
//! │  (Context + callback tables, many per engine)           │
//! │  - JSON-mode and raw-mode callbacks                     │
//! │  - Registry entry resolved by trampolines               │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Value                            │
//! │  (Id into the environment's native reference table)     │
//! │  - Released explicitly or on last drop                  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Recoverable failures are reported as [`BridgeError`]. Contract violations,
//! such as using a released value or mixing values of different
//! environments, panic on the thread that requested the operation.

mod bridge;
mod context;
mod engine;
mod exception;
mod id;
mod native;
mod platform;
mod registry;
mod value;

pub use bridge::{JsonFunction, Loc, RawFunction};
pub use context::Environment;
pub use engine::Engine;
pub use id::{EngineId, EnvId, ValueId};
pub use value::{Value, ValueKind};

pub use jsbridge_common::{BridgeError, HostError, ScriptException};
