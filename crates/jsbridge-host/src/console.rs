//! Console host binding.
//!
//! Installs a `console` object whose methods forward to `tracing`. Each
//! method is a raw-mode callback, so the entry records the script location
//! that logged it. Entries can additionally be kept in memory.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use jsbridge_core::{BridgeError, EnvId, Environment, HostError, Loc, Value, ValueKind};

/// Log level of a console entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Lowercase level name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// A console call captured from script.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    /// Script location of the console call.
    pub location: Loc,
    pub timestamp: Instant,
}

/// Console methods and the level each one logs at.
const METHODS: [(&str, LogLevel); 5] = [
    ("debug", LogLevel::Debug),
    ("log", LogLevel::Info),
    ("info", LogLevel::Info),
    ("warn", LogLevel::Warn),
    ("error", LogLevel::Error),
];

/// Map a console method name to its level.
pub fn level_for_method(method: &str) -> Option<LogLevel> {
    METHODS
        .iter()
        .find(|(name, _)| *name == method)
        .map(|(_, level)| *level)
}

/// Host implementation of the `console` object.
///
/// Messages are always emitted via `tracing`. With capturing enabled they are
/// also stored for later retrieval through [`entries`](Self::entries).
#[derive(Clone)]
pub struct ConsoleHost {
    env_id: EnvId,
    capture: bool,
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl ConsoleHost {
    /// Install `console` as a global of `env`.
    ///
    /// # Errors
    ///
    /// Returns an error if the console object cannot be built.
    pub fn install(env: &Environment, capture: bool) -> Result<Self, BridgeError> {
        let host = Self {
            env_id: env.id(),
            capture,
            entries: Arc::default(),
        };

        let console = env.create_js("{}", "console")?;
        for (method, level) in METHODS {
            let sink = host.clone();
            let func = env.create_raw_func(move |from, args| {
                sink.record(level, from, &args)?;
                Ok(None)
            })?;
            console.set(method, &func)?;
        }

        let global = env.evaluate_raw("globalThis", "console")?;
        global.set("console", &console)?;

        debug!(env_id = %host.env_id, capture, "Console installed");
        Ok(host)
    }

    /// Log a message at the specified level.
    pub fn log(&self, level: LogLevel, location: Loc, message: &str) {
        let env_id = self.env_id.get();
        match level {
            LogLevel::Debug => debug!(env_id, script = %location, guest_log = true, "{}", message),
            LogLevel::Info => info!(env_id, script = %location, guest_log = true, "{}", message),
            LogLevel::Warn => warn!(env_id, script = %location, guest_log = true, "{}", message),
            LogLevel::Error => error!(env_id, script = %location, guest_log = true, "{}", message),
        }

        if self.capture {
            self.entries.lock().push(LogEntry {
                level,
                message: message.to_string(),
                location,
                timestamp: Instant::now(),
            });
        }
    }

    fn record(&self, level: LogLevel, from: Loc, args: &[Value]) -> Result<(), HostError> {
        let message = format_message(args)?;
        self.log(level, from, &message);
        Ok(())
    }

    /// Returns `true` if entries are kept in memory.
    pub fn is_capturing(&self) -> bool {
        self.capture
    }

    /// Snapshot of the captured entries.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Remove and return the captured entries.
    pub fn take_entries(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.entries.lock())
    }
}

impl std::fmt::Debug for ConsoleHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleHost")
            .field("env_id", &self.env_id)
            .field("capture", &self.capture)
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

/// Join console arguments into one line.
///
/// Strings are used as-is; everything else is rendered as JSON.
pub fn format_message(args: &[Value]) -> Result<String, BridgeError> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        let part = if arg.kind() == ValueKind::String {
            arg.to_string()?
        } else {
            arg.to_json()?
        };
        parts.push(part);
    }
    Ok(parts.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_captures_entries() {
        let env = Environment::new().unwrap();
        let console = ConsoleHost::install(&env, true).unwrap();

        env.evaluate("console.log('Hello', 1, {a: 2});\nconsole.error('World');", "app.js")
            .unwrap();

        let entries = console.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[0].message, r#"Hello 1 {"a":2}"#);
        assert_eq!(entries[0].location.filename, "app.js");
        assert_eq!(entries[0].location.line, 1);
        assert_eq!(entries[1].level, LogLevel::Error);
        assert_eq!(entries[1].message, "World");
        assert_eq!(entries[1].location.line, 2);

        env.destroy().unwrap();
    }

    #[test]
    fn test_console_without_capture() {
        let env = Environment::new().unwrap();
        let console = ConsoleHost::install(&env, false).unwrap();

        env.evaluate("console.warn('dropped')", "").unwrap();

        assert!(!console.is_capturing());
        assert!(console.entries().is_empty());
    }

    #[test]
    fn test_take_entries() {
        let env = Environment::new().unwrap();
        let console = ConsoleHost::install(&env, true).unwrap();

        env.evaluate("console.debug('one'); console.info('two')", "")
            .unwrap();

        let taken = console.take_entries();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].level, LogLevel::Debug);
        assert!(console.entries().is_empty());
    }

    #[test]
    fn test_console_methods_are_functions() {
        let env = Environment::new().unwrap();
        ConsoleHost::install(&env, false).unwrap();

        let kinds = env
            .evaluate(
                "['debug', 'log', 'info', 'warn', 'error'].map(m => typeof console[m])",
                "",
            )
            .unwrap();
        assert_eq!(
            kinds,
            serde_json::json!(["function", "function", "function", "function", "function"])
        );
    }

    #[test]
    fn test_level_for_method() {
        assert_eq!(level_for_method("debug"), Some(LogLevel::Debug));
        assert_eq!(level_for_method("log"), Some(LogLevel::Info));
        assert_eq!(level_for_method("info"), Some(LogLevel::Info));
        assert_eq!(level_for_method("warn"), Some(LogLevel::Warn));
        assert_eq!(level_for_method("error"), Some(LogLevel::Error));
        assert_eq!(level_for_method("trace"), None);
    }

    #[test]
    fn test_level_names() {
        assert_eq!(LogLevel::Warn.as_str(), "warn");
        assert_eq!(LogLevel::Error.as_str(), "error");
    }
}
