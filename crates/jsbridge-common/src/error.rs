//! Error types for jsbridge.
//!
//! This module defines the error hierarchy using `thiserror`:
//! - [`BridgeError`]: Recoverable results of engine, environment and value operations
//! - [`ScriptException`]: A script exception translated into host-readable form
//! - [`HostError`]: Failures raised by host callbacks and rethrown into script
//!
//! Contract violations (using a released value, returning a value from a
//! different environment) are not represented here: they panic.

use std::fmt;

use thiserror::Error;

/// Placeholder rendered instead of an empty script resource name.
pub const ANONYMOUS_SCRIPT: &str = "<anonymous>";

/// Recoverable errors.
///
/// A `BridgeError` never poisons the environment that produced it: the same
/// environment accepts further operations afterwards.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The source failed to compile.
    #[error("{0}")]
    Compile(ScriptException),

    /// Script threw during execution, or a host callback failure was not
    /// caught by script.
    #[error("{0}")]
    Exception(ScriptException),

    /// Execution was aborted by `terminate()`.
    #[error("Execution terminated")]
    Terminated,

    /// A value operation required a specific shape.
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// The required kind of value.
        expected: &'static str,
        /// The kind of value that was found.
        found: String,
    },

    /// A requested object field is absent or undefined.
    #[error("Field '{field}' is undefined")]
    FieldUndefined {
        /// Name of the field.
        field: String,
    },

    /// A teardown operation was repeated on a handle that is already gone.
    #[error("Stale handle: {what} has already been released")]
    StaleHandle {
        /// Which kind of handle was stale.
        what: &'static str,
    },

    /// A callback name cannot be bound as a global function.
    #[error("Invalid function name: {name:?}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// Interchange-format encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

impl BridgeError {
    /// Create a new `TypeMismatch` error.
    pub fn type_mismatch(expected: &'static str, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected,
            found: found.into(),
        }
    }

    /// Create a new `FieldUndefined` error.
    pub fn field_undefined(field: impl Into<String>) -> Self {
        Self::FieldUndefined {
            field: field.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if execution was aborted by a terminate request.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Returns `true` if this error came from script compilation or execution.
    pub fn is_script_error(&self) -> bool {
        matches!(self, Self::Compile(_) | Self::Exception(_))
    }

    /// The translated script exception, if any.
    pub fn exception(&self) -> Option<&ScriptException> {
        match self {
            Self::Compile(exception) | Self::Exception(exception) => Some(exception),
            _ => None,
        }
    }
}

/// A script exception translated across the boundary.
///
/// `message` holds the thrown value rendered as text. Thrown plain objects,
/// which would render as `[object Object]`, carry their JSON form instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptException {
    /// The thrown value rendered as text.
    pub message: String,

    /// Name of the script the exception originated in.
    pub resource_name: Option<String>,

    /// 1-based line number.
    pub line: Option<usize>,

    /// 0-based start column.
    pub column: Option<usize>,

    /// The offending source line.
    pub source_line: Option<String>,

    /// The engine's stack trace, when the thrown value carries one.
    pub stack_trace: Option<String>,
}

impl ScriptException {
    /// Create an exception carrying only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    /// The resource name as rendered in messages.
    pub fn script_name(&self) -> &str {
        match self.resource_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => ANONYMOUS_SCRIPT,
        }
    }
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uncaught exception: {}", self.message)?;

        if let Some(line) = self.line {
            write!(
                f,
                "\nat {}:{}:{}",
                self.script_name(),
                line,
                self.column.unwrap_or(0)
            )?;
            if let Some(source) = &self.source_line {
                write!(f, ":{source}")?;
            }
        }

        if let Some(stack) = &self.stack_trace {
            write!(f, "\nStack trace: {stack}")?;
        }

        Ok(())
    }
}

/// Failures raised by host callbacks.
///
/// The `Display` text becomes the `message` of the `Error` thrown at the
/// script call site. Host errors cross the boundary as plain text only.
#[derive(Error, Debug)]
pub enum HostError {
    /// The callback failed.
    #[error("{0}")]
    Failed(String),

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },

    /// A nested environment operation failed.
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl HostError {
    /// Create a new `Failed` error.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::type_mismatch("object", "number");
        assert_eq!(err.to_string(), "Type mismatch: expected object, found number");

        let err = BridgeError::Terminated;
        assert_eq!(err.to_string(), "Execution terminated");

        let err = BridgeError::field_undefined("a");
        assert_eq!(err.to_string(), "Field 'a' is undefined");
    }

    #[test]
    fn test_exception_display_full() {
        let exception = ScriptException {
            message: "SyntaxError: Unexpected token '('".into(),
            resource_name: Some("my_file.js".into()),
            line: Some(3),
            column: Some(10),
            source_line: Some("\t\tfunction(asdf) {".into()),
            stack_trace: None,
        };

        let text = BridgeError::Compile(exception).to_string();
        assert!(text.starts_with("Uncaught exception: SyntaxError"));
        assert!(text.contains("my_file.js:3:10"));
        assert!(text.contains("function(asdf)"));
        assert!(!text.contains("Stack trace"));
    }

    #[test]
    fn test_exception_display_without_file() {
        let exception = ScriptException {
            message: "badness".into(),
            resource_name: Some(String::new()),
            line: Some(1),
            column: Some(0),
            source_line: None,
            stack_trace: Some("Error: badness\n    at <anonymous>:1:7".into()),
        };

        let text = exception.to_string();
        assert!(text.contains("at <anonymous>:1:0"));
        assert!(!text.contains("at :1"));
        assert!(text.contains("Stack trace: Error: badness"));
    }

    #[test]
    fn test_exception_message_only() {
        let exception = ScriptException::new("boom");
        assert_eq!(exception.to_string(), "Uncaught exception: boom");
        assert_eq!(exception.script_name(), ANONYMOUS_SCRIPT);
    }

    #[test]
    fn test_error_classification() {
        assert!(BridgeError::Terminated.is_terminated());
        assert!(!BridgeError::Terminated.is_script_error());

        let err = BridgeError::Exception(ScriptException::new("x"));
        assert!(err.is_script_error());
        assert_eq!(err.exception().map(|e| e.message.as_str()), Some("x"));
        assert!(BridgeError::field_undefined("y").exception().is_none());
    }

    #[test]
    fn test_host_error_from_bridge() {
        let host_err: HostError = BridgeError::Terminated.into();
        assert!(matches!(host_err, HostError::Bridge(_)));
        assert_eq!(host_err.to_string(), "Execution terminated");

        assert_eq!(HostError::failed("diediedie").to_string(), "diediedie");
        assert_eq!(
            HostError::invalid_argument("ms must be a number").to_string(),
            "Invalid argument: ms must be a number"
        );
    }
}
