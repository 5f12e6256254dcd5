//! Callback dispatch bridge.
//!
//! Every context gets two native trampolines installed as globals:
//! - `__jsbridge_call(envId, name, argsJson)` for JSON-mode callbacks
//! - `__jsbridge_call_raw(envId, name, argsArray)` for raw-mode callbacks
//!
//! Registering a callback evaluates a small script wrapper that forwards its
//! arguments to the matching trampoline. The trampoline resolves the
//! environment through the registry, looks up the host function by name and
//! invokes it while exposing the callback scope, so host code can re-enter
//! the same engine.
//!
//! Host panics never unwind through the engine. They are stashed, the
//! running script is terminated, and the panic resumes on the thread that
//! started the outermost operation.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;

use tracing::{error, trace, warn};

use jsbridge_common::{BridgeError, HostError};

use crate::context::EnvShared;
use crate::exception;
use crate::id::EnvId;
use crate::native;
use crate::registry;
use crate::value::Value;

/// Global name of the JSON-mode trampoline.
pub(crate) const JSON_TRAMPOLINE: &str = "__jsbridge_call";

/// Global name of the raw-mode trampoline.
pub(crate) const RAW_TRAMPOLINE: &str = "__jsbridge_call_raw";

/// A JSON-mode host callback.
///
/// Receives the call arguments decoded from JSON. `None` returns `undefined`
/// to script.
pub type JsonFunction =
    Arc<dyn Fn(Vec<serde_json::Value>) -> Option<serde_json::Value> + Send + Sync>;

/// A raw-mode host callback.
///
/// Receives the script caller's location and one [`Value`] per argument.
/// `Ok(None)` returns `undefined`; `Err` is thrown into script as an `Error`.
pub type RawFunction =
    Arc<dyn Fn(Loc, Vec<Value>) -> Result<Option<Value>, HostError> + Send + Sync>;

/// Location of the script code that invoked a raw callback.
///
/// Empty when the callback was invoked directly from the host, with no
/// script frame in between.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Loc {
    /// Name of the calling function. Empty at top level.
    pub funcname: String,
    /// Script name of the caller.
    pub filename: String,
    /// 1-based line number.
    pub line: usize,
    /// 1-based column number.
    pub column: usize,
}

impl Loc {
    /// Returns `true` if no script frame was available.
    pub fn is_empty(&self) -> bool {
        self.filename.is_empty() && self.line == 0
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.funcname.is_empty() {
            write!(f, "{}:{}:{}", self.filename, self.line, self.column)
        } else {
            write!(
                f,
                "{} ({}:{}:{})",
                self.funcname, self.filename, self.line, self.column
            )
        }
    }
}

// ============================================================================
// Wrapper generation
// ============================================================================

/// Check that `name` can be bound as a global function.
pub(crate) fn validate_name(name: &str) -> Result<(), BridgeError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');

    if valid_start && valid_rest {
        Ok(())
    } else {
        Err(BridgeError::InvalidName {
            name: name.to_owned(),
        })
    }
}

/// Script defining the global function `name` as a JSON-mode forwarder.
pub(crate) fn json_wrapper(env: EnvId, name: &str) -> String {
    format!(
        "function {name}() {{\n  return {JSON_TRAMPOLINE}({env}, \"{name}\", JSON.stringify(Array.prototype.slice.call(arguments)));\n}}"
    )
}

/// Script defining the global function `name` as a raw-mode forwarder.
pub(crate) fn raw_wrapper(env: EnvId, name: &str) -> String {
    format!(
        "function {name}() {{\n  return {RAW_TRAMPOLINE}({env}, \"{name}\", Array.prototype.slice.call(arguments));\n}}"
    )
}

/// Script evaluating to an anonymous raw-mode forwarder for `name`.
pub(crate) fn anonymous_raw_wrapper(env: EnvId, name: &str) -> Result<String, BridgeError> {
    let quoted = serde_json::to_string(name)?;
    Ok(format!(
        "(function() {{\n  return {RAW_TRAMPOLINE}({env}, {quoted}, Array.prototype.slice.call(arguments));\n}})"
    ))
}

/// Script name recorded for a callback registered at `origin`.
pub(crate) fn registration_tag(name: &str, origin: &std::panic::Location<'_>) -> String {
    format!(
        "native callback to {name} [{}:{}]",
        short_file(origin.file()),
        origin.line()
    )
}

pub(crate) fn short_file(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

// ============================================================================
// Trampolines
// ============================================================================

/// Install both trampolines on the global object of `context`.
pub(crate) fn install_trampolines(
    scope: &mut v8::HandleScope<'_>,
    context: v8::Local<'_, v8::Context>,
) -> bool {
    let global = context.global(scope);
    let attributes = || v8::PropertyAttribute::DONT_ENUM | v8::PropertyAttribute::READ_ONLY;

    let (Some(json_name), Some(raw_name)) = (
        v8::String::new(scope, JSON_TRAMPOLINE),
        v8::String::new(scope, RAW_TRAMPOLINE),
    ) else {
        return false;
    };
    let (Some(json_fn), Some(raw_fn)) = (
        v8::Function::new(scope, json_trampoline),
        v8::Function::new(scope, raw_trampoline),
    ) else {
        return false;
    };

    global
        .define_own_property(scope, json_name.into(), json_fn.into(), attributes())
        .unwrap_or(false)
        && global
            .define_own_property(scope, raw_name.into(), raw_fn.into(), attributes())
            .unwrap_or(false)
}

struct Dispatch {
    env: Arc<EnvShared>,
    name: String,
}

/// Resolve the environment and function name passed to a trampoline.
///
/// Throws into script and returns `None` if either cannot be resolved.
fn resolve(scope: &mut v8::HandleScope<'_>, args: &v8::FunctionCallbackArguments) -> Option<Dispatch> {
    let raw_id = args.get(0).uint32_value(scope).unwrap_or(0);
    let id = EnvId::from_raw(raw_id);
    let name = args.get(1).to_rust_string_lossy(scope);

    let env = registry::lookup(id)
        .filter(|env| native::is_engine_thread(env.engine().id()));
    let Some(env) = env else {
        exception::throw_error(scope, &format!("Unknown environment {raw_id} for callback {name}"));
        return None;
    };

    Some(Dispatch { env, name })
}

/// Invoke host code with the callback scope exposed for re-entry.
///
/// Returns `None` if the host code panicked. The panic is stashed and the
/// running script terminated.
fn invoke_host<R>(scope: &mut v8::HandleScope<'_>, host: impl FnOnce() -> R) -> Option<R> {
    match native::enter(scope, || panic::catch_unwind(AssertUnwindSafe(host))) {
        Ok(value) => Some(value),
        Err(payload) => {
            native::stash_panic(payload);
            scope.thread_safe_handle().terminate_execution();
            None
        }
    }
}

/// Abort the running operation with a fatal contract violation.
///
/// The message is raised as a panic on the thread that started the
/// outermost operation.
fn abort(scope: &mut v8::HandleScope<'_>, message: String) {
    error!(%message, "Fatal error in callback dispatch");
    native::stash_panic(Box::new(message));
    scope.thread_safe_handle().terminate_execution();
}

fn json_trampoline(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let Some(Dispatch { env, name }) = resolve(scope, &args) else {
        return;
    };
    let Some(function) = env.json_func(&name) else {
        exception::throw_error(scope, &format!("No such registered function: {name}"));
        return;
    };

    let payload = args.get(2).to_rust_string_lossy(scope);
    let argv: Vec<serde_json::Value> = match serde_json::from_str(&payload) {
        Ok(argv) => argv,
        Err(e) => {
            exception::throw_error(scope, &format!("Cannot decode arguments of {name}: {e}"));
            return;
        }
    };

    trace!(env_id = %env.id(), function = %name, argc = argv.len(), "Dispatching JSON callback");

    let Some(returned) = invoke_host(scope, move || function(argv)) else {
        return;
    };
    let Some(returned) = returned else {
        rv.set_undefined();
        return;
    };

    let encoded = match serde_json::to_string(&returned) {
        Ok(encoded) => encoded,
        Err(e) => {
            exception::throw_error(scope, &format!("Cannot encode result of {name}: {e}"));
            return;
        }
    };
    // A failed parse leaves its exception pending in script.
    if let Some(value) =
        v8::String::new(scope, &encoded).and_then(|text| v8::json::parse(scope, text))
    {
        rv.set(value);
    }
}

fn raw_trampoline(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let caller = caller_location(scope);
    let Some(Dispatch { env, name }) = resolve(scope, &args) else {
        return;
    };
    let Some(function) = env.raw_func(&name) else {
        exception::throw_error(scope, &format!("No such registered function: {name}"));
        return;
    };
    let Ok(list) = v8::Local::<v8::Array>::try_from(args.get(2)) else {
        exception::throw_error(scope, &format!("Raw callback {name} expects an argument array"));
        return;
    };

    let env_id = env.id();
    let mut argv = Vec::with_capacity(list.length() as usize);
    for index in 0..list.length() {
        let item = list
            .get_index(scope, index)
            .unwrap_or_else(|| v8::undefined(scope).into());
        let Some(id) = native::mint(scope, env_id, item) else {
            exception::throw_error(scope, &format!("Environment {env_id} has been destroyed"));
            return;
        };
        argv.push(env.adopt(id));
    }

    trace!(env_id = %env_id, function = %name, argc = argv.len(), caller = %caller, "Dispatching raw callback");

    let Some(outcome) = invoke_host(scope, move || function(caller, argv)) else {
        return;
    };

    match outcome {
        Err(e) => {
            warn!(env_id = %env_id, function = %name, error = %e, "Raw callback failed");
            exception::throw_error(scope, &e.to_string());
        }
        Ok(None) => rv.set_undefined(),
        Ok(Some(value)) if value.env_id() != env_id => abort(
            scope,
            format!(
                "Error processing return value of raw function callback {name}: return value was generated from another environment ({} != {env_id})",
                value.env_id()
            ),
        ),
        Ok(Some(value)) => match native::value(scope, env_id, value.id()) {
            Some(local) => rv.set(local),
            None => abort(
                scope,
                format!(
                    "Error processing return value of raw function callback {name}: return value has been released"
                ),
            ),
        },
    }
}

/// Location of the script frame that called the raw forwarder.
///
/// Frame 0 is the forwarder itself, frame 1 is its caller.
fn caller_location(scope: &mut v8::HandleScope<'_>) -> Loc {
    let Some(trace) = v8::StackTrace::current_stack_trace(scope, 2) else {
        return Loc::default();
    };
    if trace.get_frame_count() < 2 {
        return Loc::default();
    }
    let Some(frame) = trace.get_frame(scope, 1) else {
        return Loc::default();
    };

    Loc {
        funcname: frame
            .get_function_name(scope)
            .map(|name| name.to_rust_string_lossy(scope))
            .unwrap_or_default(),
        filename: frame
            .get_script_name(scope)
            .map(|name| name.to_rust_string_lossy(scope))
            .unwrap_or_default(),
        line: frame.get_line_number(),
        column: frame.get_column(),
    }
}
