//! Translation between script exceptions and host errors.
//!
//! Outbound, a caught exception becomes a [`ScriptException`] carrying the
//! rendered thrown value, its origin and the stack trace. Inbound, host
//! failures are thrown into script as `Error` objects.

use std::panic;

use jsbridge_common::{BridgeError, ScriptException};

use crate::native;

/// Which phase of evaluation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Compile,
    Run,
}

/// Convert the state of a failed operation into an error.
///
/// A host panic stashed during the operation is resumed here, so it surfaces
/// on the thread that requested the operation.
pub(crate) fn capture(tc: &mut v8::TryCatch<'_, v8::HandleScope<'_>>, stage: Stage) -> BridgeError {
    if let Some(payload) = native::take_panic() {
        panic::resume_unwind(payload);
    }
    if tc.has_terminated() {
        return BridgeError::Terminated;
    }

    let exception = translate(tc);
    match stage {
        Stage::Compile => BridgeError::Compile(exception),
        Stage::Run => BridgeError::Exception(exception),
    }
}

/// Build a [`ScriptException`] from the exception caught by `tc`.
pub(crate) fn translate(tc: &mut v8::TryCatch<'_, v8::HandleScope<'_>>) -> ScriptException {
    let mut exception = ScriptException::default();

    if let Some(thrown) = tc.exception() {
        exception.message = render(tc, thrown);
    }

    if let Some(message) = tc.message() {
        exception.resource_name = message
            .get_script_resource_name(tc)
            .filter(|name| !name.is_null_or_undefined())
            .map(|name| name.to_rust_string_lossy(tc));
        exception.line = message.get_line_number(tc);
        exception.column = Some(message.get_start_column());
        exception.source_line = message
            .get_source_line(tc)
            .map(|line| line.to_rust_string_lossy(tc));
    }

    exception.stack_trace = tc
        .stack_trace()
        .filter(|stack| !stack.is_null_or_undefined())
        .map(|stack| stack.to_rust_string_lossy(tc))
        .filter(|stack| !stack.is_empty());

    exception
}

/// Render a thrown value as text. Plain objects use their JSON form.
fn render<'s>(scope: &mut v8::HandleScope<'s>, thrown: v8::Local<'s, v8::Value>) -> String {
    let scope = &mut v8::TryCatch::new(scope);
    let text = thrown.to_rust_string_lossy(scope);
    if text != "[object Object]" {
        return text;
    }

    v8::json::stringify(scope, thrown)
        .map(|json| json.to_rust_string_lossy(scope))
        .unwrap_or(text)
}

/// Throw a new `Error` with `message` into the running script.
pub(crate) fn throw_error(scope: &mut v8::HandleScope<'_>, message: &str) {
    let text = v8::String::new(scope, message).unwrap_or_else(|| v8::String::empty(scope));
    let error = v8::Exception::error(scope, text);
    scope.throw_exception(error);
}
