//! Execution environments.
//!
//! An [`Environment`] is one global scope inside an [`Engine`]. It owns:
//! - The native context, created on the engine thread
//! - The JSON-mode and raw-mode callback tables
//! - The set of value handles it has issued
//!
//! Environments of the same engine share its thread, so their operations are
//! serialized. Environments of different engines run in parallel.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, instrument, trace};

use jsbridge_common::{BridgeError, HostError, ScriptException};

use crate::bridge::{self, JsonFunction, Loc, RawFunction};
use crate::engine::Engine;
use crate::exception::{self, Stage};
use crate::id::{EnvId, ValueId};
use crate::native;
use crate::registry;
use crate::value::{Value, ValueKind, json_projection};

/// State shared by all clones of an [`Environment`] and all of its values.
pub(crate) struct EnvShared {
    id: EnvId,
    engine: Engine,
    destroyed: AtomicBool,
    funcs: RwLock<HashMap<String, JsonFunction>>,
    raw_funcs: RwLock<HashMap<String, RawFunction>>,
    values: Mutex<HashSet<ValueId>>,
    /// Anonymous callbacks whose functions the engine has collected.
    collected: Arc<Mutex<Vec<String>>>,
}

impl EnvShared {
    pub(crate) fn id(&self) -> EnvId {
        self.id
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// # Panics
    ///
    /// Panics if the environment has been destroyed.
    pub(crate) fn ensure_active(&self) {
        assert!(
            !self.is_destroyed(),
            "environment {} has been destroyed",
            self.id
        );
    }

    /// Wrap a freshly minted native reference in a handle.
    pub(crate) fn adopt(self: &Arc<Self>, id: ValueId) -> Value {
        self.values.lock().insert(id);
        Value::new(id, Arc::clone(self))
    }

    /// Returns `true` if `id` is a live value of this environment.
    pub(crate) fn holds(&self, id: ValueId) -> bool {
        self.values.lock().contains(&id)
    }

    /// Forget `id` and drop its native reference.
    ///
    /// Returns `false` if it was not live.
    pub(crate) fn release_value(&self, id: ValueId) -> bool {
        if !self.values.lock().remove(&id) {
            return false;
        }
        let env = self.id;
        self.engine.post(move || native::release(env, id));
        true
    }

    pub(crate) fn json_func(&self, name: &str) -> Option<JsonFunction> {
        self.funcs.read().get(name).cloned()
    }

    pub(crate) fn raw_func(&self, name: &str) -> Option<RawFunction> {
        self.raw_funcs.read().get(name).cloned()
    }

    /// Forget anonymous callbacks whose functions were garbage collected.
    fn sweep_collected(&self) -> usize {
        let names = std::mem::take(&mut *self.collected.lock());
        if names.is_empty() {
            return 0;
        }

        let removed: Vec<RawFunction> = {
            let mut raw_funcs = self.raw_funcs.write();
            names.iter().filter_map(|name| raw_funcs.remove(name)).collect()
        };
        let count = removed.len();
        // Callbacks may capture handles of this environment.
        drop(removed);

        trace!(env_id = %self.id, count, "Swept collected callbacks");
        count
    }

    /// Release all values, forget all callbacks and dispose the context.
    ///
    /// Returns `false` if the environment was already destroyed.
    fn teardown(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let released = std::mem::take(&mut *self.values.lock()).len();
        // Callbacks may capture handles of this environment; drop them
        // outside the locks.
        let funcs = std::mem::take(&mut *self.funcs.write());
        let raw_funcs = std::mem::take(&mut *self.raw_funcs.write());
        drop(funcs);
        drop(raw_funcs);

        registry::deregister(self.id);
        let env = self.id;
        self.engine.post(move || native::dispose_context(env));

        debug!(env_id = %self.id, released, "Environment destroyed");
        true
    }
}

impl Drop for EnvShared {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Handle to an execution environment.
///
/// Cloning is cheap and every clone refers to the same environment. The
/// environment is destroyed by [`destroy`](Self::destroy), or once the last
/// clone and the last of its values are dropped.
///
/// # Example
///
/// ```ignore
/// use jsbridge_core::Environment;
///
/// let env = Environment::new()?;
/// env.add_func("double", |args| {
///     args.first().and_then(|v| v.as_i64()).map(|n| (n * 2).into())
/// })?;
/// assert_eq!(env.evaluate("double(21)", "main.js")?, serde_json::json!(42));
/// ```
#[derive(Clone)]
pub struct Environment {
    shared: Arc<EnvShared>,
}

impl Environment {
    /// Create an environment in the process-wide default engine.
    ///
    /// # Errors
    ///
    /// Returns an error if the default engine cannot be started.
    pub fn new() -> Result<Self, BridgeError> {
        Self::in_engine(&Engine::default_engine()?)
    }

    /// Create an environment in `engine`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has been destroyed or the context
    /// cannot be set up.
    #[instrument(skip(engine), fields(engine_id = %engine.id()))]
    pub fn in_engine(engine: &Engine) -> Result<Self, BridgeError> {
        if engine.is_destroyed() {
            return Err(BridgeError::invalid_config(format!(
                "Engine {} has been destroyed",
                engine.id()
            )));
        }

        let id = EnvId::next();
        let created = engine.run(move |scope| {
            native::create_context(scope, id, bridge::install_trampolines)
        });
        if !created {
            return Err(BridgeError::invalid_config(
                "Failed to install callback trampolines",
            ));
        }

        let shared = Arc::new(EnvShared {
            id,
            engine: engine.clone(),
            destroyed: AtomicBool::new(false),
            funcs: RwLock::new(HashMap::new()),
            raw_funcs: RwLock::new(HashMap::new()),
            values: Mutex::new(HashSet::new()),
            collected: Arc::default(),
        });
        registry::register(&shared);

        debug!(env_id = %id, "Environment created");
        Ok(Self { shared })
    }

    /// The environment identifier.
    pub fn id(&self) -> EnvId {
        self.shared.id
    }

    /// The engine this environment lives in.
    pub fn engine(&self) -> &Engine {
        &self.shared.engine
    }

    /// Returns `true` once the environment has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }

    /// Number of live value handles issued by this environment.
    pub fn value_count(&self) -> usize {
        self.shared.values.lock().len()
    }

    /// Number of registered callbacks, named and anonymous.
    pub fn callback_count(&self) -> usize {
        self.shared.funcs.read().len() + self.shared.raw_funcs.read().len()
    }

    /// Returns `true` while trampolines can resolve this environment.
    pub fn is_registered(&self) -> bool {
        registry::contains(self.shared.id)
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Compile and run `source`, returning the completion value as JSON.
    ///
    /// `undefined` and functions evaluate to `null`. An empty `filename`
    /// marks the source as anonymous.
    ///
    /// # Panics
    ///
    /// Panics if the environment has been destroyed, or re-raises a panic of
    /// a host callback invoked by the script.
    #[instrument(skip(self, source), fields(env_id = %self.shared.id))]
    pub fn evaluate(&self, source: &str, filename: &str) -> Result<serde_json::Value, BridgeError> {
        self.shared.ensure_active();
        let env = self.shared.id;
        let source = source.to_owned();
        let filename = filename.to_owned();

        let projection = self.shared.engine.run(move |scope| {
            native::in_context(scope, env, |scope| {
                execute(scope, &source, &filename, |scope, result| {
                    json_projection(scope, result)
                })
            })
        })?;

        if projection == "undefined" {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&projection)?)
    }

    /// Compile and run `source`, returning the completion value as a handle.
    #[instrument(skip(self, source), fields(env_id = %self.shared.id))]
    pub fn evaluate_raw(&self, source: &str, filename: &str) -> Result<Value, BridgeError> {
        self.shared.ensure_active();
        let env = self.shared.id;
        let source = source.to_owned();
        let filename = filename.to_owned();

        let id = self.shared.engine.run(move |scope| {
            native::in_context(scope, env, |scope| {
                execute(scope, &source, &filename, |scope, result| {
                    native::mint(scope, env, result)
                })
            })
        })?;

        Ok(self.shared.adopt(id))
    }

    /// Call the global function `func_name` with JSON arguments.
    ///
    /// The call is evaluated as a script named `[CALL:<func_name>]`.
    pub fn call(
        &self,
        func_name: &str,
        args: &[serde_json::Value],
    ) -> Result<serde_json::Value, BridgeError> {
        let mut source = String::with_capacity(func_name.len() + 2);
        source.push_str(func_name);
        source.push('(');
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                source.push(',');
            }
            source.push_str(&serde_json::to_string(arg)?);
        }
        source.push(')');

        self.evaluate(&source, &format!("[CALL:{func_name}]"))
    }

    /// Call the function `func` with `this` bound to `this`, or to the global
    /// object when `None`.
    ///
    /// Fails with [`BridgeError::TypeMismatch`] if `func` is not a function.
    ///
    /// # Panics
    ///
    /// Panics if any handle is released or belongs to another environment.
    pub fn apply(&self, func: &Value, this: Option<&Value>, args: &[Value]) -> Result<Value, BridgeError> {
        self.shared.ensure_active();
        let func_id = self.claim(func, "apply");
        let this_id = this.map(|value| self.claim(value, "apply"));
        let arg_ids: Vec<ValueId> = args.iter().map(|value| self.claim(value, "apply")).collect();
        let env = self.shared.id;

        let id = self.shared.engine.run(move |scope| {
            native::in_context(scope, env, |scope| {
                let tc = &mut v8::TryCatch::new(scope);
                let target = native::expect_value(tc, env, func_id);
                let Ok(function) = v8::Local::<v8::Function>::try_from(target) else {
                    return Err(BridgeError::type_mismatch(
                        "function",
                        ValueKind::of(&target).as_str(),
                    ));
                };

                let receiver = match this_id {
                    Some(id) => native::expect_value(tc, env, id),
                    None => {
                        let context = tc.get_current_context();
                        context.global(tc).into()
                    }
                };
                let argv: Vec<v8::Local<'_, v8::Value>> = arg_ids
                    .iter()
                    .map(|id| native::expect_value(tc, env, *id))
                    .collect();

                let Some(result) = function.call(tc, receiver, &argv) else {
                    return Err(exception::capture(tc, Stage::Run));
                };
                native::mint(tc, env, result).ok_or_else(|| exception::capture(tc, Stage::Run))
            })
        })?;

        Ok(self.shared.adopt(id))
    }

    /// Check that `value` is a live handle of this environment.
    fn claim(&self, value: &Value, operation: &str) -> ValueId {
        assert!(
            value.env_id() == self.shared.id,
            "Cannot {operation}: value was generated from another environment ({} != {})",
            value.env_id(),
            self.shared.id
        );
        assert!(
            self.shared.holds(value.id()),
            "Cannot {operation}: value {} has been released",
            value.id()
        );
        value.id()
    }

    // ========================================================================
    // Value constructors
    // ========================================================================

    /// Parse JSON text with the engine's native parser.
    pub fn from_json(&self, json: &str) -> Result<Value, BridgeError> {
        self.shared.ensure_active();
        let env = self.shared.id;
        let json = json.to_owned();

        let id = self.shared.engine.run(move |scope| {
            native::in_context(scope, env, |scope| {
                let tc = &mut v8::TryCatch::new(scope);
                let Some(text) = v8::String::new(tc, &json) else {
                    return Err(BridgeError::Exception(ScriptException::new(
                        "JSON text exceeds the maximum string length",
                    )));
                };
                let Some(parsed) = v8::json::parse(tc, text) else {
                    return Err(exception::capture(tc, Stage::Run));
                };
                native::mint(tc, env, parsed).ok_or_else(|| exception::capture(tc, Stage::Run))
            })
        })?;

        Ok(self.shared.adopt(id))
    }

    /// Serialize `value` to JSON and parse it into a script value.
    pub fn to_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<Value, BridgeError> {
        let json = serde_json::to_string(value)?;
        self.from_json(&json)
    }

    /// Evaluate the expression `js` and return its value as a handle.
    pub fn create_js(&self, js: &str, filename: &str) -> Result<Value, BridgeError> {
        self.evaluate_raw(&format!("(function() {{ return {js}\n; }})()"), filename)
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    /// Bind `func` as the global JSON-mode function `name`.
    ///
    /// Arguments reach `func` decoded from JSON; its result is encoded back.
    /// Registering a name again replaces the previous callback.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidName`] if `name` is not an identifier.
    #[track_caller]
    pub fn add_func<F>(&self, name: &str, func: F) -> Result<(), BridgeError>
    where
        F: Fn(Vec<serde_json::Value>) -> Option<serde_json::Value> + Send + Sync + 'static,
    {
        let origin = Location::caller();
        self.shared.ensure_active();
        bridge::validate_name(name)?;

        let previous = self
            .shared
            .funcs
            .write()
            .insert(name.to_owned(), Arc::new(func));
        if let Err(e) = self.evaluate(
            &bridge::json_wrapper(self.shared.id, name),
            &bridge::registration_tag(name, origin),
        ) {
            restore(&self.shared.funcs, name, previous);
            return Err(e);
        }

        debug!(env_id = %self.shared.id, function = name, "Registered JSON callback");
        Ok(())
    }

    /// Bind `func` as the global raw-mode function `name`.
    ///
    /// Arguments reach `func` as value handles together with the caller's
    /// location. Registering a name again replaces the previous callback.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidName`] if `name` is not an identifier.
    #[track_caller]
    pub fn add_raw_func<F>(&self, name: &str, func: F) -> Result<(), BridgeError>
    where
        F: Fn(Loc, Vec<Value>) -> Result<Option<Value>, HostError> + Send + Sync + 'static,
    {
        let origin = Location::caller();
        self.shared.ensure_active();
        bridge::validate_name(name)?;

        let previous = self
            .shared
            .raw_funcs
            .write()
            .insert(name.to_owned(), Arc::new(func));
        if let Err(e) = self.evaluate(
            &bridge::raw_wrapper(self.shared.id, name),
            &bridge::registration_tag(name, origin),
        ) {
            restore(&self.shared.raw_funcs, name, previous);
            return Err(e);
        }

        debug!(env_id = %self.shared.id, function = name, "Registered raw callback");
        Ok(())
    }

    /// Create an anonymous raw-mode function without binding a global name.
    ///
    /// The callback is registered under a name derived from the call site
    /// and forgotten once the engine garbage collects the function.
    #[track_caller]
    pub fn create_raw_func<F>(&self, func: F) -> Result<Value, BridgeError>
    where
        F: Fn(Loc, Vec<Value>) -> Result<Option<Value>, HostError> + Send + Sync + 'static,
    {
        static NEXT: AtomicU64 = AtomicU64::new(1);

        let origin = Location::caller();
        self.shared.ensure_active();
        let name = format!(
            "RawFunc:{}:{}#{}",
            bridge::short_file(origin.file()),
            origin.line(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );

        let source = bridge::anonymous_raw_wrapper(self.shared.id, &name)?;
        self.shared.sweep_collected();
        self.shared.raw_funcs.write().insert(name.clone(), Arc::new(func));

        let function = match self.evaluate_raw(&source, &name) {
            Ok(function) => function,
            Err(e) => {
                restore(&self.shared.raw_funcs, &name, None);
                return Err(e);
            }
        };

        let env = self.shared.id;
        let id = function.id();
        let collected = Arc::clone(&self.shared.collected);
        let watched = self.shared.engine.run(move |scope| {
            native::watch(scope, env, id, move || collected.lock().push(name))
        });
        debug_assert!(watched, "anonymous callback {id} is not live");

        Ok(function)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Release every value handle issued by this environment.
    pub fn clear_values(&self) {
        self.shared.ensure_active();
        self.shared.sweep_collected();
        let ids = std::mem::take(&mut *self.shared.values.lock());
        let released = ids.len();
        let env = self.shared.id;
        self.shared.engine.post(move || {
            for id in ids {
                native::release(env, id);
            }
        });
        debug!(env_id = %env, released, "Cleared environment values");
    }

    /// Abort the operation currently running on this environment's engine.
    ///
    /// Every operation executing on the engine is aborted, including those
    /// of other environments sharing it.
    pub fn terminate(&self) {
        self.shared.ensure_active();
        self.shared.engine.terminate();
    }

    /// Destroy the environment: release all values, forget all callbacks and
    /// dispose the context.
    ///
    /// Fails with [`BridgeError::StaleHandle`] if already destroyed.
    pub fn destroy(&self) -> Result<(), BridgeError> {
        if self.shared.teardown() {
            Ok(())
        } else {
            Err(BridgeError::StaleHandle {
                what: "environment",
            })
        }
    }

    /// Number of native references held for this environment on the engine.
    ///
    /// Released handles are dropped asynchronously, so this can briefly lag
    /// behind [`value_count`](Self::value_count).
    pub fn native_value_count(&self) -> Option<usize> {
        let env = self.shared.id;
        self.shared.engine.run(move |_| native::value_count(env))
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.shared.id)
            .field("engine_id", &self.shared.engine.id())
            .field("destroyed", &self.is_destroyed())
            .field("values", &self.value_count())
            .finish_non_exhaustive()
    }
}

/// Put back the callback that a failed registration replaced.
fn restore<F>(table: &RwLock<HashMap<String, F>>, name: &str, previous: Option<F>) {
    let failed = match previous {
        Some(previous) => table.write().insert(name.to_owned(), previous),
        None => table.write().remove(name),
    };
    drop(failed);
}

/// Compile and run `source` in the current context, then convert the
/// completion value with `finish` while the script's exception scope is
/// still active.
fn execute<R, F>(
    scope: &mut v8::HandleScope<'_>,
    source: &str,
    filename: &str,
    finish: F,
) -> Result<R, BridgeError>
where
    F: for<'s> FnOnce(&mut v8::HandleScope<'s>, v8::Local<'s, v8::Value>) -> Option<R>,
{
    let tc = &mut v8::TryCatch::new(scope);

    let Some(code) = v8::String::new(tc, source) else {
        return Err(BridgeError::Compile(ScriptException::new(
            "Source exceeds the maximum string length",
        )));
    };
    let origin = script_origin(tc, filename);

    let Some(script) = v8::Script::compile(tc, code, Some(&origin)) else {
        return Err(exception::capture(tc, Stage::Compile));
    };
    let Some(result) = script.run(tc) else {
        return Err(exception::capture(tc, Stage::Run));
    };

    finish(tc, result).ok_or_else(|| exception::capture(tc, Stage::Run))
}

/// Origin for a script named `filename`. Empty names stay anonymous.
fn script_origin<'s>(scope: &mut v8::HandleScope<'s>, filename: &str) -> v8::ScriptOrigin<'s> {
    let name: v8::Local<'s, v8::Value> = if filename.is_empty() {
        v8::undefined(scope).into()
    } else {
        match v8::String::new(scope, filename) {
            Some(name) => name.into(),
            None => v8::undefined(scope).into(),
        }
    };

    v8::ScriptOrigin::new(
        scope, name, 0, 0, false, 0, None, false, false, false, None,
    )
}
