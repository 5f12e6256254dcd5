//! Engine-thread native state.
//!
//! Everything in this module lives in thread-locals of an engine thread:
//! - The native heap: one context per environment plus the persistent
//!   references backing every live [`Value`](crate::Value)
//! - The stack of callback scopes through which host code re-enters the
//!   engine from inside a callback
//! - The first panic raised by host code during the current operation
//!
//! Host-side handles only ever carry ids. All native references are created,
//! dereferenced and dropped on the engine thread.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use crate::id::{EngineId, EnvId, ValueId};

type Payload = Box<dyn Any + Send>;

thread_local! {
    static ENGINE: Cell<Option<EngineId>> = const { Cell::new(None) };
    static HEAP: RefCell<NativeHeap> = RefCell::new(NativeHeap::default());
    static SCOPES: RefCell<Vec<*mut v8::HandleScope<'static, ()>>> = const { RefCell::new(Vec::new()) };
    static PANIC: RefCell<Option<Payload>> = const { RefCell::new(None) };
}

#[derive(Default)]
struct NativeHeap {
    contexts: HashMap<EnvId, ContextSlot>,
}

struct ContextSlot {
    // Declared first so value references are dropped before their context.
    values: HashMap<ValueId, v8::Global<v8::Value>>,
    watched: Vec<v8::Weak<v8::Value>>,
    context: v8::Global<v8::Context>,
}

/// Mark the current thread as the thread of `engine`.
pub(crate) fn bind_engine(engine: EngineId) {
    ENGINE.with(|current| current.set(Some(engine)));
}

/// The engine owning the current thread, if any.
pub(crate) fn current_engine() -> Option<EngineId> {
    ENGINE.with(Cell::get)
}

pub(crate) fn is_engine_thread(engine: EngineId) -> bool {
    current_engine() == Some(engine)
}

// ============================================================================
// Native heap
// ============================================================================

/// Create the context of `env` and register it in the native heap.
///
/// `setup` runs inside the fresh context before it is registered and may veto
/// the registration by returning `false`.
pub(crate) fn create_context(
    scope: &mut v8::HandleScope<'_, ()>,
    env: EnvId,
    setup: impl FnOnce(&mut v8::HandleScope<'_>, v8::Local<'_, v8::Context>) -> bool,
) -> bool {
    let context = v8::Context::new(scope, Default::default());
    let scope = &mut v8::ContextScope::new(scope, context);
    if !setup(scope, context) {
        return false;
    }

    let context = v8::Global::new(scope, context);
    HEAP.with(|heap| {
        heap.borrow_mut().contexts.insert(
            env,
            ContextSlot {
                values: HashMap::new(),
                watched: Vec::new(),
                context,
            },
        );
    });
    true
}

/// Run `f` inside the context of `env`.
///
/// # Panics
///
/// Panics if the context has already been disposed.
pub(crate) fn in_context<R>(
    scope: &mut v8::HandleScope<'_, ()>,
    env: EnvId,
    f: impl FnOnce(&mut v8::HandleScope<'_>) -> R,
) -> R {
    let context = HEAP.with(|heap| {
        heap.borrow()
            .contexts
            .get(&env)
            .map(|slot| v8::Local::new(scope, &slot.context))
    });
    let Some(context) = context else {
        panic!("environment {env} has been destroyed");
    };

    let scope = &mut v8::ContextScope::new(scope, context);
    f(scope)
}

/// Persist `value` in the table of `env` under a fresh id.
///
/// Returns `None` if the context of `env` is gone.
pub(crate) fn mint(
    scope: &mut v8::HandleScope<'_, ()>,
    env: EnvId,
    value: v8::Local<'_, v8::Value>,
) -> Option<ValueId> {
    let global = v8::Global::new(scope, value);
    let id = ValueId::next();
    HEAP.with(|heap| {
        let mut heap = heap.borrow_mut();
        let slot = heap.contexts.get_mut(&env)?;
        slot.values.insert(id, global);
        Some(id)
    })
}

/// Dereference a persisted value.
pub(crate) fn value<'s>(
    scope: &mut v8::HandleScope<'s, ()>,
    env: EnvId,
    id: ValueId,
) -> Option<v8::Local<'s, v8::Value>> {
    HEAP.with(|heap| {
        heap.borrow()
            .contexts
            .get(&env)
            .and_then(|slot| slot.values.get(&id))
            .map(|global| v8::Local::new(scope, global))
    })
}

/// Dereference a persisted value that the host side holds as live.
///
/// # Panics
///
/// Panics if the reference is missing, which means the handle was released
/// concurrently with its use.
pub(crate) fn expect_value<'s>(
    scope: &mut v8::HandleScope<'s, ()>,
    env: EnvId,
    id: ValueId,
) -> v8::Local<'s, v8::Value> {
    match value(scope, env, id) {
        Some(local) => local,
        None => panic!("value {id} of environment {env} has been released"),
    }
}

/// Point an existing id at `value`.
pub(crate) fn reanchor(
    scope: &mut v8::HandleScope<'_, ()>,
    env: EnvId,
    id: ValueId,
    value: v8::Local<'_, v8::Value>,
) -> bool {
    let global = v8::Global::new(scope, value);
    let previous = HEAP.with(|heap| {
        heap.borrow_mut()
            .contexts
            .get_mut(&env)
            .and_then(|slot| slot.values.get_mut(&id))
            .map(|slot| std::mem::replace(slot, global))
    });
    previous.is_some()
}

/// Run `on_collect` once the engine garbage collects the value behind `id`.
///
/// `on_collect` runs inside the collector and must not touch the engine.
/// Returns `false` if the value is not live.
pub(crate) fn watch(
    scope: &mut v8::HandleScope<'_, ()>,
    env: EnvId,
    id: ValueId,
    on_collect: impl FnOnce() + 'static,
) -> bool {
    let Some(local) = value(scope, env, id) else {
        return false;
    };
    let finalizer = Box::new(move |_: &mut v8::Isolate| on_collect());
    let weak = v8::Weak::with_finalizer(scope, local, finalizer);

    HEAP.with(|heap| {
        let mut heap = heap.borrow_mut();
        let Some(slot) = heap.contexts.get_mut(&env) else {
            return false;
        };
        slot.watched.retain(|weak| !weak.is_empty());
        slot.watched.push(weak);
        true
    })
}

/// Drop the native reference `id` of `env`.
pub(crate) fn release(env: EnvId, id: ValueId) {
    let removed = HEAP.with(|heap| {
        heap.borrow_mut()
            .contexts
            .get_mut(&env)
            .and_then(|slot| slot.values.remove(&id))
    });
    drop(removed);
}

/// Drop the context of `env` together with every value reference it holds.
pub(crate) fn dispose_context(env: EnvId) {
    let removed = HEAP.with(|heap| heap.borrow_mut().contexts.remove(&env));
    drop(removed);
}

/// Number of native references currently held for `env`.
pub(crate) fn value_count(env: EnvId) -> Option<usize> {
    HEAP.with(|heap| heap.borrow().contexts.get(&env).map(|slot| slot.values.len()))
}

/// Drop every context on this thread. Must run before the isolate is dropped.
pub(crate) fn clear() -> usize {
    let contexts = HEAP.with(|heap| std::mem::take(&mut heap.borrow_mut().contexts));
    let count = contexts.len();
    drop(contexts);
    count
}

// ============================================================================
// Callback scopes
// ============================================================================

struct ScopeGuard;

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPES.with(|scopes| {
            scopes.borrow_mut().pop();
        });
    }
}

/// Run host code with `scope` registered as the innermost callback scope.
pub(crate) fn enter<R>(scope: &mut v8::HandleScope<'_>, f: impl FnOnce() -> R) -> R {
    let base: &mut v8::HandleScope<'_, ()> = scope;
    let ptr = std::ptr::from_mut(base).cast::<v8::HandleScope<'static, ()>>();
    SCOPES.with(|scopes| scopes.borrow_mut().push(ptr));
    let _guard = ScopeGuard;
    f()
}

/// Run `f` in a handle scope nested in the innermost callback scope.
///
/// # Panics
///
/// Panics if no callback is currently running on this thread.
#[allow(unsafe_code)]
pub(crate) fn with_active_scope<R>(f: impl FnOnce(&mut v8::HandleScope<'_, ()>) -> R) -> R {
    let Some(ptr) = SCOPES.with(|scopes| scopes.borrow().last().copied()) else {
        panic!("engine thread has no active callback scope");
    };

    // SAFETY: the pointer was pushed by `enter` for a callback scope that is
    // still on the stack below us. The callback does not touch its scope until
    // the host code it invoked returns, and the nested scope created here is
    // dropped before that.
    let parent = unsafe { &mut *ptr };
    let scope = &mut v8::HandleScope::new(parent);
    f(scope)
}

// ============================================================================
// Panic containment
// ============================================================================

/// Keep the first panic payload raised during the current operation.
pub(crate) fn stash_panic(payload: Payload) {
    PANIC.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            *slot = Some(payload);
        }
    });
}

pub(crate) fn take_panic() -> Option<Payload> {
    PANIC.with(|slot| slot.borrow_mut().take())
}
