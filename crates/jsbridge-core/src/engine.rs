//! Engine instances.
//!
//! An [`Engine`] is one independent isolated execution instance. It is:
//! - Backed by a dedicated OS thread that owns the native isolate
//! - Shared by every environment created inside it
//! - Serialized: one operation runs at a time, in submission order
//!
//! Host threads submit jobs over a channel and block on the reply. Jobs
//! submitted from the engine's own thread (host callbacks re-entering the
//! engine) run inline on the active callback scope instead of being queued.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc as std_mpsc};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use jsbridge_common::{BridgeError, EngineConfig};

use crate::id::EngineId;
use crate::{native, platform};

type Task = Box<dyn FnOnce(&mut v8::HandleScope<'_, ()>) + Send>;

enum Job {
    /// Runs with a fresh handle scope on the isolate.
    Run(Task),
    /// Native bookkeeping that needs no scope.
    Post(Box<dyn FnOnce() + Send>),
    Shutdown,
}

#[derive(Debug, Default)]
struct Activity {
    running: bool,
}

/// Handle to an engine instance.
///
/// Cloning is cheap and every clone refers to the same engine. The engine
/// thread stops when [`destroy`](Self::destroy) is called or the last clone
/// is dropped.
///
/// # Example
///
/// ```ignore
/// use jsbridge_common::EngineConfig;
/// use jsbridge_core::{Engine, Environment};
///
/// let engine = Engine::new(&EngineConfig::default())?;
/// let env = Environment::in_engine(&engine)?;
/// assert_eq!(env.evaluate("1 + 2", "sum.js")?, serde_json::json!(3));
/// ```
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

struct EngineShared {
    id: EngineId,
    config: EngineConfig,
    jobs: mpsc::UnboundedSender<Job>,
    isolate: v8::IsolateHandle,
    activity: Arc<Mutex<Activity>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

static DEFAULT_ENGINE: Mutex<Option<Engine>> = Mutex::new(None);

impl Engine {
    /// Create a new engine with its own thread and isolate.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine thread cannot be started.
    #[instrument(skip(config), fields(max_heap_mb = config.max_heap_mb))]
    pub fn new(config: &EngineConfig) -> Result<Self, BridgeError> {
        platform::initialize(config.flags.as_deref());

        let id = EngineId::next();
        let (jobs, receiver) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let activity = Arc::new(Mutex::new(Activity::default()));

        let thread_config = config.clone();
        let thread_activity = Arc::clone(&activity);
        let thread = thread::Builder::new()
            .name(format!("{}-{id}", config.thread_name_prefix))
            .spawn(move || engine_main(id, &thread_config, &thread_activity, receiver, &ready_tx))
            .map_err(|e| {
                BridgeError::invalid_config(format!("Failed to spawn engine thread: {e}"))
            })?;

        let isolate = ready_rx.recv().map_err(|_| {
            BridgeError::invalid_config("Engine thread exited before the isolate was ready")
        })?;

        info!(engine_id = %id, "Engine created");

        Ok(Self {
            shared: Arc::new(EngineShared {
                id,
                config: config.clone(),
                jobs,
                isolate,
                activity,
                thread: Mutex::new(Some(thread)),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// The process-wide default engine, created on first use.
    ///
    /// A destroyed default engine is replaced by a fresh one.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine has to be created and creation fails.
    pub fn default_engine() -> Result<Self, BridgeError> {
        let mut slot = DEFAULT_ENGINE.lock();
        if let Some(engine) = slot.as_ref().filter(|engine| !engine.is_destroyed()) {
            return Ok(engine.clone());
        }

        let engine = Self::new(&EngineConfig::default())?;
        *slot = Some(engine.clone());
        Ok(engine)
    }

    /// The engine identifier.
    pub fn id(&self) -> EngineId {
        self.shared.id
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Returns `true` while an operation is executing on the engine.
    pub fn is_running(&self) -> bool {
        self.shared.activity.lock().running
    }

    /// Returns `true` once [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    /// Abort the operation currently executing on this engine.
    ///
    /// The aborted operation fails with [`BridgeError::Terminated`]. Calling
    /// this while the engine is idle has no effect on later operations.
    /// Safe to call from any thread.
    pub fn terminate(&self) {
        let activity = self.shared.activity.lock();
        if activity.running {
            warn!(engine_id = %self.shared.id, "Terminating running execution");
            self.shared.isolate.terminate_execution();
        } else {
            debug!(engine_id = %self.shared.id, "Terminate requested while idle");
        }
    }

    /// Run a full garbage collection on the engine.
    ///
    /// Anonymous callbacks whose functions are collected are forgotten by
    /// their environment on its next callback registration.
    pub fn collect_garbage(&self) {
        self.run(|scope| scope.low_memory_notification());
        debug!(engine_id = %self.shared.id, "Garbage collection requested");
    }

    /// Stop the engine thread and dispose the isolate.
    ///
    /// Operations already queued complete first. Calling `destroy` again has
    /// no effect. Environments of a destroyed engine must not be used.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a callback running on this engine.
    pub fn destroy(&self) {
        assert!(
            !native::is_engine_thread(self.shared.id),
            "engine {} cannot be destroyed from its own callbacks",
            self.shared.id
        );

        let Some(thread) = self.shared.thread.lock().take() else {
            return;
        };
        self.shared.destroyed.store(true, Ordering::Release);
        let _ = self.shared.jobs.send(Job::Shutdown);

        if thread.join().is_err() {
            error!(engine_id = %self.shared.id, "Engine thread panicked during shutdown");
        }
        info!(engine_id = %self.shared.id, "Engine destroyed");
    }

    /// Run `f` on the engine and wait for its result.
    ///
    /// A panic inside `f` is resumed on the calling thread.
    pub(crate) fn run<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut v8::HandleScope<'_, ()>) -> R + Send + 'static,
        R: Send + 'static,
    {
        if native::is_engine_thread(self.shared.id) {
            return native::with_active_scope(f);
        }

        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        let task: Task = Box::new(move |scope: &mut v8::HandleScope<'_, ()>| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(scope)));
            let _ = reply_tx.send(outcome);
        });

        assert!(
            self.shared.jobs.send(Job::Run(task)).is_ok(),
            "engine {} has been destroyed",
            self.shared.id
        );

        match reply_rx.recv() {
            Ok(Ok(value)) => value,
            Ok(Err(payload)) => panic::resume_unwind(payload),
            Err(_) => panic!(
                "engine {} stopped while an operation was pending",
                self.shared.id
            ),
        }
    }

    /// Run scope-free native bookkeeping on the engine without waiting.
    ///
    /// Runs inline when called from the engine thread. Work posted to a
    /// stopped engine is dropped: its native state is already gone.
    pub(crate) fn post(&self, f: impl FnOnce() + Send + 'static) {
        if native::is_engine_thread(self.shared.id) {
            f();
            return;
        }
        let _ = self.shared.jobs.send(Job::Post(Box::new(f)));
    }
}

impl Drop for EngineShared {
    fn drop(&mut self) {
        let Some(thread) = self.thread.get_mut().take() else {
            return;
        };
        let _ = self.jobs.send(Job::Shutdown);

        // The last handle can be dropped by host code running on the engine
        // thread itself; the thread then exits on its own.
        if !native::is_engine_thread(self.id) && thread.join().is_err() {
            error!(engine_id = %self.id, "Engine thread panicked during shutdown");
        }
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.shared.id)
            .field("running", &self.is_running())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

/// Body of an engine thread.
fn engine_main(
    id: EngineId,
    config: &EngineConfig,
    activity: &Mutex<Activity>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    ready: &std_mpsc::SyncSender<v8::IsolateHandle>,
) {
    let mut params = v8::CreateParams::default();
    if let Some((initial, max)) = config.heap_limits() {
        params = params.heap_limits(initial, max);
    }

    let mut isolate = v8::Isolate::new(params);
    isolate.set_capture_stack_trace_for_uncaught_exceptions(true, config.stack_trace_limit);
    native::bind_engine(id);

    if ready.send(isolate.thread_safe_handle()).is_err() {
        return;
    }
    debug!(engine_id = %id, "Engine thread started");

    while let Some(job) = jobs.blocking_recv() {
        match job {
            Job::Run(task) => {
                activity.lock().running = true;
                {
                    let scope = &mut v8::HandleScope::new(&mut isolate);
                    task(scope);
                }
                // Clear the flag before cancelling so that a terminate request
                // racing with completion cannot leak into the next job.
                activity.lock().running = false;
                isolate.cancel_terminate_execution();
            }
            Job::Post(task) => task(),
            Job::Shutdown => break,
        }
    }

    let contexts = native::clear();
    drop(isolate);
    debug!(engine_id = %id, contexts, "Engine thread stopped");
}
