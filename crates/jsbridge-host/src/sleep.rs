//! Blocking `sleep(ms)` host function.
//!
//! The call blocks the engine thread, so every environment of the same
//! engine waits with it. Environments of other engines are unaffected.

use std::thread;
use std::time::Duration;

use tracing::trace;

use jsbridge_core::{BridgeError, Environment};

/// Global name of the sleep function.
pub const SLEEP_FUNCTION: &str = "sleep";

/// Longest accepted sleep.
pub const MAX_SLEEP: Duration = Duration::from_secs(3600);

/// Install `sleep(ms)` as a global of `env`.
///
/// # Errors
///
/// Returns an error if the wrapper cannot be evaluated.
pub fn install_sleep(env: &Environment) -> Result<(), BridgeError> {
    env.add_func(SLEEP_FUNCTION, |args| {
        let duration = sleep_duration(&args);
        trace!(?duration, "Guest sleep");
        thread::sleep(duration);
        None
    })
}

/// Duration requested by the arguments of a `sleep` call.
///
/// Missing, negative and non-numeric arguments sleep for zero time.
pub fn sleep_duration(args: &[serde_json::Value]) -> Duration {
    args.first()
        .and_then(serde_json::Value::as_f64)
        .filter(|ms| ms.is_finite() && *ms > 0.0)
        .map_or(Duration::ZERO, |ms| {
            Duration::from_secs_f64(ms / 1000.0).min(MAX_SLEEP)
        })
}
