//! Host binding installation.
//!
//! This module installs the enabled host bindings into an environment and
//! evaluates preload scripts ahead of user code.

use tracing::{debug, info};

use jsbridge_core::{BridgeError, Environment};

use crate::capabilities::Capabilities;
use crate::console::ConsoleHost;
use crate::sleep::install_sleep;

/// Handles to the bindings installed into an environment.
#[derive(Debug, Default)]
pub struct HostBindings {
    /// The console host, if the console was enabled.
    pub console: Option<ConsoleHost>,

    /// Whether `sleep(ms)` was installed.
    pub sleep: bool,
}

/// Install every binding enabled in `capabilities` into `env`.
///
/// # Errors
///
/// Returns an error if a binding cannot be installed.
pub fn install_all(
    env: &Environment,
    capabilities: &Capabilities,
) -> Result<HostBindings, BridgeError> {
    let mut bindings = HostBindings::default();

    if capabilities.console_enabled {
        bindings.console = Some(ConsoleHost::install(env, capabilities.capture_console)?);
    }

    if capabilities.sleep_enabled {
        install_sleep(env)?;
        bindings.sleep = true;
    }

    info!(
        env_id = %env.id(),
        console = bindings.console.is_some(),
        sleep = bindings.sleep,
        "Host bindings installed"
    );
    Ok(bindings)
}

/// Evaluate `scripts` in order, each under its own script name.
///
/// # Errors
///
/// Stops at and returns the first failing script's error.
pub fn preload<'a>(
    env: &Environment,
    scripts: impl IntoIterator<Item = (&'a str, &'a str)>,
) -> Result<usize, BridgeError> {
    let mut count = 0;
    for (name, source) in scripts {
        env.evaluate(source, name)?;
        debug!(env_id = %env.id(), script = name, "Preloaded script");
        count += 1;
    }
    Ok(count)
}
