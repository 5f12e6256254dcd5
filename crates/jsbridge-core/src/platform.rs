//! Process-wide engine platform.
//!
//! V8 needs a platform and a one-time initialization before the first
//! isolate is created. Both happen lazily on first engine creation.

use std::sync::Once;

use tracing::{debug, info};

static INIT: Once = Once::new();

/// Initialize the engine platform if that has not happened yet.
///
/// `flags` only take effect on the first call.
pub(crate) fn initialize(flags: Option<&str>) {
    INIT.call_once(|| {
        if let Some(flags) = flags {
            debug!(flags, "Applying engine flags");
            v8::V8::set_flags_from_string(flags);
        }

        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();

        info!(version = v8::V8::get_version(), "V8 platform initialized");
    });
}

/// Returns `true` once the platform has been initialized.
pub(crate) fn is_initialized() -> bool {
    INIT.is_completed()
}
