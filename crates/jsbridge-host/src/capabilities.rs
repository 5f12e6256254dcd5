//! Capability selection for host bindings.
//!
//! This module provides the [`Capabilities`] struct, which defines which
//! host bindings an environment receives.

use jsbridge_common::HostConfig;

/// Host bindings to install into an environment.
///
/// By default nothing is installed; each binding must be enabled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Install the `console` object.
    pub console_enabled: bool,

    /// Keep console output in memory.
    pub capture_console: bool,

    /// Install the blocking `sleep(ms)` function.
    pub sleep_enabled: bool,
}

impl Capabilities {
    /// Create a capability set with all bindings disabled.
    pub fn none() -> Self {
        Self::default()
    }

    /// Create a capability set with all bindings enabled.
    pub fn all() -> Self {
        Self {
            console_enabled: true,
            capture_console: true,
            sleep_enabled: true,
        }
    }

    /// Derive capabilities from the `[host]` configuration section.
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            console_enabled: config.console || config.capture_logs,
            capture_console: config.capture_logs,
            sleep_enabled: config.sleep,
        }
    }

    /// Create a builder for constructing capabilities.
    pub fn builder() -> CapabilitiesBuilder {
        CapabilitiesBuilder::default()
    }
}

/// Builder for [`Capabilities`].
#[derive(Debug, Default)]
pub struct CapabilitiesBuilder {
    inner: Capabilities,
}

impl CapabilitiesBuilder {
    /// Enable the console.
    #[must_use]
    pub fn enable_console(mut self) -> Self {
        self.inner.console_enabled = true;
        self
    }

    /// Enable the console and keep its output in memory.
    #[must_use]
    pub fn capture_console(mut self) -> Self {
        self.inner.console_enabled = true;
        self.inner.capture_console = true;
        self
    }

    /// Enable `sleep(ms)`.
    #[must_use]
    pub fn enable_sleep(mut self) -> Self {
        self.inner.sleep_enabled = true;
        self
    }

    /// Build the capabilities.
    #[must_use]
    pub fn build(self) -> Capabilities {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_none() {
        let caps = Capabilities::none();
        assert!(!caps.console_enabled);
        assert!(!caps.capture_console);
        assert!(!caps.sleep_enabled);
    }

    #[test]
    fn test_capabilities_all() {
        let caps = Capabilities::all();
        assert!(caps.console_enabled);
        assert!(caps.capture_console);
        assert!(caps.sleep_enabled);
    }

    #[test]
    fn test_builder() {
        let caps = Capabilities::builder().enable_sleep().build();
        assert!(caps.sleep_enabled);
        assert!(!caps.console_enabled);

        let caps = Capabilities::builder().capture_console().build();
        assert!(caps.console_enabled);
        assert!(caps.capture_console);
    }

    #[test]
    fn test_from_config() {
        let caps = Capabilities::from_config(&HostConfig::default());
        assert!(caps.console_enabled);
        assert!(!caps.capture_console);
        assert!(!caps.sleep_enabled);

        let config = HostConfig {
            console: false,
            sleep: true,
            capture_logs: true,
        };
        let caps = Capabilities::from_config(&config);
        // Capturing implies the console itself.
        assert!(caps.console_enabled);
        assert!(caps.capture_console);
        assert!(caps.sleep_enabled);
    }
}
