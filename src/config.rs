//! Harness configuration.
//!
//! `HarnessConfig` uses the same move-based builder style as the rest of the
//! crate: each method consumes `self` and returns the updated value.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `thread_name` | `"affinity-harness-loop"` |
//! | `thread_stack_size` | `None` (platform default) |
//! | `capture_backtrace` | `true` |
//! | `inbox_capacity` | 64 |
//!
//! # Environment
//!
//! [`HarnessConfig::from_env`] layers these variables over the defaults:
//!
//! - `HARNESS_THREAD_NAME`
//! - `HARNESS_STACK_SIZE` (bytes)
//! - `HARNESS_CAPTURE_BACKTRACE` (`1`/`0`, `true`/`false`)
//!
//! Log verbosity is not part of the config: the installed `tracing`
//! subscriber owns it. The crate's own tests read `HARNESS_LOG_LEVEL` when
//! `RUST_LOG` is unset.
//!
//! ```ignore
//! use affinity_harness::HarnessConfig;
//!
//! let config = HarnessConfig::new()
//!     .thread_name("ui-loop")
//!     .thread_stack_size(4 * 1024 * 1024);
//! config.validate()?;
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default name of the dedicated loop thread.
pub const DEFAULT_THREAD_NAME: &str = "affinity-harness-loop";

/// Smallest accepted explicit stack size for the loop thread.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Configuration for test runs.
///
/// Serializable so an isolated re-entry can carry the caller's settings
/// across the boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Name given to the dedicated loop thread.
    pub thread_name: String,
    /// Explicit stack size for the loop thread. `None` keeps the platform default.
    pub thread_stack_size: Option<usize>,
    /// Whether panics on the loop thread record a backtrace into the captured failure.
    ///
    /// Capture still honors `RUST_BACKTRACE`; this only turns the recording off.
    pub capture_backtrace: bool,
    /// Initial capacity of the loop's action queue.
    pub inbox_capacity: usize,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
            thread_stack_size: None,
            capture_backtrace: true,
            inbox_capacity: 64,
        }
    }

    /// Defaults overridden by `HARNESS_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    #[must_use]
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(name) = lookup("HARNESS_THREAD_NAME").filter(|n| !n.trim().is_empty()) {
            self.thread_name = name;
        }
        if let Some(raw) = lookup("HARNESS_STACK_SIZE") {
            match raw.trim().parse::<usize>() {
                Ok(size) => self.thread_stack_size = Some(size),
                Err(_) => crate::tracing_compat::warn!(
                    value = %raw,
                    "ignoring unparseable HARNESS_STACK_SIZE"
                ),
            }
        }
        if let Some(raw) = lookup("HARNESS_CAPTURE_BACKTRACE") {
            match parse_flag(&raw) {
                Some(flag) => self.capture_backtrace = flag,
                None => crate::tracing_compat::warn!(
                    value = %raw,
                    "ignoring unparseable HARNESS_CAPTURE_BACKTRACE"
                ),
            }
        }
        self
    }

    /// Sets the loop thread name.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Sets an explicit loop thread stack size.
    #[must_use]
    pub const fn thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = Some(bytes);
        self
    }

    /// Enables or disables backtrace recording.
    #[must_use]
    pub const fn capture_backtrace(mut self, value: bool) -> Self {
        self.capture_backtrace = value;
        self
    }

    /// Sets the initial queue capacity.
    #[must_use]
    pub const fn inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = capacity;
        self
    }

    /// Checks the configuration for values the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.thread_name.trim().is_empty() {
            return Err(Error::config("thread name must not be empty"));
        }
        if self.thread_name.contains('\0') {
            return Err(Error::config("thread name must not contain NUL bytes"));
        }
        if let Some(size) = self.thread_stack_size {
            if size < MIN_STACK_SIZE {
                return Err(Error::config(format!(
                    "thread stack size {size} is below the minimum of {MIN_STACK_SIZE} bytes"
                )));
            }
        }
        Ok(())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
