//! Dispatch priorities.
//!
//! A [`Priority`] is an opaque total order: larger values dispatch first.
//! The named presets exist so tests can speak in familiar levels; the loop
//! attaches no meaning to them beyond their order.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Priority of a scheduled action. Higher values run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    /// Lowest preset; runs only when nothing else is pending.
    pub const SYSTEM_IDLE: Self = Self(1);
    /// Runs when the application is otherwise idle.
    pub const APPLICATION_IDLE: Self = Self(2);
    /// Runs after background work.
    pub const CONTEXT_IDLE: Self = Self(3);
    /// Background work.
    pub const BACKGROUND: Self = Self(4);
    /// Input handling.
    pub const INPUT: Self = Self(5);
    /// Post-layout work.
    pub const LOADED: Self = Self(6);
    /// Rendering work.
    pub const RENDER: Self = Self(7);
    /// Data binding.
    pub const DATA_BIND: Self = Self(8);
    /// Default priority; the test body runs here.
    pub const NORMAL: Self = Self(9);
    /// Highest preset.
    pub const SEND: Self = Self(10);

    /// Creates a priority from a raw level.
    #[must_use]
    pub const fn new(level: u8) -> Self {
        Self(level)
    }

    /// Returns the raw level.
    #[must_use]
    pub const fn level(self) -> u8 {
        self.0
    }

    /// Returns the preset name for this level, if it matches one.
    #[must_use]
    pub const fn preset_name(self) -> Option<&'static str> {
        match self.0 {
            1 => Some("SystemIdle"),
            2 => Some("ApplicationIdle"),
            3 => Some("ContextIdle"),
            4 => Some("Background"),
            5 => Some("Input"),
            6 => Some("Loaded"),
            7 => Some("Render"),
            8 => Some("DataBind"),
            9 => Some("Normal"),
            10 => Some("Send"),
            _ => None,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.preset_name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Priority({})", self.0),
        }
    }
}
