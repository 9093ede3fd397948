//! Logging facade used throughout the harness.
//!
//! With the `tracing-integration` feature (on by default) these are the
//! `tracing` macros. Without it every macro expands to nothing, so call sites
//! never need their own `cfg` guards.

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, debug_span, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod disabled {
    macro_rules! event_noop {
        ($($tt:tt)*) => {{}};
    }

    macro_rules! span_noop {
        ($($tt:tt)*) => {
            $crate::tracing_compat::NoopSpan
        };
    }

    pub(crate) use event_noop as debug;
    pub(crate) use event_noop as error;
    pub(crate) use event_noop as info;
    pub(crate) use event_noop as trace;
    pub(crate) use event_noop as warn;
    pub(crate) use span_noop as debug_span;
}

#[cfg(not(feature = "tracing-integration"))]
pub(crate) use disabled::{debug, debug_span, error, info, trace, warn};

/// Stand-in span returned by `debug_span!` when tracing is compiled out.
#[cfg(not(feature = "tracing-integration"))]
#[derive(Debug, Clone, Copy)]
pub struct NoopSpan;

#[cfg(not(feature = "tracing-integration"))]
impl NoopSpan {
    /// Mirrors `tracing::Span::entered`.
    #[must_use]
    pub fn entered(self) -> Self {
        self
    }
}
