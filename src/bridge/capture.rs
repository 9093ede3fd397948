//! Panic trace capture for harness loop threads.
//!
//! A payload caught by `catch_unwind` carries no location. To keep the throw
//! site, a chained panic hook records the panic location (and a backtrace when
//! `RUST_BACKTRACE` enables one) into a thread-local slot, but only on threads
//! currently running a harness loop. The catch site then takes the record.
//! The previously installed hook always runs afterwards, so normal panic
//! output is unchanged.

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::Once;

static HOOK: Once = Once::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraceMode {
    Off,
    LocationOnly,
    WithBacktrace,
}

thread_local! {
    static MODE: Cell<TraceMode> = const { Cell::new(TraceMode::Off) };
    static LAST_TRACE: RefCell<Option<PanicTrace>> = const { RefCell::new(None) };
}

/// Where a panic was raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanicTrace {
    /// `file:line:column` of the panic.
    pub location: Option<String>,
    /// Rendered backtrace, present only when one was captured.
    pub backtrace: Option<String>,
}

impl fmt::Display for PanicTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "   at {location}")?,
            None => write!(f, "   at <unknown location>")?,
        }
        if let Some(backtrace) = &self.backtrace {
            write!(f, "\nstack backtrace:\n{backtrace}")?;
        }
        Ok(())
    }
}

/// A caught panic payload plus the trace recorded when it was raised.
pub struct PanicCapture {
    pub(crate) payload: Box<dyn Any + Send>,
    pub(crate) trace: Option<PanicTrace>,
}

impl PanicCapture {
    /// Wraps a payload returned by `catch_unwind`, taking the pending trace
    /// record for this thread.
    pub(crate) fn from_unwind(payload: Box<dyn Any + Send>) -> Self {
        Self {
            payload,
            trace: take_trace(),
        }
    }

    /// Resumes the unwind on the current thread.
    ///
    /// On a loop thread the trace is put back into the thread-local slot
    /// first, so the next catch site up the stack sees the original throw
    /// site rather than this resume point. Elsewhere nothing is recorded.
    pub(crate) fn resume(self) -> ! {
        restore_trace(self.trace);
        std::panic::resume_unwind(self.payload)
    }
}

impl fmt::Debug for PanicCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicCapture")
            .field("message", &payload_message(&*self.payload))
            .field("trace", &self.trace)
            .finish()
    }
}

/// Extracts the message of a `&str` or `String` payload.
#[must_use]
pub fn payload_message(payload: &(dyn Any + Send)) -> Option<String> {
    payload
        .downcast_ref::<&'static str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
}

/// Marks the current thread as a loop thread while alive.
pub(crate) struct LoopThreadGuard {
    previous: TraceMode,
}

impl LoopThreadGuard {
    pub(crate) fn enter(capture_backtrace: bool) -> Self {
        install_hook();
        let mode = if capture_backtrace {
            TraceMode::WithBacktrace
        } else {
            TraceMode::LocationOnly
        };
        let previous = MODE.with(|m| m.replace(mode));
        Self { previous }
    }
}

impl Drop for LoopThreadGuard {
    fn drop(&mut self) {
        MODE.with(|m| m.set(self.previous));
        LAST_TRACE.with(|slot| slot.borrow_mut().take());
    }
}

fn install_hook() {
    HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let mode = MODE.try_with(Cell::get).unwrap_or(TraceMode::Off);
            if mode != TraceMode::Off {
                let backtrace = (mode == TraceMode::WithBacktrace)
                    .then(Backtrace::capture)
                    .filter(|bt| bt.status() == BacktraceStatus::Captured)
                    .map(|bt| bt.to_string());
                let trace = PanicTrace {
                    location: info.location().map(ToString::to_string),
                    backtrace,
                };
                let _ = LAST_TRACE.try_with(|slot| *slot.borrow_mut() = Some(trace));
            }
            previous(info);
        }));
    });
}

/// The trace slot is only used while a loop thread guard is active; anything
/// left there on other threads would attach to an unrelated panic later.
fn recording() -> bool {
    MODE.try_with(Cell::get).is_ok_and(|mode| mode != TraceMode::Off)
}

fn take_trace() -> Option<PanicTrace> {
    if !recording() {
        return None;
    }
    LAST_TRACE.try_with(|slot| slot.borrow_mut().take()).ok().flatten()
}

fn restore_trace(trace: Option<PanicTrace>) {
    if recording() {
        let _ = LAST_TRACE.try_with(|slot| *slot.borrow_mut() = trace);
    }
}
