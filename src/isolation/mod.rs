//! Isolated execution contexts.
//!
//! An [`IsolationBoundary`] owns private copies of code units. Code running
//! inside it (the loop thread of an isolated run) sees the boundary as its
//! current boundary: failures raised there are tagged with it, and
//! [`unit_static`] resolves against its statics instead of the process-wide
//! home statics. Releasing the boundary drops everything it loaded, which an
//! [`UnloadWitness`] can confirm.
//!
//! Calls cross into a boundary by name only: [`IsolatedContext`] loads the
//! harness unit inside the boundary and invokes its re-entry entry point with
//! an encoded [`RemoteCallDescriptor`]. The boundary resolves the test's unit,
//! type, and method itself.

mod boundary;
mod context;
mod unit;

pub use boundary::{IsolationBoundary, UnloadWitness};
pub use context::IsolatedContext;
pub(crate) use context::ReentryRequest;
pub use unit::{
    BodyShape, CodeUnit, EntryFn, FailureType, LoadedUnit, LoaderFn, MethodRef, NoReceiver,
    RemoteCallDescriptor, TypeBuilder, UnitBuilder, UnitCatalog,
};

use boundary::StaticSlots;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Process-unique boundary identifier. `HOME` is the caller's own side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoundaryId(u64);

impl BoundaryId {
    /// The home boundary.
    pub const HOME: Self = Self(0);

    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns true for the home boundary.
    #[must_use]
    pub const fn is_home(self) -> bool {
        self.0 == 0
    }

    /// Raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BoundaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_home() {
            f.write_str("home boundary")
        } else {
            write!(f, "boundary#{}", self.0)
        }
    }
}

thread_local! {
    static CURRENT_BOUNDARY: RefCell<Option<IsolationBoundary>> = const { RefCell::new(None) };
}

/// The boundary the calling thread is executing in, if any.
#[must_use]
pub fn current_boundary() -> Option<IsolationBoundary> {
    CURRENT_BOUNDARY
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
}

/// Id of the calling thread's boundary; `HOME` outside any boundary.
#[must_use]
pub fn current_boundary_id() -> BoundaryId {
    current_boundary().map_or(BoundaryId::HOME, |b| b.id())
}

fn home_statics() -> &'static Mutex<StaticSlots> {
    static HOME: OnceLock<Mutex<StaticSlots>> = OnceLock::new();
    HOME.get_or_init(|| Mutex::new(HashMap::new()))
}

fn slot_of<T: Default + Send + 'static>(slots: &mut StaticSlots) -> Arc<Mutex<T>> {
    let slot = slots
        .entry(TypeId::of::<T>())
        .or_insert_with(|| Arc::new(Mutex::new(T::default())) as Arc<dyn Any + Send + Sync>);
    // Keyed by `TypeId::of::<T>()`, so the downcast only fails if the map was corrupted.
    Arc::clone(slot).downcast::<Mutex<T>>().unwrap_or_else(|_| {
        let fresh = Arc::new(Mutex::new(T::default()));
        *slot = Arc::clone(&fresh) as Arc<dyn Any + Send + Sync>;
        fresh
    })
}

/// Runs `f` with the unit-level static `T` of the current boundary.
///
/// Each boundary gets its own `T`, created with `Default` on first use and
/// dropped on release. Outside any boundary the process-wide home instance is
/// used. The slot is not locked while other statics are accessed, but calling
/// `unit_static::<T>` for the same `T` from inside `f` deadlocks.
pub fn unit_static<T, R>(f: impl FnOnce(&mut T) -> R) -> R
where
    T: Default + Send + 'static,
{
    let slot = match current_boundary() {
        Some(boundary) => boundary.with_statics(slot_of::<T>),
        None => slot_of::<T>(&mut home_statics().lock()),
    };
    let mut value = slot.lock();
    f(&mut value)
}
