//! Isolation boundaries and their reclamation witness.

use super::unit::{FailureType, LoadedUnit, UnitCatalog};
use super::{BoundaryId, CURRENT_BOUNDARY};
use crate::error::{Error, ErrorContext, ErrorKind, Result};
use crate::tracing_compat::{debug, info};
use parking_lot::Mutex;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type StaticSlots = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// Boundaries that have been created and not yet released.
fn live() -> &'static Mutex<HashMap<BoundaryId, Weak<BoundaryInner>>> {
    static LIVE: OnceLock<Mutex<HashMap<BoundaryId, Weak<BoundaryInner>>>> = OnceLock::new();
    LIVE.get_or_init(|| Mutex::new(HashMap::new()))
}

struct BoundaryInner {
    id: BoundaryId,
    released: AtomicBool,
    units: Mutex<HashMap<&'static str, Arc<LoadedUnit>>>,
    statics: Mutex<StaticSlots>,
    /// Every unit ever loaded here, for the witness.
    loaded: Arc<Mutex<Vec<Weak<LoadedUnit>>>>,
}

/// One isolated execution context.
///
/// Units loaded here are private to the boundary. [`release`](Self::release)
/// drops all of them and refuses further dispatch.
#[derive(Clone)]
pub struct IsolationBoundary {
    inner: Arc<BoundaryInner>,
}

impl IsolationBoundary {
    /// Creates a boundary.
    ///
    /// Fails with `NestedIsolation` when called from code already running
    /// inside a boundary.
    pub fn create() -> Result<Self> {
        if let Some(outer) = super::current_boundary() {
            return Err(Error::new(ErrorKind::NestedIsolation)
                .with_message(format!("cannot create a boundary from inside {}", outer.id()))
                .with_context(ErrorContext {
                    boundary: Some(outer.id()),
                    ..ErrorContext::default()
                }));
        }
        let id = BoundaryId::new(NEXT_ID.fetch_add(1, Ordering::Relaxed));
        let inner = Arc::new(BoundaryInner {
            id,
            released: AtomicBool::new(false),
            units: Mutex::new(HashMap::new()),
            statics: Mutex::new(HashMap::new()),
            loaded: Arc::new(Mutex::new(Vec::new())),
        });
        live().lock().insert(id, Arc::downgrade(&inner));
        debug!(boundary = %id, "isolation boundary created");
        Ok(Self { inner })
    }

    /// Finds a live boundary by id.
    pub(crate) fn lookup(id: BoundaryId) -> Option<Self> {
        if id.is_home() {
            return None;
        }
        live()
            .lock()
            .get(&id)
            .and_then(Weak::upgrade)
            .map(|inner| Self { inner })
    }

    /// The boundary's id.
    #[must_use]
    pub fn id(&self) -> BoundaryId {
        self.inner.id
    }

    /// Returns true once released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_released() {
            Err(Error::released(self.inner.id))
        } else {
            Ok(())
        }
    }

    /// Loads the unit published at `location`, at most once per boundary.
    pub fn load(&self, location: &str) -> Result<Arc<LoadedUnit>> {
        self.ensure_live()?;
        let mut units = self.inner.units.lock();
        if let Some(loaded) = units.get(location) {
            return Ok(Arc::clone(loaded));
        }
        let unit = UnitCatalog::resolve(location).ok_or_else(|| {
            Error::resolve(
                format!("no code unit published at `{location}`"),
                ErrorContext {
                    boundary: Some(self.inner.id),
                    unit: Some(location.to_owned()),
                    ..ErrorContext::default()
                },
            )
        })?;
        let loaded = Arc::new(unit.load(self.inner.id));
        self.inner.loaded.lock().push(Arc::downgrade(&loaded));
        units.insert(unit.location(), Arc::clone(&loaded));
        debug!(boundary = %self.inner.id, unit = location, "code unit loaded");
        Ok(loaded)
    }

    /// Calls the entry point `name` of the unit at `location` with `request`.
    pub fn invoke_entry(&self, location: &str, name: &str, request: &[u8]) -> Result<()> {
        let entry = self.load(location)?.entry_point(name)?;
        debug!(
            boundary = %self.inner.id,
            unit = location,
            entry = name,
            request_bytes = request.len(),
            "invoking entry point"
        );
        entry(self, request)
    }

    /// Registered failure type for `type_id` in any loaded unit.
    pub(crate) fn failure_type(&self, type_id: TypeId) -> Option<FailureType> {
        self.inner
            .units
            .lock()
            .values()
            .find_map(|unit| unit.failure_type(type_id))
    }

    pub(crate) fn with_statics<R>(&self, f: impl FnOnce(&mut StaticSlots) -> R) -> R {
        f(&mut self.inner.statics.lock())
    }

    /// Drops every loaded unit and static, and refuses further dispatch.
    ///
    /// Idempotent.
    pub fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        live().lock().remove(&self.inner.id);
        let units = std::mem::take(&mut *self.inner.units.lock());
        let statics = std::mem::take(&mut *self.inner.statics.lock());
        info!(
            boundary = %self.inner.id,
            units = units.len(),
            statics = statics.len(),
            "isolation boundary released"
        );
        drop(units);
        drop(statics);
    }

    /// A witness that reports whether everything loaded here was reclaimed.
    #[must_use]
    pub fn witness(&self) -> UnloadWitness {
        UnloadWitness {
            boundary: self.inner.id,
            owner: Arc::downgrade(&self.inner),
            loaded: Arc::clone(&self.inner.loaded),
        }
    }

    /// Makes this the current boundary of the calling thread until the guard drops.
    pub(crate) fn enter(&self) -> BoundaryGuard {
        let previous = CURRENT_BOUNDARY.with(|current| current.replace(Some(self.clone())));
        BoundaryGuard { previous }
    }
}

impl fmt::Debug for IsolationBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolationBoundary")
            .field("id", &self.inner.id)
            .field("released", &self.is_released())
            .field("units", &self.inner.units.lock().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Restores the previous current boundary on drop.
pub(crate) struct BoundaryGuard {
    previous: Option<IsolationBoundary>,
}

impl Drop for BoundaryGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = CURRENT_BOUNDARY.try_with(|current| current.replace(previous));
    }
}

/// Observes whether a boundary's loaded code has been reclaimed.
#[derive(Debug, Clone)]
pub struct UnloadWitness {
    boundary: BoundaryId,
    owner: Weak<BoundaryInner>,
    loaded: Arc<Mutex<Vec<Weak<LoadedUnit>>>>,
}

impl UnloadWitness {
    /// The observed boundary.
    #[must_use]
    pub const fn boundary(&self) -> BoundaryId {
        self.boundary
    }

    /// How many units were ever loaded into the boundary.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.loaded.lock().len()
    }

    /// Loaded units still reachable from somewhere.
    #[must_use]
    pub fn live_units(&self) -> usize {
        self.loaded
            .lock()
            .iter()
            .filter(|unit| unit.strong_count() > 0)
            .count()
    }

    /// Returns true once the boundary is released (or gone) and no unit
    /// loaded into it is reachable.
    #[must_use]
    pub fn is_reclaimed(&self) -> bool {
        let released = self
            .owner
            .upgrade()
            .map_or(true, |inner| inner.released.load(Ordering::Acquire));
        released && self.live_units() == 0
    }
}
