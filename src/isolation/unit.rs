//! Code units: loadable tables of test types, methods, failure types, and
//! entry points.
//!
//! A [`CodeUnit`] is a `static` declaration. Loading it runs its loader
//! against a fresh [`UnitBuilder`], so every load produces an independent
//! [`LoadedUnit`]. Nothing built by one load is reachable from another.
//!
//! ```ignore
//! static SUITE: CodeUnit = CodeUnit::new("thermal::suite", load_suite);
//!
//! fn load_suite(unit: &mut UnitBuilder) {
//!     unit.type_entry::<ThermalSuite>("ThermalSuite")
//!         .instance_method("overheats", ThermalSuite::overheats)
//!         .instance_method_async("overheats_async", ThermalSuite::overheats_async);
//!     unit.failure_type::<Overheated>();
//! }
//! ```

use super::boundary::IsolationBoundary;
use super::BoundaryId;
use crate::error::{Error, ErrorContext, Result};
use crate::runner::{BoxedBody, TestOutcome};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

/// Builds the contents of a unit on each load.
pub type LoaderFn = fn(&mut UnitBuilder);

/// Name-addressed entry point taking an encoded request.
pub type EntryFn = fn(&IsolationBoundary, &[u8]) -> Result<()>;

/// Produces a fresh body future for one invocation of a method.
pub(crate) type MethodInvoker = Arc<dyn Fn() -> BoxedBody + Send + Sync>;

/// A static declaration of loadable code.
pub struct CodeUnit {
    location: &'static str,
    loader: LoaderFn,
}

impl CodeUnit {
    /// Declares a unit found at `location`.
    pub const fn new(location: &'static str, loader: LoaderFn) -> Self {
        Self { location, loader }
    }

    /// Where the unit is found in the [`UnitCatalog`].
    #[must_use]
    pub const fn location(&self) -> &'static str {
        self.location
    }

    /// Loads a fresh copy of the unit on behalf of `boundary`.
    pub(crate) fn load(&'static self, boundary: BoundaryId) -> LoadedUnit {
        let mut builder = UnitBuilder {
            types: HashMap::new(),
            failure_types: Vec::new(),
            entry_points: HashMap::new(),
        };
        (self.loader)(&mut builder);
        LoadedUnit {
            unit: self,
            boundary,
            types: builder.types,
            failure_types: builder.failure_types,
            entry_points: builder.entry_points,
        }
    }
}

impl fmt::Debug for CodeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeUnit")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Whether a test body is a plain function or a future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BodyShape {
    /// Runs to completion in one call.
    Sync,
    /// Returns a future driven by the loop.
    Async,
}

impl fmt::Display for BodyShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sync => "sync",
            Self::Async => "async",
        })
    }
}

#[derive(Clone)]
struct MethodEntry {
    shape: BodyShape,
    instance: bool,
    invoke: MethodInvoker,
}

#[derive(Default, Clone)]
struct TypeEntry {
    methods: HashMap<String, MethodEntry>,
}

/// Describes and encodes one failure type registered by a unit.
#[derive(Clone, Copy)]
pub struct FailureType {
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) describe: fn(&(dyn Any + Send)) -> Option<String>,
    pub(crate) encode: fn(&(dyn Any + Send)) -> Option<serde_json::Result<serde_json::Value>>,
}

impl fmt::Debug for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FailureType").field(&self.type_name).finish()
    }
}

fn describe_as<F: fmt::Display + 'static>(payload: &(dyn Any + Send)) -> Option<String> {
    payload.downcast_ref::<F>().map(ToString::to_string)
}

fn encode_as<F: Serialize + 'static>(
    payload: &(dyn Any + Send),
) -> Option<serde_json::Result<serde_json::Value>> {
    payload.downcast_ref::<F>().map(serde_json::to_value)
}

/// Collects the contents of one load of a unit.
pub struct UnitBuilder {
    types: HashMap<String, TypeEntry>,
    failure_types: Vec<FailureType>,
    entry_points: HashMap<String, EntryFn>,
}

impl UnitBuilder {
    /// Declares a test type whose instances are built with `Default`.
    pub fn type_entry<T: Default + 'static>(&mut self, name: &str) -> TypeBuilder<'_, T> {
        TypeBuilder {
            entry: self.types.entry(name.to_owned()).or_default(),
            _receiver: PhantomData,
        }
    }

    /// Declares a type that only has static methods.
    pub fn static_type(&mut self, name: &str) -> TypeBuilder<'_, NoReceiver> {
        TypeBuilder {
            entry: self.types.entry(name.to_owned()).or_default(),
            _receiver: PhantomData,
        }
    }

    /// Registers `F` as a failure type that may cross out of the boundary.
    pub fn failure_type<F>(&mut self) -> &mut Self
    where
        F: Serialize + fmt::Display + Send + 'static,
    {
        let type_id = TypeId::of::<F>();
        if !self.failure_types.iter().any(|t| t.type_id == type_id) {
            self.failure_types.push(FailureType {
                type_id,
                type_name: std::any::type_name::<F>(),
                describe: describe_as::<F>,
                encode: encode_as::<F>,
            });
        }
        self
    }

    /// Registers a name-addressed entry point.
    pub fn entry_point(&mut self, name: &str, entry: EntryFn) -> &mut Self {
        self.entry_points.insert(name.to_owned(), entry);
        self
    }
}

/// Receiver marker for types declared with [`UnitBuilder::static_type`].
#[derive(Debug)]
pub enum NoReceiver {}

/// Adds methods to one declared type.
pub struct TypeBuilder<'a, T> {
    entry: &'a mut TypeEntry,
    _receiver: PhantomData<fn() -> T>,
}

impl<T> TypeBuilder<'_, T> {
    fn insert(&mut self, name: &str, shape: BodyShape, instance: bool, invoke: MethodInvoker) {
        self.entry.methods.insert(
            name.to_owned(),
            MethodEntry {
                shape,
                instance,
                invoke,
            },
        );
    }

    /// A sync method with no receiver.
    pub fn static_method<F, O>(mut self, name: &str, method: F) -> Self
    where
        F: Fn() -> O + Send + Sync + 'static,
        O: TestOutcome,
    {
        let method = Arc::new(method);
        self.insert(
            name,
            BodyShape::Sync,
            false,
            Arc::new(move || -> BoxedBody {
                let method = Arc::clone(&method);
                Box::pin(async move { method().into_result() })
            }),
        );
        self
    }

    /// An async method with no receiver.
    pub fn static_method_async<F, Fut, O>(mut self, name: &str, method: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + 'static,
        O: TestOutcome,
    {
        let method = Arc::new(method);
        self.insert(
            name,
            BodyShape::Async,
            false,
            Arc::new(move || -> BoxedBody {
                let method = Arc::clone(&method);
                Box::pin(async move { method().await.into_result() })
            }),
        );
        self
    }
}

impl<T: Default + 'static> TypeBuilder<'_, T> {
    /// A sync method called on a freshly constructed instance.
    pub fn instance_method<F, O>(mut self, name: &str, method: F) -> Self
    where
        F: Fn(&mut T) -> O + Send + Sync + 'static,
        O: TestOutcome,
    {
        let method = Arc::new(method);
        self.insert(
            name,
            BodyShape::Sync,
            true,
            Arc::new(move || -> BoxedBody {
                let method = Arc::clone(&method);
                Box::pin(async move {
                    let mut receiver = T::default();
                    method(&mut receiver).into_result()
                })
            }),
        );
        self
    }

    /// An async method that takes a freshly constructed instance by value.
    pub fn instance_method_async<F, Fut, O>(mut self, name: &str, method: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + 'static,
        O: TestOutcome,
    {
        let method = Arc::new(method);
        self.insert(
            name,
            BodyShape::Async,
            true,
            Arc::new(move || -> BoxedBody {
                let method = Arc::clone(&method);
                Box::pin(async move { method(T::default()).await.into_result() })
            }),
        );
        self
    }
}

/// One load of a [`CodeUnit`].
pub struct LoadedUnit {
    unit: &'static CodeUnit,
    boundary: BoundaryId,
    types: HashMap<String, TypeEntry>,
    failure_types: Vec<FailureType>,
    entry_points: HashMap<String, EntryFn>,
}

impl LoadedUnit {
    /// Location of the unit this was loaded from.
    #[must_use]
    pub fn location(&self) -> &'static str {
        self.unit.location
    }

    /// Boundary the unit was loaded into.
    #[must_use]
    pub const fn boundary(&self) -> BoundaryId {
        self.boundary
    }

    /// Names of the declared types.
    #[must_use]
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn context(&self, type_name: Option<&str>, method: Option<&str>) -> ErrorContext {
        ErrorContext {
            boundary: Some(self.boundary),
            unit: Some(self.unit.location.to_owned()),
            type_name: type_name.map(str::to_owned),
            method: method.map(str::to_owned),
        }
    }

    /// Looks up an entry point by name.
    pub fn entry_point(&self, name: &str) -> Result<EntryFn> {
        self.entry_points.get(name).copied().ok_or_else(|| {
            Error::resolve(
                format!("entry point `{name}` not found in `{}`", self.unit.location),
                self.context(None, Some(name)),
            )
        })
    }

    /// Resolves a method and checks it has the requested shape.
    pub(crate) fn resolve_method(
        &self,
        type_name: &str,
        method: &str,
        shape: BodyShape,
    ) -> Result<MethodInvoker> {
        let ty = self.types.get(type_name).ok_or_else(|| {
            Error::resolve(
                format!("type `{type_name}` not found in `{}`", self.unit.location),
                self.context(Some(type_name), None),
            )
        })?;
        let entry = ty.methods.get(method).ok_or_else(|| {
            Error::resolve(
                format!("method `{type_name}::{method}` not found"),
                self.context(Some(type_name), Some(method)),
            )
        })?;
        if entry.shape != shape {
            return Err(Error::resolve(
                format!(
                    "method `{type_name}::{method}` is {}, but a {shape} body was requested",
                    entry.shape
                ),
                self.context(Some(type_name), Some(method)),
            ));
        }
        crate::tracing_compat::trace!(
            boundary = %self.boundary,
            type_name,
            method,
            instance = entry.instance,
            "method resolved"
        );
        Ok(Arc::clone(&entry.invoke))
    }

    /// Registered failure type for `type_id`, if any.
    pub(crate) fn failure_type(&self, type_id: TypeId) -> Option<FailureType> {
        self.failure_types.iter().find(|t| t.type_id == type_id).copied()
    }
}

impl fmt::Debug for LoadedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedUnit")
            .field("location", &self.unit.location)
            .field("boundary", &self.boundary)
            .field("types", &self.type_names())
            .field("failure_types", &self.failure_types)
            .finish_non_exhaustive()
    }
}

/// A located test method: unit, type name, method name.
#[derive(Clone, Copy)]
pub struct MethodRef {
    unit: &'static CodeUnit,
    type_name: &'static str,
    method: &'static str,
}

impl MethodRef {
    /// Names `type_name::method` in `unit`.
    pub const fn new(unit: &'static CodeUnit, type_name: &'static str, method: &'static str) -> Self {
        Self {
            unit,
            type_name,
            method,
        }
    }

    /// The unit declaring the method.
    #[must_use]
    pub const fn unit(&self) -> &'static CodeUnit {
        self.unit
    }

    /// Declaring type name.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Method name.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        self.method
    }

    /// The location-only form passed across a boundary.
    #[must_use]
    pub fn descriptor(&self, shape: BodyShape) -> RemoteCallDescriptor {
        RemoteCallDescriptor {
            location: self.unit.location.to_owned(),
            type_name: self.type_name.to_owned(),
            method: self.method.to_owned(),
            shape,
        }
    }
}

impl fmt::Debug for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::{}", self.unit.location, self.type_name, self.method)
    }
}

/// A method named by strings only, resolved by the receiving boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCallDescriptor {
    /// Unit location in the [`UnitCatalog`].
    pub location: String,
    /// Declaring type name.
    pub type_name: String,
    /// Method name.
    pub method: String,
    /// Body shape the caller expects.
    pub shape: BodyShape,
}

/// Process-wide map from unit location to its declaration.
///
/// The harness unit is always present.
#[derive(Debug)]
pub struct UnitCatalog;

fn catalog() -> &'static RwLock<HashMap<&'static str, &'static CodeUnit>> {
    static CATALOG: OnceLock<RwLock<HashMap<&'static str, &'static CodeUnit>>> = OnceLock::new();
    CATALOG.get_or_init(|| {
        let harness = crate::runner::harness_unit();
        RwLock::new(HashMap::from([(harness.location(), harness)]))
    })
}

impl UnitCatalog {
    /// Makes `unit` resolvable by its location.
    pub fn publish(unit: &'static CodeUnit) {
        catalog().write().insert(unit.location, unit);
    }

    /// Finds the unit published at `location`.
    #[must_use]
    pub fn resolve(location: &str) -> Option<&'static CodeUnit> {
        catalog().read().get(location).copied()
    }

    /// Locations of all published units.
    #[must_use]
    pub fn published() -> Vec<&'static str> {
        let mut locations: Vec<_> = catalog().read().keys().copied().collect();
        locations.sort_unstable();
        locations
    }
}
