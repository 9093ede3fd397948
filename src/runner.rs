//! Test runner orchestration.
//!
//! [`TestRunner`] decides per invocation whether a body runs directly on a
//! dedicated loop thread or inside a fresh isolation boundary, based on the
//! [`AsyncTestState`] of the test instance. Test types get the entry points by
//! implementing [`AsyncTest`]:
//!
//! ```ignore
//! struct PriorityTests { states: CapabilityStates }
//!
//! impl DeclaresCapabilities for PriorityTests {
//!     fn declared_capabilities() -> Vec<CapabilityDecl> {
//!         capabilities![AsyncTestCapability]
//!     }
//! }
//!
//! impl AutoTest for PriorityTests { /* expose `states` */ }
//! impl AsyncTest for PriorityTests {}
//!
//! let test = PriorityTests { states: PriorityTests::new_capability_states() };
//! test.run_test_async(|| async {
//!     let dispatcher = Dispatcher::current().expect("on loop");
//!     dispatcher.invoke_async(Priority::RENDER, || ()).await;
//! });
//! ```
//!
//! Isolated runs need a located body ([`SyncBody::located`] or
//! [`SyncBody::method`]): only names cross the boundary, never closures.

use crate::bridge::{CapturedFailure, ExceptionBridge};
use crate::capability::{AutoTest, Capability, CapabilityStates, StateDecl};
use crate::config::HarnessConfig;
use crate::error::{Error, ErrorContext, Result};
use crate::isolation::{
    current_boundary, BodyShape, CodeUnit, IsolatedContext, IsolationBoundary, MethodRef,
    ReentryRequest, UnitBuilder,
};
use crate::runtime::run_on_dedicated_thread;
use crate::tracing_compat::{debug, info};
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Future produced by a test body, resolved to its outcome.
pub(crate) type BoxedBody = Pin<Box<dyn Future<Output = std::result::Result<(), CapturedFailure>>>>;

type BodyFactory = Box<dyn FnOnce() -> BoxedBody + Send>;

pub(crate) const HARNESS_LOCATION: &str = "affinity_harness::runner";
pub(crate) const REENTER_ENTRY: &str = "TestRunner::reenter";

static HARNESS_UNIT: CodeUnit = CodeUnit::new(HARNESS_LOCATION, load_harness_unit);

/// The harness's own code unit, loaded into every isolation boundary.
pub(crate) fn harness_unit() -> &'static CodeUnit {
    &HARNESS_UNIT
}

fn load_harness_unit(unit: &mut UnitBuilder) {
    unit.static_type("TestRunner");
    unit.entry_point(REENTER_ENTRY, reenter);
}

/// Re-entry inside a boundary: resolve the named method there and run it on a
/// dedicated loop tagged with the boundary.
fn reenter(boundary: &IsolationBoundary, request: &[u8]) -> Result<()> {
    let ReentryRequest { call, config } = serde_json::from_slice(request)
        .map_err(|e| Error::internal(format!("malformed re-entry request: {e}")))?;
    debug!(
        boundary = %boundary.id(),
        unit = %call.location,
        type_name = %call.type_name,
        method = %call.method,
        shape = %call.shape,
        "re-entering harness"
    );
    let invoke = boundary
        .load(&call.location)?
        .resolve_method(&call.type_name, &call.method, call.shape)?;
    run_on_dedicated_thread(&config, Some(boundary.clone()), move || invoke())
}

/// What a test body may return.
///
/// A closure whose body only panics has no return type of its own to infer
/// from, so spell it out: `|| -> () { panic!("...") }`.
pub trait TestOutcome: Sized + 'static {
    /// `Ok` for success, the captured failure otherwise.
    fn into_result(self) -> std::result::Result<(), CapturedFailure>;
}

impl TestOutcome for () {
    fn into_result(self) -> std::result::Result<(), CapturedFailure> {
        Ok(())
    }
}

impl<E> TestOutcome for std::result::Result<(), E>
where
    E: std::error::Error + Send + 'static,
{
    fn into_result(self) -> std::result::Result<(), CapturedFailure> {
        self.map_err(CapturedFailure::from_error)
    }
}

/// Per-instance settings of [`AsyncTestCapability`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsyncTestState {
    /// Run bodies inside a fresh, unloadable isolation boundary.
    pub use_isolation: bool,
}

/// Capability giving a test type the async runner entry points.
#[derive(Debug)]
pub struct AsyncTestCapability;

impl Capability for AsyncTestCapability {
    const NAME: &'static str = "async-test";

    fn state() -> Option<StateDecl> {
        Some(StateDecl::of::<AsyncTestState>())
    }
}

/// A synchronous test body.
pub struct SyncBody {
    action: Option<BodyFactory>,
    method: Option<MethodRef>,
}

impl SyncBody {
    /// A body from a closure. Runs only in direct mode.
    pub fn new<F, O>(action: F) -> Self
    where
        F: FnOnce() -> O + Send + 'static,
        O: TestOutcome,
    {
        Self {
            action: Some(Box::new(move || -> BoxedBody {
                Box::pin(async move { action().into_result() })
            })),
            method: None,
        }
    }

    /// A closure that is also reachable by name for isolated runs.
    pub fn located<F, O>(method: MethodRef, action: F) -> Self
    where
        F: FnOnce() -> O + Send + 'static,
        O: TestOutcome,
    {
        Self {
            method: Some(method),
            ..Self::new(action)
        }
    }

    /// A body given only by name, resolved from its code unit.
    #[must_use]
    pub const fn method(method: MethodRef) -> Self {
        Self {
            action: None,
            method: Some(method),
        }
    }

    /// The located method, if any.
    #[must_use]
    pub const fn method_ref(&self) -> Option<&MethodRef> {
        self.method.as_ref()
    }
}

impl<F, O> From<F> for SyncBody
where
    F: FnOnce() -> O + Send + 'static,
    O: TestOutcome,
{
    fn from(action: F) -> Self {
        Self::new(action)
    }
}

impl fmt::Debug for SyncBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncBody")
            .field("has_action", &self.action.is_some())
            .field("method", &self.method)
            .finish()
    }
}

/// An asynchronous test body.
pub struct AsyncBody {
    action: Option<BodyFactory>,
    method: Option<MethodRef>,
}

impl AsyncBody {
    /// A body from a closure returning a future. Runs only in direct mode.
    ///
    /// The closure is called on the loop thread, so the future need not be `Send`.
    pub fn new<F, Fut, O>(action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = O> + 'static,
        O: TestOutcome,
    {
        Self {
            action: Some(Box::new(move || -> BoxedBody {
                Box::pin(async move { action().await.into_result() })
            })),
            method: None,
        }
    }

    /// A closure that is also reachable by name for isolated runs.
    pub fn located<F, Fut, O>(method: MethodRef, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = O> + 'static,
        O: TestOutcome,
    {
        Self {
            method: Some(method),
            ..Self::new(action)
        }
    }

    /// A body given only by name, resolved from its code unit.
    #[must_use]
    pub const fn method(method: MethodRef) -> Self {
        Self {
            action: None,
            method: Some(method),
        }
    }

    /// The located method, if any.
    #[must_use]
    pub const fn method_ref(&self) -> Option<&MethodRef> {
        self.method.as_ref()
    }
}

impl<F, Fut, O> From<F> for AsyncBody
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = O> + 'static,
    O: TestOutcome,
{
    fn from(action: F) -> Self {
        Self::new(action)
    }
}

impl fmt::Debug for AsyncBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncBody")
            .field("has_action", &self.action.is_some())
            .field("method", &self.method)
            .finish()
    }
}

/// Runs test bodies directly or in isolation.
#[derive(Debug, Clone, Default)]
pub struct TestRunner {
    config: HarnessConfig,
    bridge: ExceptionBridge,
}

impl TestRunner {
    /// Runner with the given configuration and the default bridge.
    #[must_use]
    pub fn new(config: HarnessConfig) -> Self {
        Self {
            config,
            bridge: ExceptionBridge::default(),
        }
    }

    /// Uses `bridge` for failures leaving isolation boundaries.
    #[must_use]
    pub fn with_bridge(mut self, bridge: ExceptionBridge) -> Self {
        self.bridge = bridge;
        self
    }

    /// The runner's configuration.
    #[must_use]
    pub const fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Runs a synchronous body.
    pub fn run(&self, states: &CapabilityStates, body: SyncBody) -> Result<()> {
        self.execute(states, BodyShape::Sync, body.action, body.method)
    }

    /// Runs an asynchronous body.
    pub fn run_async(&self, states: &CapabilityStates, body: AsyncBody) -> Result<()> {
        self.execute(states, BodyShape::Async, body.action, body.method)
    }

    fn execute(
        &self,
        states: &CapabilityStates,
        shape: BodyShape,
        action: Option<BodyFactory>,
        method: Option<MethodRef>,
    ) -> Result<()> {
        self.config.validate()?;
        let state = states.get::<AsyncTestState>()?;

        if state.use_isolation {
            let method = method.ok_or_else(|| {
                Error::resolve(
                    "isolated execution needs a located test method",
                    ErrorContext::default(),
                )
            })?;
            info!(method = ?method, %shape, "running test in isolation");
            return IsolatedContext::create()?
                .with_bridge(self.bridge.clone())
                .run(&method, shape, &self.config);
        }

        let origin = current_boundary();
        match (action, method) {
            (Some(action), _) => {
                debug!(%shape, "running test directly");
                run_on_dedicated_thread(&self.config, origin, action)
            }
            (None, Some(method)) => {
                debug!(method = ?method, %shape, "running located test directly");
                let invoke = method
                    .unit()
                    .load(crate::isolation::current_boundary_id())
                    .resolve_method(method.type_name(), method.method(), shape)?;
                run_on_dedicated_thread(&self.config, origin, move || invoke())
            }
            (None, None) => Err(Error::internal("test body has neither an action nor a method")),
        }
    }
}

/// Runner entry points for test types declaring [`AsyncTestCapability`].
pub trait AsyncTest: AutoTest {
    /// Configuration for this test type's runs.
    fn harness_config(&self) -> HarnessConfig {
        HarnessConfig::from_env()
    }

    /// Runs a sync body and returns its outcome.
    fn try_run_test(&self, body: impl Into<SyncBody>) -> Result<()> {
        TestRunner::new(self.harness_config()).run(self.capability_states(), body.into())
    }

    /// Runs an async body and returns its outcome.
    fn try_run_test_async(&self, body: impl Into<AsyncBody>) -> Result<()> {
        TestRunner::new(self.harness_config()).run_async(self.capability_states(), body.into())
    }

    /// Runs a sync body, re-raising any failure on the calling thread.
    fn run_test(&self, body: impl Into<SyncBody>) {
        if let Err(err) = self.try_run_test(body) {
            err.rethrow();
        }
    }

    /// Runs an async body, re-raising any failure on the calling thread.
    fn run_test_async(&self, body: impl Into<AsyncBody>) {
        if let Err(err) = self.try_run_test_async(body) {
            err.rethrow();
        }
    }
}
