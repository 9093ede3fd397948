//! Isolated execution end to end: failures crossing the boundary, release,
//! and static state separation.
//!
//! Run with: `cargo test --test isolation_e2e`

mod common {
    pub fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_test_writer()
            .try_init();
    }
}

/// Phase tracking macro for structured test logging.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Assertion with logging for better test output.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

use affinity_harness::{
    capabilities, unit_static, AsyncBody, AsyncTest, AsyncTestCapability, AsyncTestState,
    AutoTest, BodyShape, CapabilityDecl, CapabilityStates, CodeUnit, DeclaresCapabilities,
    Dispatcher, ErrorKind, EventLoop, HarnessConfig, IsolatedContext, MethodRef, Priority,
    RemoteFailure, SyncBody, UnitBuilder,
};
use serde::Serialize;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

fn init_test(name: &str) {
    common::init_test_logging();
    test_phase!(name);
}

#[derive(Debug, Serialize)]
struct Overheated {
    kelvin: u32,
}

impl fmt::Display for Overheated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core at {}K", self.kelvin)
    }
}

impl std::error::Error for Overheated {}

/// Never registered with the unit, so it cannot leave a boundary.
#[derive(Debug)]
struct SealedFault;

#[derive(Default)]
struct BootCount(u32);

#[derive(Default)]
struct DirectBootCount(u32);

#[derive(Default)]
struct ThermalSuite;

impl ThermalSuite {
    fn overheats(&mut self) {
        std::panic::panic_any(Overheated { kelvin: 412 });
    }

    async fn overheats_async(self) {
        let dispatcher = Dispatcher::current().expect("body runs on the loop");
        dispatcher.invoke_async(Priority::RENDER, || ()).await;
        std::panic::panic_any(Overheated { kelvin: 413 });
    }

    fn returns_error(&mut self) -> Result<(), Overheated> {
        Err(Overheated { kelvin: 500 })
    }

    fn sealed(&mut self) {
        std::panic::panic_any(SealedFault);
    }

    fn passes(&mut self) {}

    fn first_boot(&mut self) {
        let boots = unit_static::<BootCount, _>(|count| {
            count.0 += 1;
            count.0
        });
        assert_eq!(boots, 1, "boundary statics start fresh");
    }

    fn direct_boot(&mut self) {
        unit_static::<DirectBootCount, _>(|count| count.0 += 1);
    }

    fn nested(&mut self) -> Result<(), affinity_harness::Error> {
        IsolatedContext::create().map(drop)
    }
}

fn load_thermal(unit: &mut UnitBuilder) {
    unit.type_entry::<ThermalSuite>("ThermalSuite")
        .instance_method("overheats", ThermalSuite::overheats)
        .instance_method_async("overheats_async", ThermalSuite::overheats_async)
        .instance_method("returns_error", ThermalSuite::returns_error)
        .instance_method("sealed", ThermalSuite::sealed)
        .instance_method("passes", ThermalSuite::passes)
        .instance_method("first_boot", ThermalSuite::first_boot)
        .instance_method("direct_boot", ThermalSuite::direct_boot)
        .instance_method("nested", ThermalSuite::nested);
    unit.failure_type::<Overheated>();
}

static THERMAL: CodeUnit = CodeUnit::new("isolation_e2e::thermal", load_thermal);

const fn method(name: &'static str) -> MethodRef {
    MethodRef::new(&THERMAL, "ThermalSuite", name)
}

struct ThermalTests {
    states: CapabilityStates,
}

impl ThermalTests {
    fn new(use_isolation: bool) -> Self {
        let mut test = Self {
            states: Self::new_capability_states(),
        };
        test.state_mut::<AsyncTestState>()
            .expect("capability declared")
            .use_isolation = use_isolation;
        test
    }
}

impl DeclaresCapabilities for ThermalTests {
    fn declared_capabilities() -> Vec<CapabilityDecl> {
        capabilities![AsyncTestCapability]
    }
}

impl AutoTest for ThermalTests {
    fn capability_states(&self) -> &CapabilityStates {
        &self.states
    }

    fn capability_states_mut(&mut self) -> &mut CapabilityStates {
        &mut self.states
    }
}

impl AsyncTest for ThermalTests {
    fn harness_config(&self) -> HarnessConfig {
        HarnessConfig::new().thread_name("thermal-loop")
    }
}

#[test]
fn direct_failure_keeps_its_type() {
    init_test("direct_failure_keeps_its_type");
    let test = ThermalTests::new(false);
    let payload = catch_unwind(AssertUnwindSafe(|| {
        test.run_test(SyncBody::method(method("overheats")));
    }))
    .expect_err("body panics");
    let original = payload.downcast_ref::<Overheated>().map(|o| o.kelvin);
    assert_with_log!(original == Some(412), "original payload", Some(412), original);
}

#[test]
fn isolated_failure_arrives_as_remote_failure() {
    init_test("isolated_failure_arrives_as_remote_failure");
    let test = ThermalTests::new(true);
    let payload = catch_unwind(AssertUnwindSafe(|| {
        test.run_test(SyncBody::method(method("overheats")));
    }))
    .expect_err("body panics");

    assert!(payload.downcast_ref::<Overheated>().is_none());
    let remote = payload
        .downcast_ref::<RemoteFailure>()
        .expect("reconstructed as a home type");
    assert_with_log!(
        remote.to_string().contains("core at 412K"),
        "message preserved",
        "core at 412K",
        remote.to_string()
    );
    assert!(remote.type_name().ends_with("Overheated"));
    assert!(!remote.origin().is_home());
    let location = remote.trace().and_then(|t| t.location.clone()).unwrap_or_default();
    assert_with_log!(
        location.contains("isolation_e2e.rs"),
        "throw site survives the trip",
        "isolation_e2e.rs",
        location
    );
}

#[test]
fn isolated_async_and_returned_failures_cross() {
    init_test("isolated_async_and_returned_failures_cross");
    let test = ThermalTests::new(true);

    let err = test
        .try_run_test_async(AsyncBody::method(method("overheats_async")))
        .expect_err("async body panics");
    assert_eq!(err.kind(), ErrorKind::TestFailed);
    let failure = err.failure().expect("failure carried");
    assert!(failure.is::<RemoteFailure>());
    assert!(failure.message().contains("core at 413K"));

    let err = test
        .try_run_test(SyncBody::method(method("returns_error")))
        .expect_err("body returns Err");
    let remote = err
        .failure()
        .and_then(|f| f.downcast_ref::<RemoteFailure>())
        .expect("returned error reconstructed");
    #[derive(serde::Deserialize)]
    struct Reading {
        kelvin: u32,
    }
    let reading: Reading = remote.body_as().expect("body").expect("decodes");
    assert_eq!(reading.kelvin, 500);
}

#[test]
fn unregistered_failure_is_a_bridge_error() {
    init_test("unregistered_failure_is_a_bridge_error");
    let err = ThermalTests::new(true)
        .try_run_test(SyncBody::method(method("sealed")))
        .expect_err("sealed fault cannot cross");
    assert_with_log!(
        err.kind() == ErrorKind::Bridge,
        "visibly different failure",
        ErrorKind::Bridge,
        err.kind()
    );
    assert!(err.failure().is_none());
}

#[test]
fn boundary_is_reclaimed_after_success_and_failure() {
    init_test("boundary_is_reclaimed_after_success_and_failure");
    let config = HarnessConfig::new().thread_name("witnessed-loop");
    for name in ["passes", "overheats", "sealed"] {
        let context = IsolatedContext::create().expect("create context");
        let witness = context.witness();
        let outcome = context.run(&method(name), BodyShape::Sync, &config);
        assert_eq!(outcome.is_ok(), name == "passes");
        assert_with_log!(
            witness.is_reclaimed(),
            "no loaded unit survives the run",
            0,
            witness.live_units()
        );
        assert_eq!(witness.loaded_count(), 2, "harness unit plus test unit");
    }
}

#[test]
fn sequential_isolated_runs_do_not_share_statics() {
    init_test("sequential_isolated_runs_do_not_share_statics");
    let test = ThermalTests::new(true);
    test.try_run_test(SyncBody::method(method("first_boot")))
        .expect("first isolated run");
    test.try_run_test(SyncBody::method(method("first_boot")))
        .expect("second isolated run starts fresh");
}

#[test]
fn direct_runs_share_home_statics() {
    init_test("direct_runs_share_home_statics");
    let test = ThermalTests::new(false);
    for _ in 0..2 {
        test.run_test(SyncBody::method(method("direct_boot")));
    }
    let boots = unit_static::<DirectBootCount, _>(|count| count.0);
    assert_with_log!(boots == 2, "home statics persist", 2, boots);
}

#[test]
fn nested_isolation_is_rejected() {
    init_test("nested_isolation_is_rejected");
    let err = ThermalTests::new(true)
        .try_run_test(SyncBody::method(method("nested")))
        .expect_err("nested request fails");
    let inner = err
        .failure()
        .and_then(|f| f.downcast_ref::<affinity_harness::Error>())
        .map(affinity_harness::Error::kind);
    assert_with_log!(
        inner == Some(ErrorKind::NestedIsolation),
        "explicit nested isolation error",
        Some(ErrorKind::NestedIsolation),
        inner
    );
}

#[test]
fn located_closure_runs_directly_and_by_name_in_isolation() {
    init_test("located_closure_runs_directly_and_by_name_in_isolation");
    let body = || SyncBody::located(method("passes"), || ());
    ThermalTests::new(false).run_test(body());
    ThermalTests::new(true).run_test(body());
}

#[test]
fn rethrown_trace_does_not_stick_to_later_faults() {
    init_test("rethrown_trace_does_not_stick_to_later_faults");
    let test = ThermalTests::new(true);
    let first = catch_unwind(AssertUnwindSafe(|| {
        test.run_test(SyncBody::method(method("overheats")));
    }));
    assert!(first.is_err());

    // A loop driven on the caller's own thread afterwards.
    let err = {
        let event_loop = EventLoop::new().expect("caller thread has no loop");
        let dispatcher = event_loop.dispatcher();
        dispatcher.begin_invoke(Priority::NORMAL, || panic!("second fault"));
        dispatcher.begin_invoke_shutdown(Priority::SYSTEM_IDLE);
        event_loop.run().expect_err("stray panic faults the loop")
    };
    let failure = err.failure().expect("fault carries the panic");
    assert_eq!(failure.message(), "second fault");
    let location = failure.trace().and_then(|t| t.location.clone());
    assert_with_log!(
        location.is_none(),
        "no throw site borrowed from the earlier failure",
        None::<String>,
        location
    );
}
