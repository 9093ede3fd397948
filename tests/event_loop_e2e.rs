//! Priority dispatch through the public surface: a bare loop on a scratch
//! thread, and test bodies run by the harness.
//!
//! Run with: `cargo test --test event_loop_e2e`

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
    capabilities, yield_now, AsyncTest, AsyncTestCapability, AutoTest, CapabilityDecl,
    CapabilityStates, DeclaresCapabilities, Dispatcher, ErrorKind, EventLoop, HarnessConfig,
    Priority,
};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

fn init_test(name: &str) {
    common::init_test_logging();
    test_phase!(name);
}

type Journal = Arc<Mutex<Vec<&'static str>>>;

fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

fn note(journal: &Journal, entry: &'static str) -> impl FnOnce() + 'static {
    let journal = Arc::clone(journal);
    move || journal.lock().push(entry)
}

struct DispatchTests {
    states: CapabilityStates,
}

impl DispatchTests {
    fn new() -> Self {
        Self {
            states: Self::new_capability_states(),
        }
    }
}

impl DeclaresCapabilities for DispatchTests {
    fn declared_capabilities() -> Vec<CapabilityDecl> {
        capabilities![AsyncTestCapability]
    }
}

impl AutoTest for DispatchTests {
    fn capability_states(&self) -> &CapabilityStates {
        &self.states
    }

    fn capability_states_mut(&mut self) -> &mut CapabilityStates {
        &mut self.states
    }
}

impl AsyncTest for DispatchTests {
    fn harness_config(&self) -> HarnessConfig {
        HarnessConfig::new().thread_name("dispatch-loop")
    }
}

#[test]
fn render_beats_idle_queued_first() {
    init_test("render_beats_idle_queued_first");
    let order = journal();
    let sink = Arc::clone(&order);
    DispatchTests::new().run_test_async(move || async move {
        let dispatcher = Dispatcher::current().expect("on loop");
        let a = dispatcher.invoke_async(Priority::SYSTEM_IDLE, note(&sink, "A"));
        let b = dispatcher.invoke_async(Priority::RENDER, note(&sink, "B"));
        a.await;
        b.await;
    });
    let order = order.lock().clone();
    assert_with_log!(order == ["B", "A"], "render before idle", ["B", "A"], order);
}

#[test]
fn equal_priority_is_fifo_and_higher_runs_first() {
    init_test("equal_priority_is_fifo_and_higher_runs_first");
    let order = journal();
    let sink = Arc::clone(&order);
    DispatchTests::new().run_test_async(move || async move {
        let dispatcher = Dispatcher::current().expect("on loop");
        let ops = [
            dispatcher.invoke_async(Priority::BACKGROUND, note(&sink, "bg-1")),
            dispatcher.invoke_async(Priority::INPUT, note(&sink, "input-1")),
            dispatcher.invoke_async(Priority::BACKGROUND, note(&sink, "bg-2")),
            dispatcher.invoke_async(Priority::INPUT, note(&sink, "input-2")),
        ];
        for op in ops {
            op.await;
        }
    });
    let order = order.lock().clone();
    assert_with_log!(
        order == ["input-1", "input-2", "bg-1", "bg-2"],
        "priority then FIFO",
        ["input-1", "input-2", "bg-1", "bg-2"],
        order
    );
}

#[test]
fn continuation_stays_on_loop_thread() {
    init_test("continuation_stays_on_loop_thread");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    DispatchTests::new().run_test_async(move || async move {
        let dispatcher = Dispatcher::current().expect("on loop");
        sink.lock().push(thread::current().id());
        dispatcher.invoke_async(Priority::BACKGROUND, || ()).await;
        sink.lock().push(thread::current().id());
        yield_now().await;
        sink.lock().push(thread::current().id());
    });
    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|id| *id == seen[0]));
    assert_ne!(seen[0], thread::current().id(), "body ran on a dedicated thread");
}

async fn failing_async_body() {
    Dispatcher::current()
        .expect("on loop")
        .invoke_async(Priority::INPUT, || ())
        .await;
    panic!("async body failed");
}

#[test]
fn sync_and_async_failures_surface_alike() {
    init_test("sync_and_async_failures_surface_alike");
    let test = DispatchTests::new();
    let sync = test
        .try_run_test(|| -> () { panic!("sync body failed") })
        .expect_err("sync fails");
    let r#async = test
        .try_run_test_async(failing_async_body)
        .expect_err("async fails");
    for (err, expected) in [(sync, "sync body failed"), (r#async, "async body failed")] {
        assert_eq!(err.kind(), ErrorKind::TestFailed);
        let message = err.failure().map(|f| f.message()).unwrap_or_default();
        assert_with_log!(message == expected, "failure message", expected, message);
    }
}

#[test]
fn bare_loop_serves_other_threads() {
    init_test("bare_loop_serves_other_threads");
    let (tx, rx) = std::sync::mpsc::channel();
    let worker = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("fresh thread");
        tx.send(event_loop.handle()).expect("send handle");
        let local = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&local);
        event_loop.dispatcher().begin_invoke(Priority::NORMAL, move || {
            sink.borrow_mut().push("local");
        });
        event_loop.run().expect("clean shutdown");
        let local = local.borrow().clone();
        local
    });

    let handle = rx.recv().expect("handle");
    let order = journal();
    assert!(handle.post(Priority::INPUT, note(&order, "posted")));
    assert!(handle.begin_shutdown(Priority::SYSTEM_IDLE));
    let local = worker.join().expect("loop thread");

    assert_eq!(local, ["local"]);
    assert_eq!(*order.lock(), ["posted"]);
    assert!(handle.is_shutdown());
    assert!(!handle.post(Priority::SEND, || ()), "closed loop refuses work");
}
