//! Running one test body on its own loop thread.

use super::event_loop::EventLoop;
use super::priority::Priority;
use crate::bridge::capture::{LoopThreadGuard, PanicCapture};
use crate::bridge::CapturedFailure;
use crate::config::HarnessConfig;
use crate::error::{Error, ErrorKind, Result};
use crate::isolation::IsolationBoundary;
use crate::tracing_compat::{debug, info};
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::thread;

/// Outcome slot filled by the root task: `Some(None)` for success.
type BodySlot = Rc<RefCell<Option<Option<CapturedFailure>>>>;

/// Runs the body produced by `factory` on a fresh event loop in a new thread
/// and blocks until it finishes.
///
/// `factory` is called on the loop thread, inside `origin` when one is given,
/// and its future is spawned as the first task at [`Priority::NORMAL`]. The
/// loop stops as soon as the body completes. A body failure is returned as a
/// `TestFailed` error; a panic elsewhere on the loop is a `LoopFaulted` error.
/// When both happen the body failure wins.
pub fn run_on_dedicated_thread<F, Fut>(
    config: &HarnessConfig,
    origin: Option<IsolationBoundary>,
    factory: F,
) -> Result<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<(), CapturedFailure>> + 'static,
{
    config.validate()?;
    let capture_backtrace = config.capture_backtrace;
    let capacity = config.inbox_capacity;
    let boundary = origin.as_ref().map(IsolationBoundary::id);

    let mut builder = thread::Builder::new().name(config.thread_name.clone());
    if let Some(size) = config.thread_stack_size {
        builder = builder.stack_size(size);
    }
    info!(thread = %config.thread_name, boundary = ?boundary, "starting dedicated loop thread");

    let worker = builder
        .spawn(move || {
            let _inside = origin.as_ref().map(IsolationBoundary::enter);
            let _traces = LoopThreadGuard::enter(capture_backtrace);
            drive(capacity, factory)
        })
        .map_err(|e| Error::internal(format!("failed to start loop thread: {e}")))?;

    let outcome = match worker.join() {
        Ok(outcome) => outcome,
        Err(payload) => Err(Error::loop_faulted(CapturedFailure::from_panic(
            PanicCapture::from_unwind(payload),
        ))),
    };
    debug!(ok = outcome.is_ok(), "dedicated loop thread joined");
    outcome
}

fn drive<F, Fut>(capacity: usize, factory: F) -> Result<()>
where
    F: FnOnce() -> Fut + 'static,
    Fut: Future<Output = std::result::Result<(), CapturedFailure>> + 'static,
{
    let event_loop = EventLoop::with_capacity(capacity)?;
    let dispatcher = event_loop.dispatcher();
    let body: BodySlot = Rc::new(RefCell::new(None));

    let sink = Rc::clone(&body);
    let stopper = dispatcher.clone();
    dispatcher.spawn_with(Priority::NORMAL, async move { factory().await }, move |result| {
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(failure)) => Some(failure),
            Err(capture) => Some(CapturedFailure::from_panic(capture)),
        };
        *sink.borrow_mut() = Some(failure);
        stopper.invoke_shutdown();
    });

    let run = event_loop.run();
    drop(dispatcher);
    drop(event_loop);
    let completed = body.borrow_mut().take();
    match (completed, run) {
        (Some(Some(failure)), _) => Err(Error::test_failed(failure)),
        (Some(None), run) | (None, run @ Err(_)) => run,
        (None, Ok(())) => Err(Error::new(ErrorKind::LoopFaulted)
            .with_message("event loop shut down before the test body completed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Dispatcher;
    use crate::test_utils::init_test_logging;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn config() -> HarnessConfig {
        HarnessConfig::new().thread_name("dedicated-test-loop")
    }

    #[test]
    fn body_runs_on_named_loop_thread() {
        init_test("body_runs_on_named_loop_thread");
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        run_on_dedicated_thread(&config(), None, move || async move {
            let name = thread::current().name().map(str::to_owned);
            *sink.lock() = Some((name, Dispatcher::current().is_some()));
            Ok(())
        })
        .expect("body succeeds");
        let seen = seen.lock().clone();
        crate::assert_with_log!(
            seen == Some((Some("dedicated-test-loop".to_owned()), true)),
            "thread name and dispatcher",
            "dedicated-test-loop",
            seen
        );
        crate::test_complete!("body_runs_on_named_loop_thread");
    }

    #[test]
    fn body_panic_is_a_test_failure_with_location() {
        init_test("body_panic_is_a_test_failure_with_location");
        fn explode() -> std::result::Result<(), CapturedFailure> {
            panic!("body exploded")
        }
        let err = run_on_dedicated_thread(&config(), None, || async { explode() })
            .expect_err("body fails");
        assert_eq!(err.kind(), ErrorKind::TestFailed);
        let failure = err.failure().expect("failure carried");
        assert_eq!(failure.message(), "body exploded");
        assert!(failure.origin().is_home());
        let location = failure.trace().and_then(|t| t.location.clone()).unwrap_or_default();
        crate::assert_with_log!(
            location.contains("dedicated.rs"),
            "throw site recorded",
            "dedicated.rs",
            location
        );
        crate::test_complete!("body_panic_is_a_test_failure_with_location");
    }

    #[test]
    fn early_shutdown_is_a_loop_fault() {
        init_test("early_shutdown_is_a_loop_fault");
        let err = run_on_dedicated_thread(&config(), None, || async {
            let dispatcher = Dispatcher::current().expect("on loop");
            dispatcher.invoke_shutdown();
            std::future::pending::<()>().await;
            Ok(())
        })
        .expect_err("body never completes");
        assert_eq!(err.kind(), ErrorKind::LoopFaulted);
        crate::test_complete!("early_shutdown_is_a_loop_fault");
    }

    #[test]
    fn invalid_config_is_rejected_before_spawning() {
        init_test("invalid_config_is_rejected_before_spawning");
        let err = run_on_dedicated_thread(&HarnessConfig::new().thread_stack_size(1), None, || async {
            Ok(())
        })
        .expect_err("stack too small");
        assert_eq!(err.kind(), ErrorKind::Config);
        crate::test_complete!("invalid_config_is_rejected_before_spawning");
    }
}
