//! Single-threaded priority event loop.
//!
//! An [`EventLoop`] is bound to the thread that creates it. Work enters
//! through its inbox (thread-safe) and always executes on the owning thread:
//!
//! - [`Dispatcher`] is the loop-thread API: spawn futures or invoke closures at
//!   a priority, request shutdown, read the priority of the running action.
//! - [`LoopHandle`] is the `Send` API for other threads: post closures and
//!   request shutdown.
//! - [`Operation`] is the awaitable result of a dispatched action.
//!
//! Each dequeued job runs to completion before the next one is chosen; among
//! pending jobs the highest priority wins, FIFO within a priority. A task that
//! awaits is resumed by its waker through the same inbox, at the task's own
//! priority, so continuations never leave the loop thread.
//!
//! # Example
//!
//! ```ignore
//! let event_loop = EventLoop::new()?;
//! let dispatcher = event_loop.dispatcher();
//! let log = Rc::new(RefCell::new(Vec::new()));
//! let (a, b) = (Rc::clone(&log), Rc::clone(&log));
//! dispatcher.begin_invoke(Priority::APPLICATION_IDLE, move || a.borrow_mut().push("idle"));
//! dispatcher.begin_invoke(Priority::RENDER, move || b.borrow_mut().push("render"));
//! dispatcher.begin_invoke_shutdown(Priority::SYSTEM_IDLE);
//! event_loop.run()?;
//! assert_eq!(*log.borrow(), ["render", "idle"]);
//! ```

use super::inbox::{Inbox, Job};
use super::priority::Priority;
use super::task::{PanicHandler, Task, TaskId, TaskTable};
use super::waker::waker_for;
use crate::bridge::capture::PanicCapture;
use crate::bridge::CapturedFailure;
use crate::error::{Error, Result};
use crate::tracing_compat::{debug, debug_span, trace, warn};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::ThreadId;

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopCore>>> = const { RefCell::new(None) };
}

const DEFAULT_CAPACITY: usize = 64;

struct LoopCore {
    inbox: Arc<Inbox>,
    tasks: RefCell<TaskTable>,
    current_priority: Cell<Option<Priority>>,
    fault: RefCell<Option<CapturedFailure>>,
    thread: ThreadId,
}

impl LoopCore {
    fn spawn_task(
        &self,
        priority: Priority,
        future: Pin<Box<dyn Future<Output = ()>>>,
        on_panic: Option<PanicHandler>,
    ) -> TaskId {
        let id = self.tasks.borrow_mut().insert(Task {
            future,
            priority,
            on_panic,
        });
        if !self.inbox.schedule_poll(id, priority) {
            debug!(task_id = %id, "task spawned after shutdown; it will not run");
        }
        id
    }

    fn record_fault(&self, capture: PanicCapture) {
        let failure = CapturedFailure::from_panic(capture);
        warn!(message = %failure.message(), "event loop faulted; shutting down");
        let mut fault = self.fault.borrow_mut();
        if fault.is_none() {
            *fault = Some(failure);
        }
        drop(fault);
        self.inbox.request_shutdown();
    }

    fn poll_task(&self, id: TaskId) {
        // Taken out of the table while polling so the task can spawn more work.
        let Some(mut task) = self.tasks.borrow_mut().take(id) else {
            trace!(task_id = %id, "stale wake for finished task");
            return;
        };
        let waker = waker_for(&self.inbox, id, task.priority);
        let mut cx = Context::from_waker(&waker);
        let previous = self.current_priority.replace(Some(task.priority));
        let polled = catch_unwind(AssertUnwindSafe(|| task.future.as_mut().poll(&mut cx)));
        self.current_priority.set(previous);

        match polled {
            Ok(Poll::Pending) => self.tasks.borrow_mut().restore(id, task),
            Ok(Poll::Ready(())) => {}
            Err(payload) => {
                let capture = PanicCapture::from_unwind(payload);
                match task.on_panic.take() {
                    Some(handler) => handler(capture),
                    None => self.record_fault(capture),
                }
            }
        }
    }

    fn run_posted(&self, priority: Priority, action: Box<dyn FnOnce() + Send>) {
        let previous = self.current_priority.replace(Some(priority));
        let result = catch_unwind(AssertUnwindSafe(action));
        self.current_priority.set(previous);
        if let Err(payload) = result {
            self.record_fault(PanicCapture::from_unwind(payload));
        }
    }
}

/// A priority event loop bound to the thread that created it.
pub struct EventLoop {
    core: Rc<LoopCore>,
}

impl EventLoop {
    /// Creates a loop bound to the current thread.
    ///
    /// Fails if the thread already owns a loop.
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a loop with a pre-sized queue.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let core = Rc::new(LoopCore {
            inbox: Arc::new(Inbox::with_capacity(capacity)),
            tasks: RefCell::new(TaskTable::default()),
            current_priority: Cell::new(None),
            fault: RefCell::new(None),
            thread: std::thread::current().id(),
        });
        CURRENT.with(|current| {
            let mut current = current.borrow_mut();
            if current.is_some() {
                return Err(Error::internal(
                    "an event loop is already bound to this thread",
                ));
            }
            *current = Some(Rc::clone(&core));
            Ok(())
        })?;
        Ok(Self { core })
    }

    /// The loop-thread API for this loop.
    #[must_use]
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            core: Rc::clone(&self.core),
        }
    }

    /// The cross-thread API for this loop.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inbox: Arc::clone(&self.core.inbox),
        }
    }

    /// Pumps jobs until shutdown is requested.
    ///
    /// Blocks while the queue is empty. Returns a `LoopFaulted` error if a
    /// detached action or posted closure panicked; the first such panic is
    /// reported and stops the loop.
    pub fn run(&self) -> Result<()> {
        let _span = debug_span!("event_loop", thread = ?self.core.thread).entered();
        debug!("event loop started");
        let mut dispatched = 0u64;
        while let Some((priority, job)) = self.core.inbox.next_job() {
            dispatched += 1;
            match job {
                Job::Poll(id) => self.core.poll_task(id),
                Job::Post(action) => self.core.run_posted(priority, action),
                Job::Shutdown => {
                    debug!(%priority, "shutdown job reached");
                    self.core.inbox.request_shutdown();
                }
            }
        }
        let discarded = self.core.inbox.drain().len();
        debug!(dispatched, discarded, "event loop stopped");
        match self.core.fault.borrow_mut().take() {
            Some(failure) => Err(Error::loop_faulted(failure)),
            None => Ok(()),
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.core.inbox.request_shutdown();
        drop(self.core.inbox.drain());
        // Futures may hold dispatchers; dropping them here breaks those cycles
        // and keeps every `!Send` value on its own thread.
        let tasks = self.core.tasks.borrow_mut().drain();
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "dropping unfinished tasks");
        }
        drop(tasks);
        let _ = CURRENT.try_with(|current| current.borrow_mut().take());
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.core.thread)
            .field("tasks", &self.core.tasks.borrow().len())
            .field("pending", &self.core.inbox.pending())
            .finish()
    }
}

/// Loop-thread API. Obtainable only on the loop's own thread.
#[derive(Clone)]
pub struct Dispatcher {
    core: Rc<LoopCore>,
}

impl Dispatcher {
    /// The dispatcher of the loop bound to this thread, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT
            .try_with(|current| current.borrow().as_ref().map(Rc::clone))
            .ok()
            .flatten()
            .map(|core| Self { core })
    }

    /// Spawns `future` as a task at `priority`.
    ///
    /// The task's first poll and every resumption after an await run at
    /// `priority`. A panic inside the future is resumed in whoever awaits the
    /// returned [`Operation`].
    pub fn spawn<F>(&self, priority: Priority, future: F) -> Operation<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let slot = Rc::new(RefCell::new(OperationSlot::Pending(None)));
        let on_success = Rc::clone(&slot);
        let on_failure = Rc::clone(&slot);
        let wrapped = async move {
            let value = future.await;
            OperationSlot::complete(&on_success, Ok(value));
        };
        let id = self.core.spawn_task(
            priority,
            Box::pin(wrapped),
            Some(Box::new(move |capture| OperationSlot::complete(&on_failure, Err(capture)))),
        );
        Operation { slot, task: id }
    }

    /// Schedules `action` at `priority` and returns its awaitable result.
    pub fn invoke_async<R, F>(&self, priority: Priority, action: F) -> Operation<R>
    where
        R: 'static,
        F: FnOnce() -> R + 'static,
    {
        self.spawn(priority, async move { action() })
    }

    /// Schedules `action` at `priority` without a result.
    ///
    /// A panic inside `action` faults the loop.
    pub fn begin_invoke<F>(&self, priority: Priority, action: F)
    where
        F: FnOnce() + 'static,
    {
        self.spawn_detached(priority, async move { action() });
    }

    /// Spawns a future whose panics fault the loop.
    pub fn spawn_detached<F>(&self, priority: Priority, future: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.core.spawn_task(priority, Box::pin(future), None);
    }

    /// Spawns a future and hands its outcome to `on_done` on the loop thread.
    pub(crate) fn spawn_with<F>(
        &self,
        priority: Priority,
        future: F,
        on_done: impl FnOnce(std::result::Result<F::Output, PanicCapture>) + 'static,
    ) where
        F: Future + 'static,
        F::Output: 'static,
    {
        let on_done = Rc::new(Cell::new(Some(on_done)));
        let on_success = Rc::clone(&on_done);
        let wrapped = async move {
            let value = future.await;
            if let Some(done) = on_success.take() {
                done(Ok(value));
            }
        };
        self.core.spawn_task(
            priority,
            Box::pin(wrapped),
            Some(Box::new(move |capture| {
                if let Some(done) = on_done.take() {
                    done(Err(capture));
                }
            })),
        );
    }

    /// Queues a shutdown request at `priority`.
    ///
    /// Work of higher priority, and earlier work of equal priority, still runs.
    pub fn begin_invoke_shutdown(&self, priority: Priority) {
        if !self.core.inbox.push(priority, Job::Shutdown) {
            trace!("shutdown already in progress");
        }
    }

    /// Stops the loop once the running action returns. Pending work is dropped.
    pub fn invoke_shutdown(&self) {
        self.core.inbox.request_shutdown();
    }

    /// Returns true once shutdown has been requested.
    #[must_use]
    pub fn has_shutdown_started(&self) -> bool {
        self.core.inbox.is_shutdown()
    }

    /// Priority of the action currently executing on this loop.
    #[must_use]
    pub fn current_priority(&self) -> Option<Priority> {
        self.core.current_priority.get()
    }

    /// The thread this loop is bound to.
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.core.thread
    }

    /// The cross-thread handle of this loop.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inbox: Arc::clone(&self.core.inbox),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("thread", &self.core.thread)
            .field("current_priority", &self.core.current_priority.get())
            .finish()
    }
}

/// Cross-thread submission handle.
#[derive(Clone)]
pub struct LoopHandle {
    inbox: Arc<Inbox>,
}

impl LoopHandle {
    /// Posts `action` to run on the loop thread at `priority`.
    ///
    /// Returns false if the loop has shut down. A panic inside `action`
    /// faults the loop.
    pub fn post<F>(&self, priority: Priority, action: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.inbox.push(priority, Job::Post(Box::new(action)))
    }

    /// Queues a shutdown request at `priority`.
    pub fn begin_shutdown(&self, priority: Priority) -> bool {
        self.inbox.push(priority, Job::Shutdown)
    }

    /// Stops the loop after its running action.
    pub fn shutdown(&self) {
        self.inbox.request_shutdown();
    }

    /// Returns true once shutdown has been requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inbox.is_shutdown()
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("shutdown", &self.inbox.is_shutdown())
            .finish()
    }
}

enum OperationSlot<R> {
    Pending(Option<Waker>),
    Done(std::result::Result<R, PanicCapture>),
    Taken,
}

impl<R> OperationSlot<R> {
    fn complete(slot: &Rc<RefCell<Self>>, outcome: std::result::Result<R, PanicCapture>) {
        let previous = std::mem::replace(&mut *slot.borrow_mut(), Self::Done(outcome));
        if let Self::Pending(Some(waker)) = previous {
            waker.wake();
        }
    }
}

/// Awaitable result of an action dispatched on the loop.
///
/// Resolves to the action's value. If the action panicked, awaiting resumes
/// that panic in the awaiting task.
#[must_use = "an operation does nothing unless awaited or checked"]
pub struct Operation<R> {
    slot: Rc<RefCell<OperationSlot<R>>>,
    task: TaskId,
}

impl<R> Operation<R> {
    /// Returns true once the action has finished (successfully or not).
    #[must_use]
    pub fn is_completed(&self) -> bool {
        !matches!(*self.slot.borrow(), OperationSlot::Pending(_))
    }

    /// Id of the task executing the action.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task
    }
}

impl<R> Future for Operation<R> {
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<R> {
        let mut slot = self.slot.borrow_mut();
        if let OperationSlot::Pending(waker) = &mut *slot {
            if !waker.as_ref().is_some_and(|w| w.will_wake(cx.waker())) {
                *waker = Some(cx.waker().clone());
            }
            return Poll::Pending;
        }
        match std::mem::replace(&mut *slot, OperationSlot::Taken) {
            OperationSlot::Done(outcome) => {
                drop(slot);
                match outcome {
                    Ok(value) => Poll::Ready(value),
                    Err(capture) => capture.resume(),
                }
            }
            OperationSlot::Taken | OperationSlot::Pending(_) => {
                panic!("operation polled after completion")
            }
        }
    }
}

impl<R> fmt::Debug for Operation<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("task", &self.task)
            .field("completed", &self.is_completed())
            .finish()
    }
}
