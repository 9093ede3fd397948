//! Single-threaded priority event loop.

pub mod dedicated;
pub mod event_loop;
pub(crate) mod inbox;
pub mod priority;
pub mod queue;
pub mod task;
pub(crate) mod waker;
pub mod yield_now;

pub use dedicated::run_on_dedicated_thread;
pub use event_loop::{Dispatcher, EventLoop, LoopHandle, Operation};
pub use priority::Priority;
pub use queue::ActionQueue;
pub use task::TaskId;
pub use yield_now::{yield_now, YieldNow};
