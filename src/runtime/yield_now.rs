//! Cooperative yield for tasks on the event loop.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Future that hands the loop back to the scheduler once.
///
/// The task is re-queued at its own priority, so anything of higher priority
/// that became ready in the meantime runs first.
#[derive(Debug)]
#[must_use = "futures do nothing unless awaited"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// Yields to higher-priority work queued on the current loop.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}
