//! Cooperative task scheduler.
//!
//! Every piece of per-connection work (handshake, frame listening, keepalive)
//! and every broker subscription runs as a task in one FIFO queue. The
//! runtime drives the queue with [`Scheduler::flush`]: one pass polls every
//! task that was queued when the pass started exactly once, so no task gets
//! a second turn before all others had their first.
//!
//! A task yields with [`suspend`] or by awaiting I/O that is not ready yet.
//! Tasks are polled with a no-op waker: readiness is rediscovered by polling
//! again on the next pass rather than by wake-ups.
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use wsrelay_core::scheduler::{suspend, Scheduler};
//!
//! let scheduler = Scheduler::new();
//! let steps = Arc::new(AtomicUsize::new(0));
//!
//! let counter = steps.clone();
//! scheduler.enqueue("counter", async move {
//!     counter.fetch_add(1, Ordering::SeqCst);
//!     suspend().await;
//!     counter.fetch_add(1, Ordering::SeqCst);
//! });
//!
//! scheduler.flush();
//! assert_eq!(steps.load(Ordering::SeqCst), 1);
//! scheduler.flush();
//! assert_eq!(steps.load(Ordering::SeqCst), 2);
//! assert!(scheduler.is_empty());
//! ```

use futures_util::task::noop_waker_ref;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::trace;

type BoxTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct Task {
    label: String,
    future: BoxTask,
}

/// Result of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Tasks polled during the pass.
    pub resumed: usize,
    /// Tasks that finished during the pass.
    pub completed: usize,
}

/// FIFO queue of cooperative tasks.
pub struct Scheduler {
    queue: Mutex<VecDeque<Task>>,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a task. It first runs on the next flush pass.
    pub fn enqueue<F>(&self, label: impl Into<String>, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = Task {
            label: label.into(),
            // Keep tokio's per-task budget out of the picture: the budget
            // belongs to the runtime task driving the flush, not to ours.
            future: Box::pin(tokio::task::unconstrained(future)),
        };
        self.queue.lock().push_back(task);
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Returns `true` when no task is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Resumes every task queued at the start of the pass once.
    ///
    /// Tasks enqueued while the pass runs wait for the next one. The queue
    /// lock is not held while a task is polled, so tasks may enqueue.
    pub fn flush(&self) -> FlushStats {
        let count = self.len();
        let mut stats = FlushStats::default();
        let mut cx = Context::from_waker(noop_waker_ref());

        for _ in 0..count {
            let Some(mut task) = self.queue.lock().pop_front() else {
                break;
            };

            stats.resumed += 1;
            match task.future.as_mut().poll(&mut cx) {
                Poll::Ready(()) => {
                    stats.completed += 1;
                    trace!(task = %task.label, "task finished");
                }
                Poll::Pending => self.queue.lock().push_back(task),
            }
        }

        stats
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Yields control back to the scheduler once.
///
/// The returned future is pending on its first poll and ready on the second.
pub fn suspend() -> Suspend {
    Suspend { yielded: false }
}

/// Future returned by [`suspend`].
#[must_use = "futures do nothing unless awaited"]
pub struct Suspend {
    yielded: bool,
}

impl Future for Suspend {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
