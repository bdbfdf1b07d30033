//! Task runners: thread-safe handles for posting work onto a loop.
//!
//! A [`TaskRunner`] is the only way a foreign thread touches a
//! [`MessageLoop`]: runners are cheap to clone (they are held as
//! `Arc<dyn TaskRunner>`), outlive their loop gracefully (posts to a dead
//! loop return false), and preserve FIFO order for zero-delay posts from any
//! single thread.
//!
//! [`MessageLoop`]: crate::MessageLoop

use std::cell::RefCell;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use crate::queue::IncomingTaskQueue;
use crate::task::Closure;

/// Posts closures onto a particular loop.
///
/// All methods return false when the target loop has shut down; the closure
/// is dropped in that case.
pub trait TaskRunner: Send + Sync {
    /// Posts a task to run as soon as the loop gets to it.
    fn post_task(&self, task: Closure) -> bool {
        self.post_delayed_task(task, Duration::ZERO)
    }

    /// Posts a task to run no earlier than `delay` from now.
    fn post_delayed_task(&self, task: Closure, delay: Duration) -> bool;

    /// Posts a task that will not run inside a nested run loop; it is
    /// deferred until the loop is back at its outermost run.
    fn post_non_nestable_task(&self, task: Closure) -> bool {
        self.post_non_nestable_delayed_task(task, Duration::ZERO)
    }

    /// Delayed variant of [`post_non_nestable_task`].
    ///
    /// [`post_non_nestable_task`]: TaskRunner::post_non_nestable_task
    fn post_non_nestable_delayed_task(&self, task: Closure, delay: Duration) -> bool;

    /// True iff tasks posted here run on the calling thread.
    fn runs_tasks_on_current_thread(&self) -> bool;
}

/// Conveniences composed out of the base posting operations.
pub trait TaskRunnerExt: TaskRunner {
    /// Moves `value` to the target loop's thread and drops it there.
    ///
    /// The drop happens in a non-nestable task so that destructors never run
    /// inside an unsuspecting nested loop. Returns false (dropping `value`
    /// on the calling thread) if the loop is gone.
    #[track_caller]
    fn delete_soon<T: Send + 'static>(&self, value: T) -> bool {
        self.post_non_nestable_task(Closure::new(move || drop(value)))
    }

    /// Runs `task` on the target loop, then posts `reply` back to the
    /// calling thread's loop.
    ///
    /// Requires the calling thread to have a bound loop (the reply needs
    /// somewhere to go).
    #[track_caller]
    fn post_task_and_reply(&self, task: Closure, reply: Closure) -> bool {
        let origin = current()
            .expect("post_task_and_reply requires a message loop on the calling thread");
        self.post_task(Closure::new(move || {
            task.run();
            origin.post_task(reply);
        }))
    }
}

impl<R: TaskRunner + ?Sized> TaskRunnerExt for R {}

/// The runner bound to a [`MessageLoop`]: forwards every post into the
/// loop's incoming queue.
///
/// [`MessageLoop`]: crate::MessageLoop
pub(crate) struct LoopTaskRunner {
    incoming: Arc<IncomingTaskQueue>,
    valid_thread_id: Mutex<Option<ThreadId>>,
}

impl LoopTaskRunner {
    pub fn new(incoming: Arc<IncomingTaskQueue>) -> Arc<LoopTaskRunner> {
        Arc::new(LoopTaskRunner {
            incoming,
            valid_thread_id: Mutex::new(None),
        })
    }

    /// Records the loop's thread; called once at bind time.
    pub fn bind_to_current_thread(&self) {
        let mut id = self.valid_thread_id.lock().unwrap();
        debug_assert!(id.is_none());
        *id = Some(std::thread::current().id());
    }
}

impl TaskRunner for LoopTaskRunner {
    fn post_delayed_task(&self, task: Closure, delay: Duration) -> bool {
        self.incoming.add_to_incoming_queue(task, delay, true)
    }

    fn post_non_nestable_delayed_task(&self, task: Closure, delay: Duration) -> bool {
        self.incoming.add_to_incoming_queue(task, delay, false)
    }

    fn runs_tasks_on_current_thread(&self) -> bool {
        *self.valid_thread_id.lock().unwrap() == Some(std::thread::current().id())
    }
}

thread_local! {
    static CURRENT_RUNNER: RefCell<Option<Arc<dyn TaskRunner>>> = const { RefCell::new(None) };
}

/// Returns the runner for the calling thread's bound loop, if any.
///
/// This is how code deep inside a call stack posts back to "its own" thread
/// without threading a runner through every signature.
pub fn current() -> Option<Arc<dyn TaskRunner>> {
    CURRENT_RUNNER.with(|r| r.borrow().clone())
}

pub(crate) fn set_current(runner: Option<Arc<dyn TaskRunner>>) {
    CURRENT_RUNNER.with(|r| *r.borrow_mut() = runner);
}
