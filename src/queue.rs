//! The thread-safe ingress side of a message loop.
//!
//! Foreign threads drop tasks here under a single short-lived lock; the
//! loop's thread drains them in batches. Reloading only happens when the
//! loop's local queue is empty, which keeps it to one lock acquisition per
//! batch rather than one per task.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::pump::Waker;
use crate::task::{Closure, PendingTask, TaskQueue};

/// Delays below this need the OS timer running at high resolution to fire
/// anywhere near on time; the loop raises the resolution while such tasks
/// are pending.
const HIGH_RESOLUTION_THRESHOLD: Duration = Duration::from_millis(32);

/// Cap used when a delay is too large to represent as an instant.
const FOREVER: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

struct Inner {
    incoming_queue: TaskQueue,
    /// False once the loop has started destruction; posts are then refused.
    accept_new_tasks: bool,
    next_sequence_num: u64,
    /// High-resolution tasks sitting in `incoming_queue`.
    high_res_task_count: usize,
    /// True while a wakeup is already on its way to the loop, so that a
    /// burst of posts schedules only one.
    message_loop_scheduled: bool,
    /// Set once the loop is bound and the waker is installed.
    is_ready_for_scheduling: bool,
    waker: Option<Waker>,
}

/// Lock-protected task ingress shared between a loop and its task runners.
pub(crate) struct IncomingTaskQueue {
    inner: Mutex<Inner>,
}

impl IncomingTaskQueue {
    pub fn new() -> Arc<IncomingTaskQueue> {
        Arc::new(IncomingTaskQueue {
            inner: Mutex::new(Inner {
                incoming_queue: TaskQueue::new(),
                accept_new_tasks: true,
                next_sequence_num: 0,
                high_res_task_count: 0,
                message_loop_scheduled: false,
                is_ready_for_scheduling: false,
                waker: None,
            }),
        })
    }

    /// Appends a task to the ingress. Returns false (dropping the closure)
    /// once the owning loop has shut down.
    pub fn add_to_incoming_queue(&self, task: Closure, delay: Duration, nestable: bool) -> bool {
        let mut pending = PendingTask::new(task, calculate_delayed_run_time(delay), nestable);
        pending.is_high_res = !delay.is_zero() && delay < HIGH_RESOLUTION_THRESHOLD;

        // Decide about the wakeup under the lock, deliver it after: the
        // waker may be an event with its own lock and arbitrary watchers.
        let wake = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.accept_new_tasks {
                debug!(
                    "dropping task posted from {} after shutdown",
                    pending.posted_from()
                );
                return false;
            }

            if pending.is_high_res {
                inner.high_res_task_count += 1;
            }
            pending.sequence_num = inner.next_sequence_num;
            inner.next_sequence_num += 1;

            let was_empty = inner.incoming_queue.is_empty();
            inner.incoming_queue.push_back(pending);

            if inner.is_ready_for_scheduling && !inner.message_loop_scheduled && was_empty {
                inner.message_loop_scheduled = true;
                inner.waker.clone()
            } else {
                None
            }
        };

        if let Some(waker) = wake {
            waker.wake();
        }
        true
    }

    /// Moves every queued task into `work_queue`, preserving ingress order.
    /// Returns the number of high-resolution tasks moved.
    pub fn reload_work_queue(&self, work_queue: &mut TaskQueue) -> usize {
        debug_assert!(work_queue.is_empty());
        let mut inner = self.inner.lock().unwrap();
        if inner.incoming_queue.is_empty() {
            // The loop went to look for work and found none; the next post
            // needs to schedule a wakeup again.
            inner.message_loop_scheduled = false;
        } else {
            std::mem::swap(&mut inner.incoming_queue, work_queue);
            trace!("reloaded {} tasks", work_queue.len());
        }
        std::mem::take(&mut inner.high_res_task_count)
    }

    pub fn has_high_resolution_tasks(&self) -> bool {
        self.inner.lock().unwrap().high_res_task_count > 0
    }

    /// Installs the pump waker and starts scheduling wakeups. Called once,
    /// when the loop binds to its thread.
    pub fn start_scheduling(&self, waker: Waker) {
        let wake = {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(!inner.is_ready_for_scheduling);
            inner.is_ready_for_scheduling = true;
            inner.waker = Some(waker);
            if !inner.incoming_queue.is_empty() {
                inner.message_loop_scheduled = true;
                inner.waker.clone()
            } else {
                None
            }
        };
        if let Some(waker) = wake {
            waker.wake();
        }
    }

    /// Refuses all future posts. Tasks already accepted remain and are
    /// drained (or destroyed) by the loop's teardown.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.accept_new_tasks = false;
        inner.waker = None;
    }
}

fn calculate_delayed_run_time(delay: Duration) -> Option<Instant> {
    if delay.is_zero() {
        return None;
    }
    let now = Instant::now();
    Some(now.checked_add(delay).unwrap_or(now + FOREVER))
}
