//! Tasks: a once-callable closure plus the scheduling metadata the loop
//! sorts by.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::panic::Location;
use std::time::Instant;

use crate::weak::WeakHandle;

/// A self-contained, once-callable unit of work.
///
/// The closure records the source location it was built at (via
/// `#[track_caller]`), which the loop exposes to task observers for tracing.
/// A closure may optionally carry a [`WeakHandle`]; if the handle is
/// invalidated before the closure runs, the loop drops it instead of running
/// it.
///
/// Any `FnOnce() + Send + 'static` converts into a `Closure`, so the posting
/// APIs accept plain closures directly.
pub struct Closure {
    task: Box<dyn FnOnce() + Send + 'static>,
    canceler: Option<WeakHandle>,
    posted_from: &'static Location<'static>,
}

impl Closure {
    #[track_caller]
    pub fn new(task: impl FnOnce() + Send + 'static) -> Closure {
        Closure {
            task: Box::new(task),
            canceler: None,
            posted_from: Location::caller(),
        }
    }

    /// Builds a closure that is skipped (dropped unrun) once `handle` is
    /// invalidated. Work that already started is unaffected.
    #[track_caller]
    pub fn cancelable(handle: WeakHandle, task: impl FnOnce() + Send + 'static) -> Closure {
        Closure {
            task: Box::new(task),
            canceler: Some(handle),
            posted_from: Location::caller(),
        }
    }

    /// True once the attached weak handle (if any) has been invalidated.
    pub fn is_cancelled(&self) -> bool {
        self.canceler.as_ref().map_or(false, |c| !c.is_valid())
    }

    /// The source location this closure was created at.
    pub fn posted_from(&self) -> &'static Location<'static> {
        self.posted_from
    }

    /// Runs the closure, unless it has been cancelled in the meantime.
    pub(crate) fn run(self) {
        if self.is_cancelled() {
            return;
        }
        (self.task)();
    }
}

impl<F: FnOnce() + Send + 'static> From<F> for Closure {
    #[track_caller]
    fn from(task: F) -> Closure {
        Closure::new(task)
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("posted_from", &self.posted_from)
            .field("cancelable", &self.canceler.is_some())
            .finish()
    }
}

/// A closure queued on a loop, together with its scheduling metadata.
///
/// Task observers receive a reference to the pending task around execution;
/// everything else about it is crate-internal.
pub struct PendingTask {
    /// Consumed when the task runs; the metadata below stays behind for the
    /// did-process observer notification.
    pub(crate) task: Option<Closure>,
    pub(crate) posted_from: &'static Location<'static>,
    /// Secondary sort key for run time: assignment order under the ingress
    /// lock.
    pub(crate) sequence_num: u64,
    /// `None` means run as soon as the loop gets to it.
    pub(crate) delayed_run_time: Option<Instant>,
    /// OK to dispatch from a nested run loop.
    pub(crate) nestable: bool,
    /// Needs the OS timer running at high resolution to fire on time.
    pub(crate) is_high_res: bool,
}

impl PendingTask {
    pub(crate) fn new(task: Closure, delayed_run_time: Option<Instant>, nestable: bool) -> PendingTask {
        PendingTask {
            posted_from: task.posted_from(),
            task: Some(task),
            sequence_num: 0,
            delayed_run_time,
            nestable,
            is_high_res: false,
        }
    }

    pub fn posted_from(&self) -> &'static Location<'static> {
        self.posted_from
    }

    pub fn sequence_num(&self) -> u64 {
        self.sequence_num
    }

    pub fn delayed_run_time(&self) -> Option<Instant> {
        self.delayed_run_time
    }

    pub fn is_nestable(&self) -> bool {
        self.nestable
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.task.as_ref().map_or(true, Closure::is_cancelled)
    }

    /// Takes the closure out for execution.
    pub(crate) fn take_task(&mut self) -> Closure {
        self.task.take().expect("pending task already ran")
    }
}

impl fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTask")
            .field("posted_from", &self.posted_from())
            .field("sequence_num", &self.sequence_num)
            .field("delayed_run_time", &self.delayed_run_time)
            .field("nestable", &self.nestable)
            .finish()
    }
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &PendingTask) -> bool {
        self.sequence_num == other.sequence_num
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &PendingTask) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTask {
    /// Inverted so that [`BinaryHeap`]'s max element is the task that should
    /// run first: the smallest run time wins, ties broken by the smaller
    /// sequence number (posted earlier).
    fn cmp(&self, other: &PendingTask) -> Ordering {
        match other.delayed_run_time.cmp(&self.delayed_run_time) {
            Ordering::Equal => other.sequence_num.cmp(&self.sequence_num),
            ord => ord,
        }
    }
}

/// FIFO of pending tasks, drained oldest-first.
pub(crate) type TaskQueue = VecDeque<PendingTask>;

/// Delayed tasks ordered by run time, then sequence number.
pub(crate) type DelayedTaskQueue = BinaryHeap<PendingTask>;
