//! Nestable drivers for the current thread's message loop.
//!
//! A [`RunLoop`] enters the loop's pump and returns when quit. Run loops
//! nest: a task may create and run another `RunLoop` on the same thread, and
//! the loop tracks the stack so that `quit` only exits the innermost run,
//! non-nestable tasks stay parked until the stack is back to depth one, and
//! a quit requested on an outer run is honored as soon as the inner runs
//! unwind.
//!
//! Whether tasks run at all inside a nested run is decided when the
//! `RunLoop` is constructed: [`RunLoop::new`] keeps the usual reentrancy
//! protection (no tasks while another task is on the stack), while
//! [`RunLoop::new_allowing_nestable_tasks`] opts into nested dispatch the
//! way a blocking call that must keep servicing the loop does.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use log::trace;

use crate::message_loop::{self, LoopState};
use crate::task::Closure;
use crate::TaskRunner;

/// Per-run state shared with quit closures; the loop keeps a stack of these.
pub(crate) struct RunState {
    depth: AtomicUsize,
    quit_called: AtomicBool,
    quit_when_idle: AtomicBool,
    running: AtomicBool,
    /// Chosen at construction: run tasks even when entered from inside a
    /// task.
    allow_nestable_tasks: bool,
    /// Effective permission for this run, fixed at entry.
    allow_tasks: AtomicBool,
}

impl RunState {
    pub(crate) fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub(crate) fn allows_tasks(&self) -> bool {
        self.allow_tasks.load(Ordering::Relaxed)
    }

    pub(crate) fn quit_when_idle_received(&self) -> bool {
        self.quit_when_idle.load(Ordering::Relaxed)
    }

    pub(crate) fn set_quit_when_idle(&self) {
        self.quit_when_idle.store(true, Ordering::Relaxed);
    }

    pub(crate) fn quit_called(&self) -> bool {
        self.quit_called.load(Ordering::Acquire)
    }
}

/// Flags `state` as quit and, when it is the innermost running loop on this
/// thread, tells the pump to return.
pub(crate) fn quit_run_state(state: &Arc<RunState>) {
    state.quit_called.store(true, Ordering::Release);
    if !state.running.load(Ordering::Acquire) {
        return;
    }
    if let Some(loop_state) = message_loop::current_state() {
        let is_innermost = loop_state
            .top_run_loop()
            .map_or(false, |top| Arc::ptr_eq(&top, state));
        if is_innermost {
            loop_state.quit_pump();
        }
    }
}

/// Runs the current thread's [`MessageLoop`] until quit.
///
/// Stack-allocate one, optionally hand out its [`quit_closure`], and call
/// [`run`]. `run` may only be called once per `RunLoop`.
///
/// [`MessageLoop`]: crate::MessageLoop
/// [`quit_closure`]: RunLoop::quit_closure
/// [`run`]: RunLoop::run
pub struct RunLoop {
    loop_state: Rc<LoopState>,
    state: Arc<RunState>,
    run_called: Cell<bool>,
}

impl RunLoop {
    /// Creates a run loop for the current thread's message loop.
    ///
    /// Tasks will not run inside this run if it is entered from within a
    /// task (the usual reentrancy protection).
    ///
    /// # Panics
    ///
    /// Panics if the current thread has no bound message loop.
    pub fn new() -> RunLoop {
        RunLoop::with_mode(false)
    }

    /// Like [`new`], but tasks marked nestable may run inside this run even
    /// when it is entered from within a task. This is the mode used while
    /// blocking on something that the loop's own tasks must be able to
    /// unblock.
    ///
    /// [`new`]: RunLoop::new
    pub fn new_allowing_nestable_tasks() -> RunLoop {
        RunLoop::with_mode(true)
    }

    fn with_mode(allow_nestable_tasks: bool) -> RunLoop {
        let loop_state =
            message_loop::current_state().expect("RunLoop requires a message loop on this thread");
        RunLoop {
            loop_state,
            state: Arc::new(RunState {
                depth: AtomicUsize::new(0),
                quit_called: AtomicBool::new(false),
                quit_when_idle: AtomicBool::new(false),
                running: AtomicBool::new(false),
                allow_nestable_tasks,
                allow_tasks: AtomicBool::new(true),
            }),
            run_called: Cell::new(false),
        }
    }

    /// Runs the loop until [`quit`] (or a quit closure) fires. If `quit` was
    /// already called, returns immediately.
    ///
    /// [`quit`]: RunLoop::quit
    pub fn run(&mut self) {
        if !self.before_run() {
            return;
        }
        self.loop_state.run_pump();
        self.after_run();
    }

    /// Runs the loop until no further work is immediately available, then
    /// returns. Pending delayed tasks whose time has not come do not count
    /// as work.
    pub fn run_until_idle(&mut self) {
        self.state.set_quit_when_idle();
        self.run();
    }

    pub fn running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Quits this run. Only the innermost run exits immediately; an outer
    /// run exits once the runs nested inside it unwind. Calling `quit`
    /// before `run` makes `run` return immediately; calling it after `run`
    /// returned has no effect. Must be called on the loop's thread; use
    /// [`quit_closure`] from anywhere else.
    ///
    /// [`quit_closure`]: RunLoop::quit_closure
    pub fn quit(&self) {
        quit_run_state(&self.state);
    }

    /// Makes `run` return once the loop goes idle (no immediate work left).
    pub fn quit_when_idle(&self) {
        self.state.set_quit_when_idle();
    }

    /// Returns a thread-safe closure that quits this run loop. Invoking it
    /// after the `RunLoop` is gone is a no-op, so it can be handed to
    /// anything without lifetime coordination.
    pub fn quit_closure(&self) -> Arc<dyn Fn() + Send + Sync> {
        let weak: Weak<RunState> = Arc::downgrade(&self.state);
        let runner = self.loop_state.task_runner();
        Arc::new(move || {
            if weak.upgrade().is_none() {
                return;
            }
            if runner.runs_tasks_on_current_thread() {
                if let Some(state) = weak.upgrade() {
                    quit_run_state(&state);
                }
            } else {
                let weak = weak.clone();
                runner.post_task(Closure::new(move || {
                    if let Some(state) = weak.upgrade() {
                        quit_run_state(&state);
                    }
                }));
            }
        })
    }

    /// Pushes this run onto the loop's stack. Returns false to abort the run.
    fn before_run(&mut self) -> bool {
        assert!(!self.run_called.get(), "RunLoop::run may only be called once");
        self.run_called.set(true);

        // Allow quit to have been called before run.
        if self.state.quit_called() {
            return false;
        }

        let depth = self.loop_state.run_depth() + 1;
        self.state.depth.store(depth, Ordering::Relaxed);
        let allow = self.state.allow_nestable_tasks || !self.loop_state.is_running_task();
        self.state.allow_tasks.store(allow, Ordering::Relaxed);
        trace!("entering run loop at depth {} (tasks allowed: {})", depth, allow);

        self.loop_state.push_run_loop(self.state.clone());
        if self.state.allow_nestable_tasks {
            // We may have been entered from inside a task, with work already
            // queued that nobody will wake the pump for.
            self.loop_state.schedule_work();
        }
        self.state.running.store(true, Ordering::Release);
        true
    }

    fn after_run(&self) {
        self.state.running.store(false, Ordering::Release);

        let popped = self.loop_state.pop_run_loop();
        debug_assert!(popped.map_or(false, |p| Arc::ptr_eq(&p, &self.state)));
        trace!("left run loop at depth {}", self.state.depth());

        // Execute a deferred quit: the enclosing run was quit while we were
        // nested inside it.
        if let Some(previous) = self.loop_state.top_run_loop() {
            if previous.quit_called() {
                self.loop_state.quit_pump();
            }
        }
    }
}
