//! The per-thread message loop: queues, pump, and task dispatch.
//!
//! A [`MessageLoop`] processes events for one thread. Work arrives from any
//! thread through the loop's [`TaskRunner`], lands in a locked ingress
//! queue, and is drained by the loop's thread in batches into three local
//! queues: the immediate FIFO, the delayed priority queue, and the deferred
//! queue for non-nestable tasks that arrived while the loop was nested.
//! The loop implements [`Delegate`] and is driven by its [`Pump`].
//!
//! A loop is single-thread-affine from the moment it is bound. Create one
//! directly with [`MessageLoop::new`] (binds to the calling thread), or
//! create it unbound with [`MessageLoop::create_unbound`], hand the
//! [`UnboundLoop`] to its thread, and bind there; posts made in between are
//! queued and run after binding. [`Thread`] packages that dance.
//!
//! [`Thread`]: crate::Thread

use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use log::{trace, warn};

use crate::pump::{CompletionPort, Delegate, DefaultPump, IoPump, Pump, Waker};
use crate::queue::IncomingTaskQueue;
use crate::run_loop::{RunLoop, RunState};
use crate::runner::{self, LoopTaskRunner};
use crate::sys;
use crate::task::{DelayedTaskQueue, PendingTask, TaskQueue};
use crate::TaskRunner;

/// The kinds of events a loop can process in addition to tasks and timers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoopType {
    /// Tasks and timers only.
    Default,
    /// Also dispatches asynchronous I/O completions; see
    /// [`MessageLoop::io_port`].
    Io,
    /// Runs on a pump supplied by the embedder.
    Custom,
}

/// Observes every task a loop executes.
pub trait TaskObserver {
    /// Called immediately before running `task`.
    fn will_process_task(&self, task: &PendingTask);
    /// Called immediately after running `task`.
    fn did_process_task(&self, task: &PendingTask);
}

/// Observes the destruction of the loop, from the loop's own thread.
pub trait DestructionObserver {
    /// Last chance to post-process before the loop is gone. Posting new
    /// tasks from here fails.
    fn will_destroy_current_message_loop(&self);
}

/// The number of drain rounds loop destruction tolerates for tasks whose
/// destructors keep posting further tasks.
const DESTRUCTION_ROUNDS: usize = 100;

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Rc<LoopState>>> = const { RefCell::new(None) };
}

/// The bound loop of the calling thread, shared by the loop itself, run
/// loops and the TLS slot. All mutation happens on the owning thread in
/// short, non-reentrant sections; nothing is ever borrowed across a task.
pub(crate) struct LoopState {
    loop_type: LoopType,
    pump: Rc<dyn Pump>,
    waker: Waker,
    io_port: Option<CompletionPort>,
    incoming: Arc<IncomingTaskQueue>,
    task_runner: Arc<LoopTaskRunner>,

    work_queue: RefCell<TaskQueue>,
    delayed_work_queue: RefCell<DelayedTaskQueue>,
    deferred_non_nestable_work_queue: RefCell<TaskQueue>,

    /// Stack of active runs; the innermost is last.
    run_loops: RefCell<Vec<Arc<RunState>>>,
    /// True while a task's closure is on the stack.
    running_task: Cell<bool>,
    /// Cached "now" so a backlog of ready delayed tasks costs one clock read.
    recent_time: Cell<Option<Instant>>,

    pending_high_res_tasks: Cell<usize>,
    in_high_res_mode: Cell<bool>,

    task_observers: RefCell<Vec<Rc<dyn TaskObserver>>>,
    destruction_observers: RefCell<Vec<Rc<dyn DestructionObserver>>>,
}

impl LoopState {
    pub(crate) fn task_runner(&self) -> Arc<dyn TaskRunner> {
        self.task_runner.clone()
    }

    pub(crate) fn run_depth(&self) -> usize {
        self.run_loops.borrow().len()
    }

    pub(crate) fn is_running_task(&self) -> bool {
        self.running_task.get()
    }

    pub(crate) fn top_run_loop(&self) -> Option<Arc<RunState>> {
        self.run_loops.borrow().last().cloned()
    }

    pub(crate) fn push_run_loop(&self, run: Arc<RunState>) {
        self.run_loops.borrow_mut().push(run);
    }

    pub(crate) fn pop_run_loop(&self) -> Option<Arc<RunState>> {
        self.run_loops.borrow_mut().pop()
    }

    pub(crate) fn run_pump(&self) {
        let pump = self.pump.clone();
        pump.run(self);
    }

    pub(crate) fn quit_pump(&self) {
        self.pump.quit();
    }

    pub(crate) fn schedule_work(&self) {
        self.waker.wake();
    }

    pub(crate) fn quit_when_idle(&self) {
        match self.top_run_loop() {
            Some(run) => run.set_quit_when_idle(),
            None => warn!("quit_when_idle outside of a run"),
        }
    }

    pub(crate) fn quit_now(&self) {
        if self.top_run_loop().is_some() {
            self.pump.quit();
        } else {
            warn!("quit_now outside of a run");
        }
    }

    /// Whether tasks may be executed right now: consult the innermost run's
    /// mode, fixed when it was entered.
    fn nestable_tasks_allowed(&self) -> bool {
        self.top_run_loop().map_or(true, |run| run.allows_tasks())
    }

    fn reload_work_queue(&self) {
        // Wait until the local queue drains before taking the ingress lock
        // again; that keeps it at one acquisition per batch.
        let mut work_queue = self.work_queue.borrow_mut();
        if work_queue.is_empty() {
            let high_res = self.incoming.reload_work_queue(&mut work_queue);
            self.pending_high_res_tasks
                .set(self.pending_high_res_tasks.get() + high_res);
        }
    }

    fn run_task(&self, mut pending: PendingTask) {
        debug_assert!(self.nestable_tasks_allowed());

        if pending.is_high_res {
            self.pending_high_res_tasks
                .set(self.pending_high_res_tasks.get() - 1);
        }

        let observers: Vec<_> = self.task_observers.borrow().clone();
        for observer in &observers {
            observer.will_process_task(&pending);
        }

        let task = pending.take_task();
        // Assume the worst: the task is probably not reentrant. Any run loop
        // it opens only executes tasks if it explicitly allows them.
        let was_running_task = self.running_task.replace(true);
        let result = panic::catch_unwind(AssertUnwindSafe(|| task.run()));
        self.running_task.set(was_running_task);

        for observer in &observers {
            observer.did_process_task(&pending);
        }

        // Queue state and observers are consistent again; let the panic
        // continue up through the pump and run loop.
        if let Err(payload) = result {
            panic::resume_unwind(payload);
        }
    }

    /// Runs the task now, or parks it if non-nestable tasks cannot run at
    /// this depth. Returns whether the task ran.
    fn defer_or_run_pending_task(&self, pending: PendingTask) -> bool {
        if pending.nestable || self.run_depth() == 1 {
            self.run_task(pending);
            return true;
        }
        trace!(
            "deferring non-nestable task posted from {}",
            pending.posted_from()
        );
        self.deferred_non_nestable_work_queue
            .borrow_mut()
            .push_back(pending);
        false
    }

    fn process_next_delayed_non_nestable_task(&self) -> bool {
        if self.run_depth() != 1 {
            return false;
        }
        loop {
            let pending = self.deferred_non_nestable_work_queue.borrow_mut().pop_front();
            match pending {
                None => return false,
                Some(pending) if pending.is_cancelled() => continue,
                Some(pending) => {
                    self.run_task(pending);
                    return true;
                }
            }
        }
    }

    /// Discards queued tasks. Returns whether anything was discarded.
    fn delete_pending_tasks(&self) -> bool {
        let mut did_work = !self.work_queue.borrow().is_empty();
        loop {
            let pending = self.work_queue.borrow_mut().pop_front();
            match pending {
                None => break,
                Some(pending) => {
                    if pending.delayed_run_time.is_some() {
                        // Delayed tasks are deleted in their run order, in
                        // case of dependencies between them.
                        self.delayed_work_queue.borrow_mut().push(pending);
                    }
                }
            }
        }

        did_work |= !self.deferred_non_nestable_work_queue.borrow().is_empty();
        loop {
            let pending = self.deferred_non_nestable_work_queue.borrow_mut().pop_front();
            if pending.is_none() {
                break;
            }
        }

        did_work |= !self.delayed_work_queue.borrow().is_empty();
        loop {
            let pending = self.delayed_work_queue.borrow_mut().pop();
            if pending.is_none() {
                break;
            }
        }
        did_work
    }

    fn add_task_observer(&self, observer: Rc<dyn TaskObserver>) {
        self.task_observers.borrow_mut().push(observer);
    }

    fn remove_task_observer(&self, observer: &Rc<dyn TaskObserver>) {
        self.task_observers
            .borrow_mut()
            .retain(|o| !Rc::ptr_eq(o, observer));
    }

    fn add_destruction_observer(&self, observer: Rc<dyn DestructionObserver>) {
        self.destruction_observers.borrow_mut().push(observer);
    }

    fn remove_destruction_observer(&self, observer: &Rc<dyn DestructionObserver>) {
        self.destruction_observers
            .borrow_mut()
            .retain(|o| !Rc::ptr_eq(o, observer));
    }
}

impl Delegate for LoopState {
    fn do_work(&self) -> bool {
        if !self.nestable_tasks_allowed() {
            return false;
        }

        loop {
            self.reload_work_queue();
            if self.work_queue.borrow().is_empty() {
                break;
            }

            loop {
                let pending = self.work_queue.borrow_mut().pop_front();
                let Some(pending) = pending else { break };

                if pending.is_cancelled() {
                    continue;
                }

                if let Some(run_time) = pending.delayed_run_time {
                    let sequence_num = pending.sequence_num;
                    let became_top = {
                        let mut delayed = self.delayed_work_queue.borrow_mut();
                        delayed.push(pending);
                        delayed.peek().map(|t| t.sequence_num) == Some(sequence_num)
                    };
                    // A new topmost delayed task moves the pump's timer.
                    if became_top {
                        self.pump.schedule_delayed_work(run_time);
                    }
                } else if self.defer_or_run_pending_task(pending) {
                    return true;
                }
            }
        }

        false
    }

    fn do_delayed_work(&self) -> (bool, Option<Instant>) {
        if !self.nestable_tasks_allowed() || self.delayed_work_queue.borrow().is_empty() {
            self.recent_time.set(None);
            return (false, None);
        }

        // When we fall behind there is a backlog of ready delayed tasks, so
        // only consult the clock when the cached reading says the next task
        // is not ready yet.
        let next_run_time = self
            .delayed_work_queue
            .borrow()
            .peek()
            .and_then(|t| t.delayed_run_time)
            .expect("delayed task without a run time");
        let stale = self.recent_time.get().map_or(true, |t| next_run_time > t);
        if stale {
            let now = Instant::now();
            self.recent_time.set(Some(now));
            if next_run_time > now {
                return (false, Some(next_run_time));
            }
        }

        let pending = self
            .delayed_work_queue
            .borrow_mut()
            .pop()
            .expect("delayed queue drained underneath us");
        let next = self
            .delayed_work_queue
            .borrow()
            .peek()
            .and_then(|t| t.delayed_run_time);

        (self.defer_or_run_pending_task(pending), next)
    }

    fn do_idle_work(&self) -> bool {
        if self.process_next_delayed_non_nestable_task() {
            return true;
        }

        if self
            .top_run_loop()
            .map_or(false, |run| run.quit_when_idle_received())
        {
            self.pump.quit();
        }

        // The wait that follows may be timer-driven; make sure it happens at
        // the resolution the pending tasks ask for.
        let high_res = self.pending_high_res_tasks.get() > 0;
        if high_res != self.in_high_res_mode.get() {
            self.in_high_res_mode.set(high_res);
            sys::activate_high_resolution_timer(high_res);
        }

        false
    }
}

pub(crate) fn current_state() -> Option<Rc<LoopState>> {
    CURRENT_LOOP.with(|current| current.borrow().clone())
}

type PumpFactory = Box<dyn FnOnce() -> Rc<dyn Pump> + Send>;

/// A loop that has been created but not yet bound to a thread.
///
/// `UnboundLoop` is `Send`: create it wherever is convenient, hand it to the
/// thread that will run it, and call [`bind_to_current_thread`] there. Its
/// task runner works immediately; tasks posted before binding run once the
/// loop is bound and running.
///
/// [`bind_to_current_thread`]: UnboundLoop::bind_to_current_thread
pub struct UnboundLoop {
    loop_type: LoopType,
    incoming: Arc<IncomingTaskQueue>,
    task_runner: Arc<LoopTaskRunner>,
    pump_factory: Option<PumpFactory>,
}

impl UnboundLoop {
    pub fn task_runner(&self) -> Arc<dyn TaskRunner> {
        self.task_runner.clone()
    }

    /// Binds the loop to the calling thread, making it that thread's
    /// [`MessageLoop::current`].
    ///
    /// # Panics
    ///
    /// Panics if the thread already has a bound loop.
    pub fn bind_to_current_thread(self) -> MessageLoop {
        CURRENT_LOOP.with(|current| {
            assert!(
                current.borrow().is_none(),
                "should only have one message loop per thread"
            );
        });

        let (pump, io_port): (Rc<dyn Pump>, Option<CompletionPort>) = match self.pump_factory {
            Some(factory) => (factory(), None),
            None => match self.loop_type {
                LoopType::Default => (Rc::new(DefaultPump::new()), None),
                LoopType::Io => {
                    let pump = IoPump::new();
                    let port = pump.port();
                    (Rc::new(pump), Some(port))
                }
                LoopType::Custom => unreachable!("custom loops carry a pump factory"),
            },
        };

        let waker = pump.waker();
        let state = Rc::new(LoopState {
            loop_type: self.loop_type,
            pump,
            waker,
            io_port,
            incoming: self.incoming,
            task_runner: self.task_runner,
            work_queue: RefCell::new(TaskQueue::new()),
            delayed_work_queue: RefCell::new(DelayedTaskQueue::new()),
            deferred_non_nestable_work_queue: RefCell::new(TaskQueue::new()),
            run_loops: RefCell::new(Vec::new()),
            running_task: Cell::new(false),
            recent_time: Cell::new(None),
            pending_high_res_tasks: Cell::new(0),
            in_high_res_mode: Cell::new(false),
            task_observers: RefCell::new(Vec::new()),
            destruction_observers: RefCell::new(Vec::new()),
        });

        CURRENT_LOOP.with(|current| *current.borrow_mut() = Some(state.clone()));
        state.incoming.start_scheduling(state.waker.clone());
        state.task_runner.bind_to_current_thread();
        runner::set_current(Some(state.task_runner()));

        MessageLoop { state }
    }
}

/// A message loop bound to the current thread. See the [module docs].
///
/// Dropping the loop (on its own thread) drains or destroys the remaining
/// tasks, notifies destruction observers, and refuses further posts.
///
/// [module docs]: self
pub struct MessageLoop {
    state: Rc<LoopState>,
}

impl MessageLoop {
    /// Creates a loop of `loop_type` bound to the calling thread.
    pub fn new(loop_type: LoopType) -> MessageLoop {
        MessageLoop::create_unbound(loop_type).bind_to_current_thread()
    }

    /// Creates a loop that will be bound later, on the thread that runs it.
    pub fn create_unbound(loop_type: LoopType) -> UnboundLoop {
        assert!(
            loop_type != LoopType::Custom,
            "custom loops are created with create_unbound_with_pump"
        );
        Self::unbound(loop_type, None)
    }

    /// Creates an unbound loop driven by a pump of the embedder's choosing.
    /// The factory runs on the binding thread.
    pub fn create_unbound_with_pump(
        pump_factory: impl FnOnce() -> Rc<dyn Pump> + Send + 'static,
    ) -> UnboundLoop {
        Self::unbound(LoopType::Custom, Some(Box::new(pump_factory)))
    }

    fn unbound(loop_type: LoopType, pump_factory: Option<PumpFactory>) -> UnboundLoop {
        let incoming = IncomingTaskQueue::new();
        let task_runner = LoopTaskRunner::new(incoming.clone());
        UnboundLoop {
            loop_type,
            incoming,
            task_runner,
            pump_factory,
        }
    }

    /// Returns a handle to the calling thread's bound loop, if any.
    pub fn current() -> Option<CurrentLoop> {
        current_state().map(|state| CurrentLoop { state })
    }

    /// The runner that posts onto this loop.
    pub fn task_runner(&self) -> Arc<dyn TaskRunner> {
        self.state.task_runner()
    }

    /// Runs the loop until quit. Equivalent to running a fresh [`RunLoop`].
    pub fn run(&self) {
        RunLoop::new().run();
    }

    /// Runs the loop until it goes idle.
    pub fn run_until_idle(&self) {
        RunLoop::new().run_until_idle();
    }

    pub fn loop_type(&self) -> LoopType {
        self.state.loop_type
    }

    /// True while a nested run is active.
    pub fn is_nested(&self) -> bool {
        self.state.run_depth() > 1
    }

    /// The completion port feeding this loop, when it is a [`LoopType::Io`]
    /// loop.
    pub fn io_port(&self) -> Option<CompletionPort> {
        self.state.io_port.clone()
    }

    /// Whether any queued delayed task currently needs high timer
    /// resolution.
    pub fn has_high_resolution_tasks(&self) -> bool {
        self.state.incoming.has_high_resolution_tasks()
    }

    pub fn add_task_observer(&self, observer: Rc<dyn TaskObserver>) {
        self.state.add_task_observer(observer);
    }

    pub fn remove_task_observer(&self, observer: &Rc<dyn TaskObserver>) {
        self.state.remove_task_observer(observer);
    }

    pub fn add_destruction_observer(&self, observer: Rc<dyn DestructionObserver>) {
        self.state.add_destruction_observer(observer);
    }

    pub fn remove_destruction_observer(&self, observer: &Rc<dyn DestructionObserver>) {
        self.state.remove_destruction_observer(observer);
    }
}

impl Drop for MessageLoop {
    fn drop(&mut self) {
        let state = &self.state;
        debug_assert!(
            state.run_loops.borrow().is_empty(),
            "message loop destroyed while running"
        );

        if state.in_high_res_mode.get() {
            sys::activate_high_resolution_timer(false);
        }

        // Clean up unprocessed tasks, with care: destroying a task can post
        // more tasks (delete_soon chains, most commonly). Bound the number
        // of rounds so one stubborn task cannot keep us here forever.
        let mut did_work = false;
        for _ in 0..DESTRUCTION_ROUNDS {
            state.delete_pending_tasks();
            {
                let mut work_queue = state.work_queue.borrow_mut();
                state.incoming.reload_work_queue(&mut work_queue);
            }
            did_work = state.delete_pending_tasks();
            if !did_work {
                break;
            }
        }
        if did_work {
            warn!(
                "message loop destruction still finding new tasks after {} rounds",
                DESTRUCTION_ROUNDS
            );
        }

        let observers: Vec<_> = state.destruction_observers.borrow().clone();
        for observer in observers {
            observer.will_destroy_current_message_loop();
        }

        state.incoming.shutdown();
        runner::set_current(None);
        CURRENT_LOOP.with(|current| {
            let mut current = current.borrow_mut();
            if current
                .as_ref()
                .map_or(false, |c| Rc::ptr_eq(c, &self.state))
            {
                *current = None;
            }
        });
    }
}

/// A borrowed view of the calling thread's bound loop.
///
/// This is a value handle (it keeps the loop's shared state alive but does
/// not own the loop); it cannot leave the thread.
pub struct CurrentLoop {
    state: Rc<LoopState>,
}

impl CurrentLoop {
    pub fn task_runner(&self) -> Arc<dyn TaskRunner> {
        self.state.task_runner()
    }

    pub fn loop_type(&self) -> LoopType {
        self.state.loop_type
    }

    pub fn is_nested(&self) -> bool {
        self.state.run_depth() > 1
    }

    pub fn io_port(&self) -> Option<CompletionPort> {
        self.state.io_port.clone()
    }

    /// Asks the innermost run to exit once the loop goes idle.
    pub fn quit_when_idle(&self) {
        self.state.quit_when_idle();
    }

    /// Exits the innermost run at the next pump iteration, leaving queued
    /// work in place.
    pub fn quit_now(&self) {
        self.state.quit_now();
    }

    pub fn add_task_observer(&self, observer: Rc<dyn TaskObserver>) {
        self.state.add_task_observer(observer);
    }

    pub fn remove_task_observer(&self, observer: &Rc<dyn TaskObserver>) {
        self.state.remove_task_observer(observer);
    }

    pub fn add_destruction_observer(&self, observer: Rc<dyn DestructionObserver>) {
        self.state.add_destruction_observer(observer);
    }

    pub fn remove_destruction_observer(&self, observer: &Rc<dyn DestructionObserver>) {
        self.state.remove_destruction_observer(observer);
    }
}
