//! A thread with a message loop on it.
//!
//! [`Thread`] owns a dedicated OS thread whose entire life is running a
//! [`MessageLoop`]: start it, post work through [`task_runner`], stop it.
//! Stopping is cooperative; queued work is run to completion (the quit is a
//! quit-when-idle), then the thread is joined.
//!
//! [`task_runner`]: Thread::task_runner

use std::cell::Cell;
use std::io;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{debug, error};

use crate::event::WaitableEvent;
use crate::message_loop::{LoopType, MessageLoop};
use crate::pump::Pump;
use crate::task::Closure;
use crate::TaskRunner;

thread_local! {
    /// Records whether this thread's loop was quit through Thread::stop
    /// rather than by someone calling quit_when_idle directly (which would
    /// bypass the stop bookkeeping).
    static QUIT_PROPERLY: Cell<bool> = const { Cell::new(false) };
}

fn set_thread_was_quit_properly(flag: bool) {
    QUIT_PROPERLY.with(|quit| quit.set(flag));
}

fn thread_was_quit_properly() -> bool {
    QUIT_PROPERLY.with(|quit| quit.get())
}

/// Posted onto the thread's loop to make it exit.
fn thread_quit_helper() {
    let current = MessageLoop::current().expect("quit helper ran without a loop");
    current.quit_when_idle();
    set_thread_was_quit_properly(true);
}

/// Options for [`Thread::start_with_options`].
pub struct Options {
    /// The kind of loop the thread runs.
    pub loop_type: LoopType,
    /// Stack size for the OS thread; 0 means the platform default.
    pub stack_size: usize,
    /// Supplies the pump when `loop_type` is [`LoopType::Custom`].
    pub pump_factory: Option<Box<dyn FnOnce() -> Rc<dyn Pump> + Send>>,
}

impl Options {
    pub fn new(loop_type: LoopType) -> Options {
        Options {
            loop_type,
            stack_size: 0,
            pump_factory: None,
        }
    }
}

impl Default for Options {
    fn default() -> Options {
        Options::new(LoopType::Default)
    }
}

struct Shared {
    running: Mutex<bool>,
    start_event: WaitableEvent,
}

/// An owned OS thread running a message loop.
///
/// Dropping the `Thread` stops it (posting a quit and joining), so work
/// posted to it never outlives the object that reaches it.
pub struct Thread {
    name: String,
    join_handle: Option<JoinHandle<()>>,
    task_runner: Option<Arc<dyn TaskRunner>>,
    loop_type: LoopType,
    stopping: bool,
    shared: Arc<Shared>,
}

impl Thread {
    pub fn new(name: impl Into<String>) -> Thread {
        Thread {
            name: name.into(),
            join_handle: None,
            task_runner: None,
            loop_type: LoopType::Default,
            stopping: false,
            shared: Arc::new(Shared {
                running: Mutex::new(false),
                start_event: WaitableEvent::new(false, false),
            }),
        }
    }

    /// Starts the thread with a default loop.
    pub fn start(&mut self) -> io::Result<()> {
        self.start_with_options(Options::default())
    }

    /// Starts the thread with the given options. The task runner is usable
    /// as soon as this returns; tasks queue until the new thread binds its
    /// loop.
    pub fn start_with_options(&mut self, options: Options) -> io::Result<()> {
        assert!(self.join_handle.is_none(), "thread already started");

        set_thread_was_quit_properly(false);

        let loop_type = if options.pump_factory.is_some() {
            LoopType::Custom
        } else {
            options.loop_type
        };
        let unbound = match options.pump_factory {
            Some(factory) => MessageLoop::create_unbound_with_pump(factory),
            None => MessageLoop::create_unbound(loop_type),
        };
        let task_runner = unbound.task_runner();

        let mut builder = std::thread::Builder::new().name(self.name.clone());
        if options.stack_size > 0 {
            builder = builder.stack_size(options.stack_size);
        }

        let shared = self.shared.clone();
        let join_handle = builder.spawn(move || {
            let message_loop = unbound.bind_to_current_thread();

            {
                *shared.running.lock().unwrap() = true;
            }
            shared.start_event.signal();

            message_loop.run();

            {
                *shared.running.lock().unwrap() = false;
            }

            if message_loop.loop_type() != LoopType::Custom && !thread_was_quit_properly() {
                // Somebody quit the loop underneath us instead of going
                // through Thread::stop; the loop teardown below may skip
                // cleanup that stop would have sequenced.
                error!("thread exited without Thread::stop");
                debug_assert!(thread_was_quit_properly());
            }
            // The loop is destructed here; no further posts are accepted.
        })?;

        debug!("started thread '{}' ({:?})", self.name, loop_type);
        self.join_handle = Some(join_handle);
        self.task_runner = Some(task_runner);
        self.loop_type = loop_type;
        Ok(())
    }

    /// Signals the thread to stop once idle and joins it. Idempotent. Called
    /// automatically on drop.
    pub fn stop(&mut self) {
        let Some(join_handle) = self.join_handle.take() else {
            return;
        };

        self.stop_soon();

        if let Err(panic) = join_handle.join() {
            // Propagate: the loop thread died with a panic and the caller
            // should not carry on as if the work completed.
            std::panic::resume_unwind(panic);
        }

        self.task_runner = None;
        self.stopping = false;
        debug!("stopped thread '{}'", self.name);
    }

    /// Signals the thread to stop once idle without joining. Call [`stop`]
    /// (or drop the `Thread`) to join afterwards.
    ///
    /// [`stop`]: Thread::stop
    pub fn stop_soon(&mut self) {
        if self.stopping {
            return;
        }
        let Some(task_runner) = &self.task_runner else {
            return;
        };
        self.stopping = true;
        task_runner.post_task(Closure::new(thread_quit_helper));
    }

    /// The runner posting onto this thread's loop, while the thread is
    /// started.
    pub fn task_runner(&self) -> Option<Arc<dyn TaskRunner>> {
        self.task_runner.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loop_type(&self) -> LoopType {
        self.loop_type
    }

    /// True from the moment the thread's loop is bound until it stops
    /// running.
    pub fn is_running(&self) -> bool {
        if self.task_runner.is_some() && !self.stopping {
            return true;
        }
        *self.shared.running.lock().unwrap()
    }

    /// Blocks until the thread's loop is bound and running. Returns false if
    /// the thread was never started.
    pub fn wait_until_started(&self) -> bool {
        if self.join_handle.is_none() && self.task_runner.is_none() {
            return false;
        }
        self.shared.start_event.wait();
        true
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.stop();
    }
}
