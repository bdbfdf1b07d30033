//! Message pumps: the blocking primitive at the bottom of every loop.
//!
//! A pump runs on exactly one thread and drives its [`Delegate`] through
//! three callbacks per iteration: [`do_work`] (one ready immediate task),
//! [`do_delayed_work`] (one ready delayed task plus the next wakeup time),
//! and [`do_idle_work`] (a last chance before blocking). When all three come
//! back empty the pump blocks until a [`Waker`] kicks it or the next delayed
//! run time arrives.
//!
//! Two pumps ship with the crate: [`DefaultPump`] blocks on a
//! [`WaitableEvent`], and [`IoPump`] blocks on a completion queue so that
//! asynchronous I/O completions are delivered interleaved with tasks.
//!
//! [`do_work`]: Delegate::do_work
//! [`do_delayed_work`]: Delegate::do_delayed_work
//! [`do_idle_work`]: Delegate::do_idle_work

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Instant;

use log::trace;

use crate::event::WaitableEvent;

/// The work-dispatch side of a message loop, as seen by its pump.
pub trait Delegate {
    /// Executes up to one ready non-delayed task. Returns true iff work was
    /// done.
    fn do_work(&self) -> bool;

    /// Executes up to one ready delayed task. Returns whether work was done,
    /// and the earliest pending delayed run time (`None` when the delayed
    /// queue is empty).
    fn do_delayed_work(&self) -> (bool, Option<Instant>);

    /// Last chance to do anything before the pump blocks. Returns true iff
    /// work was done.
    fn do_idle_work(&self) -> bool;
}

/// A per-thread blocking primitive that delivers work callbacks.
///
/// `run`, `quit` and `schedule_delayed_work` may only be called on the
/// pump's thread ( `quit` and `schedule_delayed_work` from within delegate
/// callbacks); cross-thread wakeups go through the [`Waker`].
pub trait Pump {
    /// Drives the delegate until [`quit`] is called. May be entered
    /// recursively from within a delegate callback; `quit` exits only the
    /// innermost `run`.
    ///
    /// [`quit`]: Pump::quit
    fn run(&self, delegate: &dyn Delegate);

    /// Makes the innermost active `run` return at the next iteration.
    fn quit(&self);

    /// Sets the time at which the pump should next call `do_delayed_work`
    /// if nothing else wakes it first.
    fn schedule_delayed_work(&self, run_time: Instant);

    /// Returns a thread-safe handle that wakes this pump.
    fn waker(&self) -> Waker;
}

pub(crate) trait Wake: Send + Sync {
    fn wake(&self);
}

/// Thread-safe handle used to wake a pump blocked in [`Pump::run`].
///
/// Wakes are level-triggered and coalesce: waking an already-awake pump is
/// cheap and waking twice is the same as waking once.
#[derive(Clone)]
pub struct Waker {
    inner: Arc<dyn Wake>,
}

impl Waker {
    pub(crate) fn new(inner: Arc<dyn Wake>) -> Waker {
        Waker { inner }
    }

    pub fn wake(&self) {
        self.inner.wake();
    }
}

impl fmt::Debug for Waker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waker").finish_non_exhaustive()
    }
}

impl Wake for WaitableEvent {
    fn wake(&self) {
        self.signal();
    }
}

/// The pump used by plain loops: blocks on an auto-reset [`WaitableEvent`].
pub struct DefaultPump {
    /// Cleared by `quit`; restored when the innermost `run` unwinds so that
    /// an enclosing `run` keeps going.
    keep_running: Cell<bool>,
    event: WaitableEvent,
    delayed_work_time: Cell<Option<Instant>>,
}

impl DefaultPump {
    pub fn new() -> DefaultPump {
        DefaultPump {
            keep_running: Cell::new(true),
            event: WaitableEvent::new(false, false),
            delayed_work_time: Cell::new(None),
        }
    }
}

impl Default for DefaultPump {
    fn default() -> DefaultPump {
        DefaultPump::new()
    }
}

impl Pump for DefaultPump {
    fn run(&self, delegate: &dyn Delegate) {
        debug_assert!(self.keep_running.get(), "quit called outside of run");
        loop {
            let mut did_work = delegate.do_work();
            if !self.keep_running.get() {
                break;
            }

            let (ran_delayed, next_time) = delegate.do_delayed_work();
            self.delayed_work_time.set(next_time);
            did_work |= ran_delayed;
            if !self.keep_running.get() {
                break;
            }
            if did_work {
                continue;
            }

            did_work = delegate.do_idle_work();
            if !self.keep_running.get() {
                break;
            }
            if did_work {
                continue;
            }

            match self.delayed_work_time.get() {
                None => {
                    trace!("pump: blocking until woken");
                    self.event.wait();
                }
                Some(run_time) => {
                    let now = Instant::now();
                    if run_time > now {
                        trace!("pump: blocking for {:?}", run_time - now);
                        self.event.timed_wait(run_time - now);
                    } else {
                        // It is time to run the delayed task; fall through to
                        // the next do_delayed_work.
                        self.delayed_work_time.set(None);
                    }
                }
            }
        }
        self.keep_running.set(true);
    }

    fn quit(&self) {
        self.keep_running.set(false);
    }

    fn schedule_delayed_work(&self, run_time: Instant) {
        self.delayed_work_time.set(Some(run_time));
    }

    fn waker(&self) -> Waker {
        Waker::new(Arc::new(self.event.clone()))
    }
}

/// Receives asynchronous I/O completions delivered through an [`IoPump`].
///
/// Completions are dispatched on the pump's thread, one per pump iteration,
/// interleaved with ordinary tasks.
pub trait IoHandler: Send + Sync {
    fn on_io_completed(&self, bytes_transferred: u32, error: u32);
}

enum Packet {
    /// A bare wakeup; counts as no work.
    Wake,
    Completion {
        handler: Weak<dyn IoHandler>,
        bytes_transferred: u32,
        error: u32,
    },
}

struct PortInner {
    packets: Mutex<VecDeque<Packet>>,
    cond: Condvar,
}

/// Thread-safe handle onto an [`IoPump`]'s completion queue.
///
/// I/O sources (or tests standing in for them) post completions here from
/// any thread; the pump dispatches them to their [`IoHandler`] on the loop's
/// thread. The handler is held weakly: a completion whose handler is gone by
/// dispatch time is dropped.
#[derive(Clone)]
pub struct CompletionPort {
    inner: Arc<PortInner>,
}

impl CompletionPort {
    fn new() -> CompletionPort {
        CompletionPort {
            inner: Arc::new(PortInner {
                packets: Mutex::new(VecDeque::new()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Queues a completion for `handler`.
    pub fn post_completion(&self, handler: &Arc<dyn IoHandler>, bytes_transferred: u32, error: u32) {
        self.push(Packet::Completion {
            handler: Arc::downgrade(handler),
            bytes_transferred,
            error,
        });
    }

    fn push(&self, packet: Packet) {
        self.inner.packets.lock().unwrap().push_back(packet);
        self.inner.cond.notify_one();
    }

    /// Pops one packet, blocking until `deadline` (or forever) when the
    /// queue is empty. Returns `None` on timeout.
    fn next_packet(&self, deadline: Option<Instant>) -> Option<Packet> {
        let mut packets = self.inner.packets.lock().unwrap();
        loop {
            if let Some(packet) = packets.pop_front() {
                return Some(packet);
            }
            match deadline {
                None => packets = self.inner.cond.wait(packets).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (next, _) = self
                        .inner
                        .cond
                        .wait_timeout(packets, deadline - now)
                        .unwrap();
                    packets = next;
                }
            }
        }
    }

    fn try_next_packet(&self) -> Option<Packet> {
        self.inner.packets.lock().unwrap().pop_front()
    }
}

impl fmt::Debug for CompletionPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionPort").finish_non_exhaustive()
    }
}

struct PortWaker {
    port: CompletionPort,
}

impl Wake for PortWaker {
    fn wake(&self) {
        self.port.push(Packet::Wake);
    }
}

/// The pump used by I/O loops: blocks on a completion queue and dispatches
/// completion packets as work.
pub struct IoPump {
    keep_running: Cell<bool>,
    port: CompletionPort,
    delayed_work_time: Cell<Option<Instant>>,
}

impl IoPump {
    pub fn new() -> IoPump {
        IoPump {
            keep_running: Cell::new(true),
            port: CompletionPort::new(),
            delayed_work_time: Cell::new(None),
        }
    }

    /// The handle I/O sources use to deliver completions to this pump.
    pub fn port(&self) -> CompletionPort {
        self.port.clone()
    }

    /// Dispatches one queued packet. Returns true iff it was a completion
    /// (a bare wake is not work).
    fn process_packet(&self, packet: Packet) -> bool {
        match packet {
            Packet::Wake => false,
            Packet::Completion {
                handler,
                bytes_transferred,
                error,
            } => match handler.upgrade() {
                Some(handler) => {
                    handler.on_io_completed(bytes_transferred, error);
                    true
                }
                None => {
                    trace!("io pump: dropping completion for dead handler");
                    false
                }
            },
        }
    }
}

impl Default for IoPump {
    fn default() -> IoPump {
        IoPump::new()
    }
}

impl Pump for IoPump {
    fn run(&self, delegate: &dyn Delegate) {
        debug_assert!(self.keep_running.get(), "quit called outside of run");
        loop {
            let mut did_work = delegate.do_work();
            if !self.keep_running.get() {
                break;
            }

            // Completions queued while tasks ran count as work too.
            if let Some(packet) = self.port.try_next_packet() {
                did_work |= self.process_packet(packet);
            }
            if !self.keep_running.get() {
                break;
            }

            let (ran_delayed, next_time) = delegate.do_delayed_work();
            self.delayed_work_time.set(next_time);
            did_work |= ran_delayed;
            if !self.keep_running.get() {
                break;
            }
            if did_work {
                continue;
            }

            did_work = delegate.do_idle_work();
            if !self.keep_running.get() {
                break;
            }
            if did_work {
                continue;
            }

            let deadline = self.delayed_work_time.get();
            if let Some(run_time) = deadline {
                if run_time <= Instant::now() {
                    self.delayed_work_time.set(None);
                    continue;
                }
            }
            trace!("io pump: blocking until completion or {:?}", deadline);
            if let Some(packet) = self.port.next_packet(deadline) {
                self.process_packet(packet);
            }
        }
        self.keep_running.set(true);
    }

    fn quit(&self) {
        self.keep_running.set(false);
    }

    fn schedule_delayed_work(&self, run_time: Instant) {
        self.delayed_work_time.set(Some(run_time));
    }

    fn waker(&self) -> Waker {
        Waker::new(Arc::new(PortWaker {
            port: self.port.clone(),
        }))
    }
}
