//! Waitable events: manual- and auto-reset kernel-style event objects.
//!
//! A [`WaitableEvent`] is the crate's bridge between threads that block and
//! threads that signal. It deliberately mirrors the semantics of an OS event
//! object rather than a condition variable: state is a single signaled bit,
//! manual-reset events stay signaled until [`reset`], and auto-reset events
//! release exactly one waiter per signal.
//!
//! `WaitableEvent` is a clonable value handle over shared state, so the same
//! event can be waited on, signaled and watched from several places without
//! anyone holding references into somebody else's internals. Equality is
//! identity of the underlying state.
//!
//! [`reset`]: WaitableEvent::reset

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Upper bound on the number of events a single [`wait_many`] may observe,
/// matching the limit of the native wait APIs this models.
pub const MAX_WAIT_OBJECTS: usize = 64;

/// An entry in an event's wait list.
///
/// Consider a waiter enrolled in two auto-reset events that are signaled at
/// the same time. Each signal releases the first waiter in its list, but both
/// lists contain the *same* waiter, so two auto-resets would have happened
/// for one wakeup. To keep that accounting honest a waiter may *reject* a
/// wake by returning `false` from `fire`, in which case an auto-reset event
/// behaves as if nobody was woken and stays signaled.
pub(crate) trait Waiter: Send + Sync {
    /// Wake the waiter because `event` was signaled. Returns `false` to
    /// reject the wake.
    fn fire(&self, event: &WaitableEvent) -> bool;
}

struct KernelState {
    signaled: bool,
    waiters: Vec<Arc<dyn Waiter>>,
}

struct Kernel {
    manual_reset: bool,
    state: Mutex<KernelState>,
}

/// A manual- or auto-reset event.
///
/// `wait` returns happen-after the `signal` call that caused them, so the
/// signaling side may immediately drop its handle:
///
/// ```
/// use looper::WaitableEvent;
///
/// let event = WaitableEvent::new(false, false);
/// let theirs = event.clone();
/// let handle = std::thread::spawn(move || {
///     theirs.signal();
///     // `theirs` dropped here; the waiter still observes the signal.
/// });
/// event.wait();
/// handle.join().unwrap();
/// ```
#[derive(Clone)]
pub struct WaitableEvent {
    kernel: Arc<Kernel>,
}

impl WaitableEvent {
    /// Creates a new event.
    ///
    /// If `manual_reset` is true the event stays signaled until [`reset`] is
    /// called; otherwise a single released waiter resets it automatically.
    ///
    /// [`reset`]: WaitableEvent::reset
    pub fn new(manual_reset: bool, initially_signaled: bool) -> WaitableEvent {
        WaitableEvent {
            kernel: Arc::new(Kernel {
                manual_reset,
                state: Mutex::new(KernelState {
                    signaled: initially_signaled,
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    /// Puts the event in the signaled state, waking waiters per the reset
    /// mode.
    pub fn signal(&self) {
        let mut state = self.lock_state();
        if state.signaled {
            return;
        }
        if self.kernel.manual_reset {
            state.signaled = true;
            for waiter in state.waiters.drain(..) {
                waiter.fire(self);
            }
        } else {
            // Release the first waiter that accepts the wake; if everybody
            // rejects (or the list is empty), the signal is banked.
            let mut released = false;
            while !state.waiters.is_empty() {
                let waiter = state.waiters.remove(0);
                if waiter.fire(self) {
                    released = true;
                    break;
                }
            }
            if !released {
                state.signaled = true;
            }
        }
    }

    /// Puts the event in the un-signaled state.
    pub fn reset(&self) {
        self.lock_state().signaled = false;
    }

    /// Returns whether the event is signaled. On an auto-reset event this
    /// consumes the signal, exactly like a zero-length wait.
    pub fn is_signaled(&self) -> bool {
        let mut state = self.lock_state();
        let signaled = state.signaled;
        if signaled && !self.kernel.manual_reset {
            state.signaled = false;
        }
        signaled
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) {
        let fired = self.wait_until(None);
        debug_assert!(fired);
    }

    /// Blocks until the event is signaled or `max_time` has elapsed. Returns
    /// true if the event was signaled. Timing out consumes nothing: a signal
    /// racing the timeout is either fully observed (true) or left for the
    /// next waiter.
    pub fn timed_wait(&self, max_time: Duration) -> bool {
        self.wait_until(Instant::now().checked_add(max_time))
    }

    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let waiter = Arc::new(SyncWaiter::new());
        {
            let mut state = self.lock_state();
            if state.signaled {
                if !self.kernel.manual_reset {
                    state.signaled = false;
                }
                return true;
            }
            state.waiters.push(waiter.clone() as Arc<dyn Waiter>);
        }

        if waiter.block(deadline) {
            return true;
        }

        // Timed out. Pull ourselves out of the wait list, then re-check: a
        // signal may have fired us between the timeout and the dequeue, and
        // that signal was consumed on our behalf.
        self.dequeue(&(waiter.clone() as Arc<dyn Waiter>));
        waiter.has_fired()
    }

    fn lock_state(&self) -> MutexGuard<'_, KernelState> {
        self.kernel.state.lock().unwrap()
    }

    /// Enrolls `waiter` in the wait list, or consumes an already-signaled
    /// state. Returns true if the event was signaled (the waiter was *not*
    /// enqueued).
    pub(crate) fn enqueue_or_consume(&self, waiter: Arc<dyn Waiter>) -> bool {
        let mut state = self.lock_state();
        if state.signaled {
            if !self.kernel.manual_reset {
                state.signaled = false;
            }
            return true;
        }
        state.waiters.push(waiter);
        false
    }

    /// Removes `waiter` from the wait list if it is still enrolled.
    pub(crate) fn dequeue(&self, waiter: &Arc<dyn Waiter>) {
        let target = Arc::as_ptr(waiter) as *const ();
        self.lock_state()
            .waiters
            .retain(|w| Arc::as_ptr(w) as *const () != target);
    }

    fn kernel_addr(&self) -> usize {
        Arc::as_ptr(&self.kernel) as usize
    }
}

impl PartialEq for WaitableEvent {
    fn eq(&self, other: &WaitableEvent) -> bool {
        Arc::ptr_eq(&self.kernel, &other.kernel)
    }
}

impl Eq for WaitableEvent {}

impl fmt::Debug for WaitableEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitableEvent")
            .field("kernel", &Arc::as_ptr(&self.kernel))
            .field("manual_reset", &self.kernel.manual_reset)
            .finish()
    }
}

/// Blocks until one of `events` is signaled and returns its index.
///
/// If several events are already signaled the lowest index wins. At most one
/// auto-reset event is consumed per call. The wait set must not contain the
/// same event twice.
///
/// As with [`WaitableEvent::wait`], the return happens-after the signal that
/// caused it.
pub fn wait_many(events: &[&WaitableEvent]) -> usize {
    assert!(!events.is_empty(), "wait_many needs at least one event");
    assert!(
        events.len() <= MAX_WAIT_OBJECTS,
        "can only wait on {} events at once",
        MAX_WAIT_OBJECTS
    );

    let waiter = Arc::new(SyncWaiter::new());

    // Lock every kernel, in address order so that concurrent wait_many calls
    // over overlapping sets cannot deadlock.
    let mut order: Vec<usize> = (0..events.len()).collect();
    order.sort_by_key(|&i| events[i].kernel_addr());

    let mut guards: Vec<(usize, MutexGuard<'_, KernelState>)> = Vec::with_capacity(order.len());
    for &i in &order {
        guards.push((i, events[i].lock_state()));
    }

    // First pass: an event that is already signaled wins outright, lowest
    // original index first.
    for (idx, event) in events.iter().enumerate() {
        let slot = guards
            .iter_mut()
            .find(|(i, _)| *i == idx)
            .expect("kernel not locked");
        if slot.1.signaled {
            if !event.kernel.manual_reset {
                slot.1.signaled = false;
            }
            return idx;
        }
    }

    // Second pass: enroll in every wait list, release the locks, block.
    for (_, guard) in guards.iter_mut() {
        guard.waiters.push(waiter.clone() as Arc<dyn Waiter>);
    }
    drop(guards);

    waiter.block(None);

    // Whichever event fired us already dropped us from its list; drop out of
    // the rest.
    let as_waiter = waiter.clone() as Arc<dyn Waiter>;
    for event in events {
        event.dequeue(&as_waiter);
    }

    let signaling = waiter
        .signaling_event()
        .expect("woken without a signaling event");
    events
        .iter()
        .position(|e| **e == signaling)
        .expect("signaled event is not in the wait set")
}

/// A waiter that parks the calling thread. Accepts at most one fire; further
/// fires are rejected so that a second auto-reset event does not burn a
/// signal on an already-woken thread.
struct SyncWaiter {
    inner: Mutex<SyncWaiterState>,
    cond: Condvar,
}

struct SyncWaiterState {
    fired: bool,
    signaling_event: Option<WaitableEvent>,
}

impl SyncWaiter {
    fn new() -> SyncWaiter {
        SyncWaiter {
            inner: Mutex::new(SyncWaiterState {
                fired: false,
                signaling_event: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Parks until fired or the deadline passes. Returns whether we fired.
    fn block(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.inner.lock().unwrap();
        while !state.fired {
            match deadline {
                None => state = self.cond.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (next, _) = self.cond.wait_timeout(state, deadline - now).unwrap();
                    state = next;
                }
            }
        }
        true
    }

    fn has_fired(&self) -> bool {
        self.inner.lock().unwrap().fired
    }

    fn signaling_event(&self) -> Option<WaitableEvent> {
        self.inner.lock().unwrap().signaling_event.clone()
    }
}

impl Waiter for SyncWaiter {
    fn fire(&self, event: &WaitableEvent) -> bool {
        let mut state = self.inner.lock().unwrap();
        if state.fired {
            return false;
        }
        state.fired = true;
        state.signaling_event = Some(event.clone());
        self.cond.notify_one();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn manual_reset_stays_signaled() {
        let event = WaitableEvent::new(true, false);
        event.signal();
        assert!(event.is_signaled());
        assert!(event.is_signaled());
        event.reset();
        assert!(!event.is_signaled());
    }

    #[test]
    fn auto_reset_consumes() {
        let event = WaitableEvent::new(false, true);
        assert!(event.is_signaled());
        assert!(!event.is_signaled());
    }

    #[test]
    fn timed_wait_times_out() {
        let event = WaitableEvent::new(false, false);
        assert!(!event.timed_wait(Duration::from_millis(10)));
    }

    #[test]
    fn cross_thread_wakeup() {
        let event = WaitableEvent::new(false, false);
        let signaler = event.clone();
        let handle = thread::spawn(move || signaler.signal());
        event.wait();
        handle.join().unwrap();
    }

    #[test]
    fn wait_many_returns_signaled_index() {
        let a = WaitableEvent::new(true, false);
        let b = WaitableEvent::new(true, true);
        assert_eq!(wait_many(&[&a, &b]), 1);
    }

    #[test]
    fn wait_many_prefers_lowest_index() {
        let a = WaitableEvent::new(true, true);
        let b = WaitableEvent::new(true, true);
        assert_eq!(wait_many(&[&a, &b]), 0);
    }

    #[test]
    fn wait_many_wakes_on_later_signal() {
        let a = WaitableEvent::new(false, false);
        let b = WaitableEvent::new(false, false);
        let signaler = b.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaler.signal();
        });
        assert_eq!(wait_many(&[&a, &b]), 1);
        handle.join().unwrap();
    }

    #[test]
    fn auto_reset_releases_one_waiter() {
        let event = WaitableEvent::new(false, false);
        let woken = Arc::new(Mutex::new(0));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let event = event.clone();
            let woken = woken.clone();
            handles.push(thread::spawn(move || {
                if event.timed_wait(Duration::from_millis(200)) {
                    *woken.lock().unwrap() += 1;
                }
            }));
        }

        thread::sleep(Duration::from_millis(50));
        event.signal();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*woken.lock().unwrap(), 1);
    }
}
