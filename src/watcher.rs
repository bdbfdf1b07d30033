//! Asynchronous waits: run a callback on this thread when an event signals.
//!
//! A [`WaitableEventWatcher`] enrolls in a [`WaitableEvent`]'s wait list;
//! when the event signals, the callback is posted to the task runner of the
//! thread that called [`start_watching`], so it runs on the loop like any
//! other task. The watcher holds only a weak cancellation handle across the
//! gap: stopping the watch (or dropping the watcher) invalidates the handle,
//! and an in-flight callback that has not run yet is dropped instead of
//! resurrecting watcher state.
//!
//! Auto-reset caveat: the signal is consumed the moment the waiter fires. If
//! the watch is stopped between the fire and the callback running, that
//! signal is lost. With a manual-reset event the next [`start_watching`]
//! simply observes the still-signaled state. This is the deterministic
//! policy this crate commits to.
//!
//! [`start_watching`]: WaitableEventWatcher::start_watching

use std::fmt;
use std::sync::Arc;

use log::error;

use crate::event::{WaitableEvent, Waiter};
use crate::runner;
use crate::task::Closure;
use crate::weak::{WeakFactory, WeakHandle};
use crate::TaskRunner;

/// Invoked on the watching thread with the event that signaled.
///
/// Clonable so a watch can be re-armed with the same callback.
pub type EventCallback = Arc<dyn Fn(&WaitableEvent) + Send + Sync>;

struct AsyncWaiter {
    runner: Arc<dyn TaskRunner>,
    callback: EventCallback,
    cancel: WeakHandle,
}

impl Waiter for AsyncWaiter {
    fn fire(&self, event: &WaitableEvent) -> bool {
        let callback = self.callback.clone();
        let event = event.clone();
        self.runner.post_task(Closure::cancelable(
            self.cancel.clone(),
            move || callback(&event),
        ));
        // An async waiter never rejects: the posted task carries the
        // cancellation check instead.
        true
    }
}

/// Watches a single [`WaitableEvent`] and delivers one callback per watch.
///
/// All methods must be called on one thread, and that thread needs a bound
/// message loop for the callback to be delivered to.
pub struct WaitableEventWatcher {
    /// Present while a watch is active; invalidated to cancel delivery.
    canceler: Option<WeakFactory>,
    /// Present while we are enrolled in the event's wait list.
    waiter: Option<Arc<AsyncWaiter>>,
    event: Option<WaitableEvent>,
    callback: Option<EventCallback>,
}

impl WaitableEventWatcher {
    pub fn new() -> WaitableEventWatcher {
        WaitableEventWatcher {
            canceler: None,
            waiter: None,
            event: None,
            callback: None,
        }
    }

    /// Starts watching `event`. When it signals, `callback` runs on the
    /// calling thread's loop. An already-signaled event delivers the
    /// callback immediately (consuming the signal if auto-reset).
    ///
    /// An active previous watch is stopped first. Returns false if the
    /// calling thread has no bound loop.
    pub fn start_watching(&mut self, event: &WaitableEvent, callback: EventCallback) -> bool {
        let Some(runner) = runner::current() else {
            error!("WaitableEventWatcher requires a message loop on this thread");
            return false;
        };

        self.stop_watching();

        let factory = WeakFactory::new();
        let waiter = Arc::new(AsyncWaiter {
            runner,
            callback: callback.clone(),
            cancel: factory.handle(),
        });

        self.canceler = Some(factory);
        self.event = Some(event.clone());
        self.callback = Some(callback);

        if event.enqueue_or_consume(waiter.clone() as Arc<dyn Waiter>) {
            // Already signaled; deliver without enrolling.
            waiter.fire(event);
        } else {
            self.waiter = Some(waiter);
        }
        true
    }

    /// Cancels the current watch. The callback will not run after this
    /// returns, not even if the event already signaled. No-op when nothing
    /// is being watched.
    pub fn stop_watching(&mut self) {
        if let Some(factory) = self.canceler.take() {
            factory.invalidate_all();
        }
        if let (Some(waiter), Some(event)) = (self.waiter.take(), self.event.as_ref()) {
            event.dequeue(&(waiter as Arc<dyn Waiter>));
        }
        self.event = None;
        self.callback = None;
    }

    pub fn is_watching(&self) -> bool {
        self.canceler.is_some()
    }

    /// The event of the active watch, if any.
    pub fn watched_event(&self) -> Option<WaitableEvent> {
        self.event.clone()
    }

    /// The callback of the active watch, if any. Together with
    /// [`watched_event`] this lets a caller suspend a watch and re-arm it
    /// later.
    ///
    /// [`watched_event`]: WaitableEventWatcher::watched_event
    pub fn callback(&self) -> Option<EventCallback> {
        self.callback.clone()
    }
}

impl Default for WaitableEventWatcher {
    fn default() -> WaitableEventWatcher {
        WaitableEventWatcher::new()
    }
}

impl Drop for WaitableEventWatcher {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

impl fmt::Debug for WaitableEventWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitableEventWatcher")
            .field("watching", &self.is_watching())
            .field("event", &self.event)
            .finish()
    }
}
