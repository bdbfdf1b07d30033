//! Synchronous channels: blocking sends with nested dispatch.
//!
//! When a thread is blocked in [`SyncChannel::send`] waiting for a reply,
//! inbound synchronous messages may be blocking that reply (directly from
//! the object being called, or indirectly through other channels), so they
//! must be dispatched right away. A simple "am I blocked" check is not
//! enough because the listener thread can be in the middle of entering
//! `send`; instead, every inbound sync message is parked on a queue shared
//! by all sync channels of the listener thread and a manual-reset dispatch
//! event is signaled. The blocking send waits on that event alongside its
//! own reply event and drains the queue whenever it fires; if no send is in
//! progress, a task posted to the listener thread drains it instead.
//!
//! Outgoing sync sends form a LIFO stack (nested calls work like a call
//! stack). Each send blocks on its own manual-reset *done* event: between
//! the signal and the woken side acting on it, another send can start and
//! re-enter the wait, and an auto-reset event's signal could be consumed by
//! the wrong iteration. Replies that do not match the top of the stack
//! arrived out of order because of nesting; they are held and retried each
//! time the stack pops.
//!
//! Dispatch while blocked can be restricted to a *group*: a parked message
//! is only dispatched while blocked if its channel's group matches the
//! sending channel's (or is unrestricted). Unrelated subsystems set
//! different groups so a blocking send cannot reenter them.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, trace};

use crate::event::{self, WaitableEvent};
use crate::ipc::channel::{Channel, ChannelDelegate, ChannelHandle, Mode};
use crate::ipc::message::Message;
use crate::ipc::sync_message::{self, ReplyDeserializer, SyncMessage};
use crate::ipc::Listener;
use crate::message_loop::MessageLoop;
use crate::run_loop::RunLoop;
use crate::runner;
use crate::task::Closure;
use crate::watcher::{EventCallback, WaitableEventWatcher};
use crate::TaskRunner;

/// The dispatch group that matches every other group.
pub const RESTRICT_DISPATCH_GROUP_NONE: u32 = 0;

/// Observes and optionally intercepts messages on the I/O thread, before
/// they reach the listener.
pub trait MessageFilter: Send + Sync {
    /// The filter is attached to a live channel; `sender` can be used to
    /// send from any thread.
    fn on_filter_added(&self, _sender: &Channel) {}
    /// The channel broke.
    fn on_channel_error(&self) {}
    /// The channel is closing down normally.
    fn on_channel_closing(&self) {}
    /// Returns true to consume `message` before regular processing.
    fn on_message_received(&self, _message: &Message) -> bool {
        false
    }
}

/// One outstanding synchronous send. Exactly one exists per in-flight send;
/// together they mirror the call stack of nested sends.
struct PendingSyncMsg {
    id: i32,
    deserializer: Option<Box<dyn ReplyDeserializer>>,
    done_event: WaitableEvent,
    send_result: bool,
}

struct QueuedMessage {
    message: Message,
    context: Arc<SyncContext>,
}

struct QueueState {
    message_queue: Vec<QueuedMessage>,
    /// True while a drain task is on its way to the listener thread.
    task_pending: bool,
}

/// Inbound sync messages parked for the listener thread. One instance is
/// shared by every sync channel on that thread, because any of them can
/// receive a sync message while another one is blocked.
pub(crate) struct ReceivedSyncMsgQueue {
    state: Mutex<QueueState>,
    /// Replies that arrived while their send was not on top of the stack.
    /// I/O thread only.
    received_replies: Mutex<Vec<QueuedMessage>>,
    /// Manual reset: signaled whenever a sync message is parked, reset by
    /// the drain that observes it. Manual because a blocked send observes it
    /// through `wait_many` while a watcher may also be enrolled, and an
    /// auto-reset would be consumed by whichever looks first.
    dispatch_event: WaitableEvent,
    listener_runner: Arc<dyn TaskRunner>,
}

thread_local! {
    static RECEIVED_SYNC_MSG_QUEUE: RefCell<Option<Arc<ReceivedSyncMsgQueue>>> =
        const { RefCell::new(None) };
    static LISTENER_COUNT: Cell<usize> = const { Cell::new(0) };
    /// Stack of suspended send-done watches, one frame per nested
    /// pump-messages send; see `wait_for_reply_with_nested_loop`.
    static TOP_SEND_DONE_WATCHER: RefCell<Option<Rc<RefCell<WaitableEventWatcher>>>> =
        const { RefCell::new(None) };
}

impl ReceivedSyncMsgQueue {
    /// Returns the calling (listener) thread's queue, creating it for the
    /// first channel. Balance with `remove_context`.
    fn add_context() -> Arc<ReceivedSyncMsgQueue> {
        let queue = RECEIVED_SYNC_MSG_QUEUE.with(|slot| {
            let mut slot = slot.borrow_mut();
            match &*slot {
                Some(queue) => queue.clone(),
                None => {
                    let queue = Arc::new(ReceivedSyncMsgQueue {
                        state: Mutex::new(QueueState {
                            message_queue: Vec::new(),
                            task_pending: false,
                        }),
                        received_replies: Mutex::new(Vec::new()),
                        dispatch_event: WaitableEvent::new(true, false),
                        listener_runner: runner::current()
                            .expect("sync channels require a message loop on the listener thread"),
                    });
                    *slot = Some(queue.clone());
                    queue
                }
            }
        });
        LISTENER_COUNT.with(|count| count.set(count.get() + 1));
        queue
    }

    /// Purges a dying channel's parked messages; drops the thread's queue
    /// with the last channel.
    fn remove_context(queue: &Arc<ReceivedSyncMsgQueue>, context: &Arc<SyncContext>) {
        queue
            .state
            .lock()
            .unwrap()
            .message_queue
            .retain(|queued| !Arc::ptr_eq(&queued.context, context));

        LISTENER_COUNT.with(|count| {
            count.set(count.get() - 1);
            if count.get() == 0 {
                RECEIVED_SYNC_MSG_QUEUE.with(|slot| *slot.borrow_mut() = None);
            }
        });
    }

    /// Parks an inbound sync message (I/O thread). Signals the dispatch
    /// event for a blocked send, and posts a drain task in case nobody is
    /// blocked.
    fn queue_message(queue: &Arc<ReceivedSyncMsgQueue>, message: Message, context: Arc<SyncContext>) {
        let was_task_pending = {
            let mut state = queue.state.lock().unwrap();
            let was = state.task_pending;
            state.task_pending = true;
            state.message_queue.push(QueuedMessage {
                message,
                context: context.clone(),
            });
            was
        };

        queue.dispatch_event.signal();
        if !was_task_pending {
            let for_task = queue.clone();
            queue.listener_runner.post_task(Closure::new(move || {
                for_task.state.lock().unwrap().task_pending = false;
                context.dispatch_messages();
            }));
        }
    }

    /// Holds a reply that did not match the top of its context's send stack
    /// (I/O thread).
    fn queue_reply(&self, message: Message, context: Arc<SyncContext>) {
        trace!("parking out-of-order reply {}", SyncMessage::message_id(&message));
        self.received_replies
            .lock()
            .unwrap()
            .push(QueuedMessage { message, context });
    }

    /// Drains parked messages dispatchable by `dispatching` (listener
    /// thread). Dispatch can reenter and repark, so the queue is re-scanned
    /// from the front after every message.
    fn dispatch_messages(&self, dispatching: &Arc<SyncContext>) {
        loop {
            let next = {
                let mut state = self.state.lock().unwrap();
                let group = dispatching.restrict_dispatch_group();
                let index = state.message_queue.iter().position(|queued| {
                    let message_group = queued.context.restrict_dispatch_group();
                    message_group == RESTRICT_DISPATCH_GROUP_NONE || message_group == group
                });
                index.map(|i| state.message_queue.remove(i))
            };
            match next {
                None => break,
                Some(queued) => queued.context.on_dispatch_message(&queued.message),
            }
        }
    }

    /// Retries parked replies against the current tops of their send stacks
    /// (I/O thread); runs after every pop of a send stack. At most one reply
    /// is promoted per pass. The list is taken out of the lock first so the
    /// deserializer never runs under it; only this thread appends, so
    /// nothing is lost in between.
    fn dispatch_replies(&self) {
        let replies = std::mem::take(&mut *self.received_replies.lock().unwrap());
        let mut kept = Vec::with_capacity(replies.len());
        let mut unblocked = false;
        for queued in replies {
            if !unblocked && queued.context.try_to_unblock_listener(&queued.message) {
                unblocked = true;
            } else {
                kept.push(queued);
            }
        }
        let mut replies = self.received_replies.lock().unwrap();
        kept.extend(replies.drain(..));
        *replies = kept;
    }

    fn dispatch_event(&self) -> WaitableEvent {
        self.dispatch_event.clone()
    }
}

/// Thread-safe state of one sync channel, shared by the listener thread, the
/// I/O thread, filters and in-flight tasks; it outlives the [`SyncChannel`]
/// object until the last of those lets go.
pub(crate) struct SyncContext {
    weak_self: Weak<SyncContext>,
    listener: Mutex<Option<Arc<dyn Listener>>>,
    listener_runner: Arc<dyn TaskRunner>,
    io_runner: Arc<dyn TaskRunner>,
    channel: Mutex<Option<Channel>>,
    filters: Mutex<Vec<Arc<dyn MessageFilter>>>,
    /// LIFO stack of in-flight sync sends; top is the most recent.
    deserializers: Mutex<Vec<PendingSyncMsg>>,
    received_sync_msgs: Arc<ReceivedSyncMsgQueue>,
    shutdown_event: WaitableEvent,
    /// I/O-thread watcher on `shutdown_event`.
    shutdown_watcher: Mutex<WaitableEventWatcher>,
    restrict_dispatch_group: AtomicU32,
}

impl SyncContext {
    fn new(
        listener: Arc<dyn Listener>,
        listener_runner: Arc<dyn TaskRunner>,
        io_runner: Arc<dyn TaskRunner>,
        shutdown_event: WaitableEvent,
    ) -> Arc<SyncContext> {
        Arc::new_cyclic(|weak_self| SyncContext {
            weak_self: weak_self.clone(),
            listener: Mutex::new(Some(listener)),
            listener_runner,
            io_runner,
            channel: Mutex::new(None),
            filters: Mutex::new(Vec::new()),
            deserializers: Mutex::new(Vec::new()),
            received_sync_msgs: ReceivedSyncMsgQueue::add_context(),
            shutdown_event,
            shutdown_watcher: Mutex::new(WaitableEventWatcher::new()),
            restrict_dispatch_group: AtomicU32::new(RESTRICT_DISPATCH_GROUP_NONE),
        })
    }

    /// The shared handle to this context; it is always reachable while any
    /// caller can invoke us.
    fn arc(&self) -> Arc<SyncContext> {
        self.weak_self.upgrade().expect("context already destroyed")
    }

    fn restrict_dispatch_group(&self) -> u32 {
        self.restrict_dispatch_group.load(Ordering::Relaxed)
    }

    fn set_restrict_dispatch_group(&self, group: u32) {
        self.restrict_dispatch_group.store(group, Ordering::Relaxed);
    }

    /// Records an outgoing sync send *before* the message reaches the wire,
    /// so that an instant reply always finds its waiter enrolled.
    fn push(&self, message: &mut Message) {
        // Manual reset: between the reply signaling this event and the
        // suspended watch re-arming on it, a nested send can come and go; an
        // auto-reset would let the wrong wait consume the signal.
        let pending = PendingSyncMsg {
            id: SyncMessage::message_id(message),
            deserializer: message.take_deserializer(),
            done_event: WaitableEvent::new(true, false),
            send_result: false,
        };
        self.deserializers.lock().unwrap().push(pending);
    }

    /// Pops the completed send and reports its result. Kicks reply retry on
    /// the I/O thread: a reply for the send below us may have been parked
    /// while we were on top.
    fn pop(&self) -> bool {
        let result = {
            let mut deserializers = self.deserializers.lock().unwrap();
            let pending = deserializers.pop().expect("pop without a pending sync send");
            pending.send_result
        };

        let queue = self.received_sync_msgs.clone();
        self.io_runner
            .post_task(Closure::new(move || queue.dispatch_replies()));

        result
    }

    fn send_done_event(&self) -> WaitableEvent {
        self.deserializers
            .lock()
            .unwrap()
            .last()
            .expect("no sync send in flight")
            .done_event
            .clone()
    }

    fn dispatch_event(&self) -> WaitableEvent {
        self.received_sync_msgs.dispatch_event()
    }

    fn dispatch_messages(&self) {
        self.received_sync_msgs.dispatch_messages(&self.arc());
    }

    /// Matches `message` against the top of the send stack; on a match the
    /// reply is deserialized and the blocked send released. Called on the
    /// I/O thread.
    fn try_to_unblock_listener(&self, message: &Message) -> bool {
        let (id, deserializer, done_event) = {
            let mut deserializers = self.deserializers.lock().unwrap();
            let Some(top) = deserializers.last_mut() else {
                return false;
            };
            if !SyncMessage::is_reply_to(message, top.id) {
                return false;
            }
            (top.id, top.deserializer.take(), top.done_event.clone())
        };

        // The deserializer is embedder code; run it without holding our
        // lock.
        let send_result = if message.is_reply_error() {
            debug!("received error reply for {}", id);
            false
        } else {
            let result = deserializer
                .map_or(false, |mut d| d.deserialize_reply(SyncMessage::data(message)));
            if !result {
                debug!("couldn't deserialize reply for {}", id);
            }
            result
        };

        {
            let mut deserializers = self.deserializers.lock().unwrap();
            if let Some(top) = deserializers.last_mut() {
                // Unless the send was cancelled out from under us while the
                // deserializer ran, it is still on top.
                if top.id == id {
                    top.send_result = send_result;
                }
            }
        }
        done_event.signal();
        true
    }

    /// Unblocks every in-flight send with a failed result.
    fn cancel_pending_sends(&self) {
        let done_events: Vec<WaitableEvent> = {
            let deserializers = self.deserializers.lock().unwrap();
            deserializers.iter().map(|p| p.done_event.clone()).collect()
        };
        if !done_events.is_empty() {
            debug!("canceling {} pending sync sends", done_events.len());
        }
        for done_event in done_events {
            done_event.signal();
        }
    }

    /// Expires one send by request id; posted to the I/O thread with a delay
    /// by `send_with_timeout`.
    fn on_send_timeout(&self, id: i32) {
        let done_event = {
            let deserializers = self.deserializers.lock().unwrap();
            deserializers
                .iter()
                .find(|p| p.id == id)
                .map(|p| p.done_event.clone())
        };
        if let Some(done_event) = done_event {
            debug!("sync send {} timed out", id);
            done_event.signal();
        }
    }

    /// Hands `message` to the I/O thread for the wire.
    fn proxy_send(&self, message: Message) -> bool {
        let context = self.arc();
        self.io_runner
            .post_task(Closure::new(move || context.send_on_io(message)))
    }

    fn send_on_io(&self, message: Message) {
        let channel = self.channel.lock().unwrap().clone();
        match channel {
            Some(channel) => {
                if !channel.send(message) {
                    debug!("dropping message: channel closed");
                }
            }
            None => debug!("dropping message: no channel"),
        }
    }

    fn create_channel_on_this_thread(&self, handle: &ChannelHandle, mode: Mode) -> io::Result<()> {
        let channel = Channel::create(
            handle,
            mode,
            self.weak_self.clone() as Weak<dyn ChannelDelegate>,
            self.io_runner.clone(),
        )?;
        *self.channel.lock().unwrap() = Some(channel);
        Ok(())
    }

    /// Arms the shutdown watch. Must run on the I/O thread, which is where
    /// the cancellation callback has to land.
    fn on_channel_opened(&self) {
        let callback = self.event_callback();
        self.shutdown_watcher
            .lock()
            .unwrap()
            .start_watching(&self.shutdown_event, callback);
    }

    fn try_filters(&self, message: &Message) -> bool {
        let filters = self.filters.lock().unwrap().clone();
        filters.iter().any(|filter| filter.on_message_received(message))
    }

    fn add_filter(&self, filter: Arc<dyn MessageFilter>) {
        self.filters.lock().unwrap().push(filter.clone());
        let context = self.arc();
        self.io_runner.post_task(Closure::new(move || {
            let channel = context.channel.lock().unwrap().clone();
            if let Some(channel) = channel {
                filter.on_filter_added(&channel);
            }
        }));
    }

    /// Delivers a parked or asynchronous message to the listener (listener
    /// thread).
    fn on_dispatch_message(&self, message: &Message) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_message_received(message);
        }
    }

    /// Shared callback for the shutdown watch and the send-done watches.
    fn event_callback(&self) -> EventCallback {
        let weak = self.weak_self.clone();
        Arc::new(move |event: &WaitableEvent| {
            if let Some(context) = weak.upgrade() {
                context.on_event_signaled(event);
            }
        })
    }

    fn on_event_signaled(&self, event: &WaitableEvent) {
        if *event == self.shutdown_event {
            // The process is shutting down before a reply arrived; release
            // every blocked send.
            self.cancel_pending_sends();
        } else {
            // The reply (or its cancellation) for the innermost send landed
            // while a nested run loop was pumping: unwind it.
            if let Some(current) = MessageLoop::current() {
                current.quit_now();
            }
        }
    }

    /// Tears the channel down; listener-thread half of SyncChannel::drop.
    fn shutdown(&self) {
        self.cancel_pending_sends();
        ReceivedSyncMsgQueue::remove_context(&self.received_sync_msgs, &self.arc());
        *self.listener.lock().unwrap() = None;

        let context = self.arc();
        self.io_runner.post_task(Closure::new(move || {
            let filters = context.filters.lock().unwrap().clone();
            for filter in &filters {
                filter.on_channel_closing();
            }
            context.shutdown_watcher.lock().unwrap().stop_watching();
            let channel = context.channel.lock().unwrap().take();
            if let Some(channel) = channel {
                channel.close();
            }
        }));
    }
}

impl ChannelDelegate for SyncContext {
    /// Every inbound message lands here first, on the I/O thread.
    fn on_message_received(&self, message: Message) {
        if self.try_filters(&message) {
            return;
        }
        if self.try_to_unblock_listener(&message) {
            return;
        }

        let this = self
            .weak_self
            .upgrade()
            .expect("delegate callback on a dropped context");

        if message.is_reply() {
            self.received_sync_msgs.queue_reply(message, this);
            return;
        }

        if message.should_unblock() {
            ReceivedSyncMsgQueue::queue_message(&self.received_sync_msgs, message, this);
            return;
        }

        // Ordinary asynchronous delivery.
        self.listener_runner
            .post_task(Closure::new(move || this.on_dispatch_message(&message)));
    }

    fn on_channel_connected(&self, peer_id: i32) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            self.listener_runner
                .post_task(Closure::new(move || listener.on_channel_connected(peer_id)));
        }
    }

    fn on_channel_error(&self) {
        self.cancel_pending_sends();
        self.shutdown_watcher.lock().unwrap().stop_watching();

        let filters = self.filters.lock().unwrap().clone();
        for filter in &filters {
            filter.on_channel_error();
        }

        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            self.listener_runner
                .post_task(Closure::new(move || listener.on_channel_error()));
        }
    }
}

/// Sends a message, blocking for the reply when it is synchronous.
fn send_internal(context: &Arc<SyncContext>, mut message: Message, timeout: Option<Duration>) -> bool {
    if !message.is_sync() {
        return context.proxy_send(message);
    }

    debug_assert!(
        context.listener_runner.runs_tasks_on_current_thread(),
        "sync sends must happen on the listener thread"
    );

    if context.shutdown_event.is_signaled() {
        debug!("dropping sync send: shutdown already signaled");
        return false;
    }

    let pump_messages = message.should_pump_messages();
    let id = SyncMessage::message_id(&message);
    trace!("sync send {} (pump_messages: {})", id, pump_messages);

    // Enroll before the message can reach the wire: an instant reply must
    // find the waiter.
    context.push(&mut message);

    if let Some(timeout) = timeout {
        let for_timeout = context.clone();
        context.io_runner.post_delayed_task(
            Closure::new(move || for_timeout.on_send_timeout(id)),
            timeout,
        );
    }

    context.proxy_send(message);
    wait_for_reply(context, pump_messages);
    context.pop()
}

fn wait_for_reply(context: &Arc<SyncContext>, pump_messages: bool) {
    context.dispatch_messages();
    loop {
        let dispatch_event = context.dispatch_event();
        let send_done_event = context.send_done_event();

        let index = if pump_messages {
            event::wait_many(&[
                &dispatch_event,
                &send_done_event,
                sync_message::pump_messages_event(),
            ])
        } else {
            event::wait_many(&[&dispatch_event, &send_done_event])
        };

        match index {
            0 => {
                // A blocking synchronous call came in while we wait for the
                // reply; it may be blocking that reply, so dispatch it.
                dispatch_event.reset();
                context.dispatch_messages();
            }
            2 => {
                wait_for_reply_with_nested_loop(context);
                break;
            }
            _ => break,
        }
    }
}

/// The pump-messages variant of the wait: run a nested loop (with nestable
/// tasks allowed) until the send-done watch quits it.
fn wait_for_reply_with_nested_loop(context: &Arc<SyncContext>) {
    let send_done_watcher = Rc::new(RefCell::new(WaitableEventWatcher::new()));

    // Per-thread stack of send-done watches, so nested sends unwind in call
    // order: suspend the outer frame's watch, run ours, re-arm the outer on
    // the way out. The outer's done event is manual reset, so a signal that
    // arrived while its watch was suspended is seen on re-arm.
    let previous =
        TOP_SEND_DONE_WATCHER.with(|top| top.replace(Some(send_done_watcher.clone())));
    let mut suspended = None;
    if let Some(previous) = &previous {
        let mut watcher = previous.borrow_mut();
        suspended = watcher.watched_event().zip(watcher.callback());
        watcher.stop_watching();
    }

    send_done_watcher
        .borrow_mut()
        .start_watching(&context.send_done_event(), context.event_callback());

    let mut nested = RunLoop::new_allowing_nestable_tasks();
    nested.run();

    TOP_SEND_DONE_WATCHER.with(|top| *top.borrow_mut() = previous.clone());
    if let (Some(previous), Some((event, callback))) = (previous, suspended) {
        previous.borrow_mut().start_watching(&event, callback);
    }
}

/// A channel that supports synchronous request/reply sends. See the
/// [module docs](self).
///
/// The `SyncChannel` object lives on the listener thread (it is not `Send`);
/// the shared context it fronts is reference-counted and survives on the I/O
/// thread until in-flight work drains.
pub struct SyncChannel {
    context: Arc<SyncContext>,
    /// Always-on watch of the dispatch event, so parked sync messages are
    /// drained even when no send is blocked and no drain task got through.
    dispatch_watcher: Arc<Mutex<WaitableEventWatcher>>,
    _not_send: PhantomData<*const ()>,
}

impl SyncChannel {
    /// Creates a sync channel.
    ///
    /// `listener` receives messages on the calling (listener) thread;
    /// `io_runner` must belong to a different thread's loop, which will do
    /// the transport work. With `create_pipe_now` the endpoint is created
    /// synchronously on this thread, otherwise on the I/O thread.
    /// `shutdown_event` is an embedder-owned manual-reset event; signaling
    /// it aborts every blocked send.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread has no bound loop, or if `io_runner`
    /// runs on the calling thread.
    pub fn create(
        handle: &ChannelHandle,
        mode: Mode,
        listener: Arc<dyn Listener>,
        io_runner: Arc<dyn TaskRunner>,
        create_pipe_now: bool,
        shutdown_event: WaitableEvent,
    ) -> io::Result<SyncChannel> {
        let listener_runner =
            runner::current().expect("SyncChannel requires a message loop on the listener thread");
        assert!(
            !io_runner.runs_tasks_on_current_thread(),
            "the listener thread and the I/O thread must be distinct"
        );

        let context = SyncContext::new(listener, listener_runner, io_runner, shutdown_event);

        if create_pipe_now {
            if let Err(e) = context.create_channel_on_this_thread(handle, mode) {
                ReceivedSyncMsgQueue::remove_context(&context.received_sync_msgs, &context);
                return Err(e);
            }
            let opened = context.clone();
            context
                .io_runner
                .post_task(Closure::new(move || opened.on_channel_opened()));
        } else {
            let deferred = context.clone();
            let handle = handle.clone();
            context.io_runner.post_task(Closure::new(move || {
                match deferred.create_channel_on_this_thread(&handle, mode) {
                    Ok(()) => deferred.on_channel_opened(),
                    Err(e) => {
                        error!("channel '{}' creation failed: {}", handle.name(), e);
                        deferred.on_channel_error();
                    }
                }
            }));
        }

        // Watch the dispatch event for the life of the channel. We cannot
        // know when blocked sends stop covering it, so it is covered always;
        // the callback re-arms the watch before dispatching, because
        // dispatch may drop this very channel.
        let dispatch_watcher = Arc::new(Mutex::new(WaitableEventWatcher::new()));
        let callback =
            Self::dispatch_callback(Arc::downgrade(&context), Arc::downgrade(&dispatch_watcher));
        dispatch_watcher
            .lock()
            .unwrap()
            .start_watching(&context.dispatch_event(), callback);

        Ok(SyncChannel {
            context,
            dispatch_watcher,
            _not_send: PhantomData,
        })
    }

    fn dispatch_callback(
        context: Weak<SyncContext>,
        watcher: Weak<Mutex<WaitableEventWatcher>>,
    ) -> EventCallback {
        Arc::new(move |event: &WaitableEvent| {
            let Some(context) = context.upgrade() else {
                return;
            };
            event.reset();
            if let Some(watcher) = watcher.upgrade() {
                let mut guard = watcher.lock().unwrap();
                if let Some(callback) = guard.callback() {
                    let event = event.clone();
                    guard.start_watching(&event, callback);
                }
            }
            context.dispatch_messages();
        })
    }

    /// Sends `message`. An asynchronous message is posted to the I/O thread
    /// and `true` means it was queued. A [`SyncMessage`] blocks until its
    /// reply arrives and was deserialized successfully (`true`), or the send
    /// was aborted by a channel error, the shutdown event, or a rejected
    /// reply (`false`). While blocked, inbound sync messages in this
    /// channel's dispatch group keep being dispatched.
    pub fn send(&self, message: impl Into<Message>) -> bool {
        send_internal(&self.context, message.into(), None)
    }

    /// Like [`send`], but a blocked sync send additionally fails after
    /// `timeout`.
    ///
    /// [`send`]: SyncChannel::send
    pub fn send_with_timeout(&self, message: impl Into<Message>, timeout: Duration) -> bool {
        send_internal(&self.context, message.into(), Some(timeout))
    }

    /// Restricts which inbound sync messages may be dispatched while this
    /// channel blocks in `send`: only those from channels in the same group
    /// (group 0 is unrestricted). All channels of one subsystem should share
    /// a group.
    pub fn set_restrict_dispatch_channel_group(&self, group: u32) {
        self.context.set_restrict_dispatch_group(group);
    }

    /// Creates and attaches a filter that can send sync messages from
    /// threads other than the listener thread.
    pub fn create_sync_message_filter(&self) -> Arc<crate::ipc::SyncMessageFilter> {
        let filter = crate::ipc::SyncMessageFilter::new(self.context.shutdown_event.clone());
        self.context
            .add_filter(filter.clone() as Arc<dyn MessageFilter>);
        filter
    }

    /// A clonable, thread-safe sending handle. Useful for listeners that
    /// reply from within their callbacks. Synchronous sends through it still
    /// must happen on the listener thread.
    pub fn sender(&self) -> MessageSender {
        MessageSender {
            context: self.context.clone(),
        }
    }

    /// The id the peer knows this endpoint by, once connected.
    pub fn endpoint_id(&self) -> Option<i32> {
        self.context
            .channel
            .lock()
            .unwrap()
            .as_ref()
            .map(Channel::endpoint_id)
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        self.dispatch_watcher.lock().unwrap().stop_watching();
        self.context.shutdown();
    }
}

impl fmt::Debug for SyncChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncChannel").finish_non_exhaustive()
    }
}

/// A clonable sending handle detached from the [`SyncChannel`] object.
#[derive(Clone)]
pub struct MessageSender {
    context: Arc<SyncContext>,
}

impl MessageSender {
    /// Same contract as [`SyncChannel::send`].
    pub fn send(&self, message: impl Into<Message>) -> bool {
        send_internal(&self.context, message.into(), None)
    }
}

impl fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSender").finish_non_exhaustive()
    }
}
