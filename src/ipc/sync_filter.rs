//! Synchronous sends from threads that do not own the channel.
//!
//! A [`SyncMessageFilter`] is attached to a [`SyncChannel`] and may be
//! handed to any thread *except* the channel's listener thread (which should
//! send through the channel and keep its nested dispatch) and the I/O thread
//! (which would block itself). A sync send through the filter is a plain
//! blocking wait: no dispatch happens on the sending thread, and the wait is
//! released by the reply, a channel error, or the shutdown event.
//!
//! Messages sent before the filter is attached to a live channel are queued
//! and flushed on attach.
//!
//! [`SyncChannel`]: crate::ipc::SyncChannel

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::event::{self, WaitableEvent};
use crate::ipc::channel::Channel;
use crate::ipc::message::Message;
use crate::ipc::sync_channel::MessageFilter;
use crate::ipc::sync_message::{ReplyDeserializer, SyncMessage};
use crate::runner;
use crate::task::Closure;
use crate::TaskRunner;

/// One sync send blocked inside [`SyncMessageFilter::send`]. Unlike the
/// channel's LIFO stack, filter sends from different threads are concurrent,
/// so they form an unordered set matched by request id.
struct FilterPendingSyncMsg {
    id: i32,
    deserializer: Mutex<Option<Box<dyn ReplyDeserializer>>>,
    done_event: WaitableEvent,
    send_result: AtomicBool,
}

struct IoState {
    sender: Option<Channel>,
    io_runner: Option<Arc<dyn TaskRunner>>,
    /// Sends that arrived before the filter was attached.
    pending_messages: Vec<Message>,
}

/// Sends messages (including synchronous ones) to a sync channel from
/// arbitrary threads. Created by
/// [`SyncChannel::create_sync_message_filter`].
///
/// [`SyncChannel::create_sync_message_filter`]: crate::ipc::SyncChannel::create_sync_message_filter
pub struct SyncMessageFilter {
    weak_self: std::sync::Weak<SyncMessageFilter>,
    shutdown_event: WaitableEvent,
    io_state: Mutex<IoState>,
    pending_sync_messages: Mutex<Vec<Arc<FilterPendingSyncMsg>>>,
}

impl SyncMessageFilter {
    pub(crate) fn new(shutdown_event: WaitableEvent) -> Arc<SyncMessageFilter> {
        Arc::new_cyclic(|weak_self| SyncMessageFilter {
            weak_self: weak_self.clone(),
            shutdown_event,
            io_state: Mutex::new(IoState {
                sender: None,
                io_runner: None,
                pending_messages: Vec::new(),
            }),
            pending_sync_messages: Mutex::new(Vec::new()),
        })
    }

    /// Sends `message`; blocks for the reply when it is synchronous. Returns
    /// false when the send was aborted by a channel error or shutdown, or
    /// the reply was rejected.
    pub fn send(&self, message: impl Into<Message>) -> bool {
        let mut message = message.into();
        if !message.is_sync() {
            self.route(message);
            return true;
        }

        // Blocking on the I/O thread would deadlock outright. (Blocking on
        // the listener thread merely forfeits nested dispatch; send through
        // the channel there instead.)
        if let Some(io_runner) = self.io_state.lock().unwrap().io_runner.clone() {
            debug_assert!(
                !io_runner.runs_tasks_on_current_thread(),
                "SyncMessageFilter::send cannot be used on the I/O thread"
            );
        }

        let pending = Arc::new(FilterPendingSyncMsg {
            id: SyncMessage::message_id(&message),
            deserializer: Mutex::new(message.take_deserializer()),
            done_event: WaitableEvent::new(true, false),
            send_result: AtomicBool::new(false),
        });
        self.pending_sync_messages.lock().unwrap().push(pending.clone());

        self.route(message);

        event::wait_many(&[&self.shutdown_event, &pending.done_event]);

        self.pending_sync_messages
            .lock()
            .unwrap()
            .retain(|p| !Arc::ptr_eq(p, &pending));

        pending.send_result.load(Ordering::Acquire)
    }

    /// Hands `message` towards the wire: directly when attached (the
    /// transport is thread-safe), queued otherwise.
    fn route(&self, message: Message) {
        let (sender, io_runner) = {
            let mut io_state = self.io_state.lock().unwrap();
            match (&io_state.sender, &io_state.io_runner) {
                (Some(sender), _) => (Some(sender.clone()), None),
                (None, Some(io_runner)) => (None, Some(io_runner.clone())),
                (None, None) => {
                    io_state.pending_messages.push(message);
                    return;
                }
            }
        };

        if let Some(sender) = sender {
            sender.send(message);
        } else if let Some(io_runner) = io_runner {
            let filter = self.weak_self.upgrade().expect("filter already destroyed");
            io_runner.post_task(Closure::new(move || filter.send_on_io_thread(message)));
        }
    }

    fn send_on_io_thread(&self, message: Message) {
        let sender = self.io_state.lock().unwrap().sender.clone();
        if let Some(sender) = sender {
            sender.send(message);
            return;
        }

        debug!("filter send with no channel");
        if message.is_sync() {
            // We don't know which thread posted it, and it will never get a
            // reply; unblock everybody rather than leave one hung.
            self.signal_all_events();
        }
    }

    /// Releases every blocked filter send; their results stay false.
    fn signal_all_events(&self) {
        let pending = self.pending_sync_messages.lock().unwrap().clone();
        for entry in pending {
            entry.done_event.signal();
        }
    }
}

impl MessageFilter for SyncMessageFilter {
    fn on_filter_added(&self, sender: &Channel) {
        let pending = {
            let mut io_state = self.io_state.lock().unwrap();
            io_state.sender = Some(sender.clone());
            io_state.io_runner = runner::current();
            std::mem::take(&mut io_state.pending_messages)
        };
        for message in pending {
            self.send_on_io_thread(message);
        }
    }

    fn on_channel_error(&self) {
        self.io_state.lock().unwrap().sender = None;
        self.signal_all_events();
    }

    fn on_channel_closing(&self) {
        self.io_state.lock().unwrap().sender = None;
        self.signal_all_events();
    }

    /// Matches replies to blocked filter sends, on the I/O thread.
    fn on_message_received(&self, message: &Message) -> bool {
        let matched = {
            let pending = self.pending_sync_messages.lock().unwrap();
            pending
                .iter()
                .find(|p| SyncMessage::is_reply_to(message, p.id))
                .cloned()
        };
        let Some(entry) = matched else {
            return false;
        };

        if !message.is_reply_error() {
            let deserializer = entry.deserializer.lock().unwrap().take();
            let result = deserializer
                .map_or(false, |mut d| d.deserialize_reply(SyncMessage::data(message)));
            entry.send_result.store(result, Ordering::Release);
        }
        entry.done_event.signal();
        true
    }
}
