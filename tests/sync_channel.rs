use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use looper::ipc::{
    ChannelHandle, Listener, Message, MessageSender, Mode, SyncChannel, SyncMessage,
};
use looper::{
    Closure, LoopType, MessageLoop, RunLoop, TaskRunner, Thread, WaitableEvent,
};

mod util;

use util::{init, run_on, GENEROUS};

thread_local! {
    /// Channels hosted on helper threads; SyncChannel must live and die on
    /// its listener thread.
    static HELD_CHANNELS: RefCell<HashMap<&'static str, SyncChannel>> =
        RefCell::new(HashMap::new());
}

fn hold_channel(key: &'static str, channel: SyncChannel) {
    HELD_CHANNELS.with(|held| held.borrow_mut().insert(key, channel));
}

fn drop_held_channels(runner: &Arc<dyn TaskRunner>) {
    run_on(runner, || {
        HELD_CHANNELS.with(|held| held.borrow_mut().clear());
    });
}

/// Replies to every sync request with its own payload, after an optional
/// delay. Records nothing for async messages.
struct EchoListener {
    sender: Mutex<Option<MessageSender>>,
    delay: Duration,
}

impl EchoListener {
    fn with_delay(delay: Duration) -> Arc<EchoListener> {
        Arc::new(EchoListener {
            sender: Mutex::new(None),
            delay,
        })
    }
}

impl Listener for EchoListener {
    fn on_message_received(&self, message: &Message) -> bool {
        if message.is_sync() {
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            let mut reply = SyncMessage::generate_reply(message);
            let payload = SyncMessage::data(message).to_vec();
            reply.write_bytes(&payload);
            if let Some(sender) = &*self.sender.lock().unwrap() {
                sender.send(reply);
            }
        }
        true
    }
}

/// Swallows sync requests (never replies), but keeps a ready-to-send reply
/// for each so a test can deliver it late.
struct SwallowListener {
    held_reply: Mutex<Option<Message>>,
    sender: Mutex<Option<MessageSender>>,
}

impl SwallowListener {
    fn new() -> Arc<SwallowListener> {
        Arc::new(SwallowListener {
            held_reply: Mutex::new(None),
            sender: Mutex::new(None),
        })
    }
}

impl Listener for SwallowListener {
    fn on_message_received(&self, message: &Message) -> bool {
        if message.is_sync() {
            let mut reply = SyncMessage::generate_reply(message);
            reply.write_bytes(SyncMessage::data(message));
            *self.held_reply.lock().unwrap() = Some(reply);
        }
        true
    }
}

struct NullListener;

impl Listener for NullListener {
    fn on_message_received(&self, _message: &Message) -> bool {
        true
    }
}

/// Spins the current thread's loop until `event` signals.
fn run_until_event(event: &WaitableEvent) {
    let deadline = Instant::now() + GENEROUS;
    loop {
        if event.timed_wait(Duration::from_millis(25)) {
            return;
        }
        assert!(Instant::now() < deadline, "event never signaled");
        RunLoop::new().run_until_idle();
    }
}

fn echo_request(payload: &[u8], reply_slot: &Arc<Mutex<Vec<u8>>>) -> SyncMessage {
    let slot = reply_slot.clone();
    let mut message = SyncMessage::new(
        1,
        100,
        Box::new(move |payload: &[u8]| {
            *slot.lock().unwrap() = payload.to_vec();
            true
        }),
    );
    message.write_bytes(payload);
    message
}

/// Hosts an echo server channel on `thread`.
fn host_echo_server(
    thread: &Thread,
    key: &'static str,
    handle: &ChannelHandle,
    io_runner: &Arc<dyn TaskRunner>,
    shutdown: &WaitableEvent,
    delay: Duration,
) {
    let io_runner = io_runner.clone();
    let shutdown = shutdown.clone();
    let handle = handle.clone();
    run_on(&thread.task_runner().unwrap(), move || {
        let listener = EchoListener::with_delay(delay);
        let channel = SyncChannel::create(
            &handle,
            Mode::Server,
            listener.clone(),
            io_runner,
            true,
            shutdown,
        )
        .unwrap();
        *listener.sender.lock().unwrap() = Some(channel.sender());
        hold_channel(key, channel);
    });
}

#[test]
fn sync_send_blocks_for_the_reply() {
    init();

    let _main_loop = MessageLoop::new(LoopType::Default);
    let mut io = Thread::new("io");
    io.start().unwrap();
    let io_runner = io.task_runner().unwrap();
    let mut server = Thread::new("server");
    server.start().unwrap();

    let shutdown = WaitableEvent::new(true, false);
    let handle = ChannelHandle::new("simple-sync");
    host_echo_server(&server, "server", &handle, &io_runner, &shutdown, Duration::ZERO);

    let client = SyncChannel::create(
        &handle,
        Mode::Client,
        Arc::new(NullListener),
        io_runner.clone(),
        true,
        shutdown.clone(),
    )
    .unwrap();

    let reply = Arc::new(Mutex::new(Vec::new()));
    assert!(client.send(echo_request(b"hello", &reply)));
    assert_eq!(&*reply.lock().unwrap(), b"hello");

    // A second send reuses all the machinery.
    assert!(client.send(echo_request(b"again", &reply)));
    assert_eq!(&*reply.lock().unwrap(), b"again");

    drop(client);
    drop_held_channels(&server.task_runner().unwrap());
    server.stop();
    io.stop();
}

#[test]
fn async_messages_deliver_without_blocking() {
    init();

    let _main_loop = MessageLoop::new(LoopType::Default);
    let mut io = Thread::new("io");
    io.start().unwrap();
    let io_runner = io.task_runner().unwrap();
    let mut server = Thread::new("server");
    server.start().unwrap();

    struct RecordingListener {
        payload: Mutex<Vec<u8>>,
        received: WaitableEvent,
    }
    impl Listener for RecordingListener {
        fn on_message_received(&self, message: &Message) -> bool {
            *self.payload.lock().unwrap() = message.payload().to_vec();
            self.received.signal();
            true
        }
    }

    let received = WaitableEvent::new(false, false);
    let listener = Arc::new(RecordingListener {
        payload: Mutex::new(Vec::new()),
        received: received.clone(),
    });

    let shutdown = WaitableEvent::new(true, false);
    let handle = ChannelHandle::new("async-msg");
    {
        let io_runner = io_runner.clone();
        let shutdown = shutdown.clone();
        let handle = handle.clone();
        let listener = listener.clone();
        run_on(&server.task_runner().unwrap(), move || {
            let channel = SyncChannel::create(
                &handle,
                Mode::Server,
                listener,
                io_runner,
                true,
                shutdown,
            )
            .unwrap();
            hold_channel("server", channel);
        });
    }

    let client = SyncChannel::create(
        &handle,
        Mode::Client,
        Arc::new(NullListener),
        io_runner.clone(),
        true,
        shutdown.clone(),
    )
    .unwrap();

    let mut message = Message::new(7, 200);
    message.write_bytes(b"fire and forget");
    assert!(client.send(message));

    assert!(received.timed_wait(GENEROUS));
    assert_eq!(&*listener.payload.lock().unwrap(), b"fire and forget");

    drop(client);
    drop_held_channels(&server.task_runner().unwrap());
    server.stop();
    io.stop();
}

/// The server-side listener for the nested-send test: a sync request on
/// channel A triggers a *sync* send back to the peer on channel B before A's
/// reply goes out.
struct CallbackListener {
    a_sender: Mutex<Option<MessageSender>>,
    b_sender: Mutex<Option<MessageSender>>,
    b_send_ok: Arc<AtomicBool>,
}

impl Listener for CallbackListener {
    fn on_message_received(&self, message: &Message) -> bool {
        if !message.is_sync() {
            return true;
        }

        // Call back into the peer while it is blocked on us.
        let reply_payload = Arc::new(Mutex::new(Vec::new()));
        let request = echo_request(b"callback", &reply_payload);
        let ok = self
            .b_sender
            .lock()
            .unwrap()
            .as_ref()
            .expect("B not wired up")
            .send(request);
        self.b_send_ok.store(
            ok && &*reply_payload.lock().unwrap() == b"callback",
            Ordering::SeqCst,
        );

        // Only then answer the original request.
        let mut reply = SyncMessage::generate_reply(message);
        reply.write_bytes(SyncMessage::data(message));
        self.a_sender
            .lock()
            .unwrap()
            .as_ref()
            .expect("A not wired up")
            .send(reply);
        true
    }
}

#[test]
fn nested_sync_call_completes_before_the_outer_send_returns() {
    init();

    let _main_loop = MessageLoop::new(LoopType::Default);
    let mut io = Thread::new("io");
    io.start().unwrap();
    let io_runner = io.task_runner().unwrap();
    let mut remote = Thread::new("remote");
    remote.start().unwrap();

    let shutdown = WaitableEvent::new(true, false);
    let handle_a = ChannelHandle::new("nested-a");
    let handle_b = ChannelHandle::new("nested-b");
    const GROUP: u32 = 1;

    let b_send_ok = Arc::new(AtomicBool::new(false));

    // Remote side: A's listener calls back over B, then replies.
    {
        let io_runner = io_runner.clone();
        let shutdown = shutdown.clone();
        let handle_a = handle_a.clone();
        let handle_b = handle_b.clone();
        let b_send_ok = b_send_ok.clone();
        run_on(&remote.task_runner().unwrap(), move || {
            let listener = Arc::new(CallbackListener {
                a_sender: Mutex::new(None),
                b_sender: Mutex::new(None),
                b_send_ok,
            });
            let a = SyncChannel::create(
                &handle_a,
                Mode::Server,
                listener.clone(),
                io_runner.clone(),
                true,
                shutdown.clone(),
            )
            .unwrap();
            let b = SyncChannel::create(
                &handle_b,
                Mode::Server,
                Arc::new(NullListener),
                io_runner,
                true,
                shutdown,
            )
            .unwrap();
            *listener.a_sender.lock().unwrap() = Some(a.sender());
            *listener.b_sender.lock().unwrap() = Some(b.sender());
            hold_channel("a", a);
            hold_channel("b", b);
        });
    }

    // Local side: B's listener echoes and records the dispatch order.
    let order = Arc::new(Mutex::new(Vec::new()));

    struct OrderedEchoListener {
        sender: Mutex<Option<MessageSender>>,
        order: Arc<Mutex<Vec<&'static str>>>,
    }
    impl Listener for OrderedEchoListener {
        fn on_message_received(&self, message: &Message) -> bool {
            if message.is_sync() {
                self.order.lock().unwrap().push("B.req2 dispatched");
                let mut reply = SyncMessage::generate_reply(message);
                reply.write_bytes(SyncMessage::data(message));
                if let Some(sender) = &*self.sender.lock().unwrap() {
                    sender.send(reply);
                }
            }
            true
        }
    }

    let b_listener = Arc::new(OrderedEchoListener {
        sender: Mutex::new(None),
        order: order.clone(),
    });
    let a = SyncChannel::create(
        &handle_a,
        Mode::Client,
        Arc::new(NullListener),
        io_runner.clone(),
        true,
        shutdown.clone(),
    )
    .unwrap();
    let b = SyncChannel::create(
        &handle_b,
        Mode::Client,
        b_listener.clone(),
        io_runner.clone(),
        true,
        shutdown.clone(),
    )
    .unwrap();
    *b_listener.sender.lock().unwrap() = Some(b.sender());

    // Both local channels share a dispatch group, so B's inbound request may
    // be dispatched while A blocks.
    a.set_restrict_dispatch_channel_group(GROUP);
    b.set_restrict_dispatch_channel_group(GROUP);

    let reply = Arc::new(Mutex::new(Vec::new()));
    assert!(a.send(echo_request(b"outer", &reply)));
    order.lock().unwrap().push("A.req1 returned");

    assert_eq!(&*reply.lock().unwrap(), b"outer");
    assert!(b_send_ok.load(Ordering::SeqCst));
    assert_eq!(
        *order.lock().unwrap(),
        ["B.req2 dispatched", "A.req1 returned"]
    );

    drop(a);
    drop(b);
    drop_held_channels(&remote.task_runner().unwrap());
    remote.stop();
    io.stop();
}

#[test]
fn messages_from_another_group_stay_parked_while_blocked() {
    init();

    let _main_loop = MessageLoop::new(LoopType::Default);
    let mut io = Thread::new("io");
    io.start().unwrap();
    let io_runner = io.task_runner().unwrap();
    let mut remote_a = Thread::new("remote-a");
    remote_a.start().unwrap();
    let mut remote_c = Thread::new("remote-c");
    remote_c.start().unwrap();

    let shutdown = WaitableEvent::new(true, false);
    let handle_a = ChannelHandle::new("group-a");
    let handle_c = ChannelHandle::new("group-c");

    host_echo_server(&remote_a, "a", &handle_a, &io_runner, &shutdown, Duration::from_millis(100));

    // Local side: A in group 1, C in group 2.
    let c_dispatched = Arc::new(AtomicBool::new(false));

    struct FlaggingEchoListener {
        sender: Mutex<Option<MessageSender>>,
        flag: Arc<AtomicBool>,
    }
    impl Listener for FlaggingEchoListener {
        fn on_message_received(&self, message: &Message) -> bool {
            if message.is_sync() {
                self.flag.store(true, Ordering::SeqCst);
                let mut reply = SyncMessage::generate_reply(message);
                reply.write_bytes(SyncMessage::data(message));
                if let Some(sender) = &*self.sender.lock().unwrap() {
                    sender.send(reply);
                }
            }
            true
        }
    }

    let c_listener = Arc::new(FlaggingEchoListener {
        sender: Mutex::new(None),
        flag: c_dispatched.clone(),
    });
    let a = SyncChannel::create(
        &handle_a,
        Mode::Client,
        Arc::new(NullListener),
        io_runner.clone(),
        true,
        shutdown.clone(),
    )
    .unwrap();
    let c = SyncChannel::create(
        &handle_c,
        Mode::Server,
        c_listener.clone(),
        io_runner.clone(),
        true,
        shutdown.clone(),
    )
    .unwrap();
    *c_listener.sender.lock().unwrap() = Some(c.sender());
    a.set_restrict_dispatch_channel_group(1);
    c.set_restrict_dispatch_channel_group(2);

    // remote-c sends a sync request at us and blocks over there.
    let c_done = WaitableEvent::new(false, false);
    let c_result = Arc::new(AtomicBool::new(false));
    {
        let io_runner = io_runner.clone();
        let shutdown = shutdown.clone();
        let handle_c = handle_c.clone();
        let c_done = c_done.clone();
        let c_result = c_result.clone();
        remote_c
            .task_runner()
            .unwrap()
            .post_task(Closure::new(move || {
                let channel = SyncChannel::create(
                    &handle_c,
                    Mode::Client,
                    Arc::new(NullListener),
                    io_runner,
                    true,
                    shutdown,
                )
                .unwrap();
                let reply = Arc::new(Mutex::new(Vec::new()));
                let ok = channel.send(echo_request(b"cross", &reply));
                c_result.store(ok && &*reply.lock().unwrap() == b"cross", Ordering::SeqCst);
                hold_channel("c", channel);
                c_done.signal();
            }));
    }

    // Let C's request reach our parked queue before we block on A.
    std::thread::sleep(Duration::from_millis(100));

    let reply = Arc::new(Mutex::new(Vec::new()));
    assert!(a.send(echo_request(b"blocking", &reply)));

    // C's request was parked the whole time A was blocked: wrong group.
    assert!(!c_dispatched.load(Ordering::SeqCst));

    // Once we pump normally, C's request is dispatched and remote-c
    // unblocks.
    run_until_event(&c_done);
    assert!(c_dispatched.load(Ordering::SeqCst));
    assert!(c_result.load(Ordering::SeqCst));

    drop(a);
    drop(c);
    drop_held_channels(&remote_a.task_runner().unwrap());
    drop_held_channels(&remote_c.task_runner().unwrap());
    remote_a.stop();
    remote_c.stop();
    io.stop();
}

#[test]
fn shutdown_event_aborts_a_blocked_send() {
    init();

    let _main_loop = MessageLoop::new(LoopType::Default);
    let mut io = Thread::new("io");
    io.start().unwrap();
    let io_runner = io.task_runner().unwrap();
    let mut server = Thread::new("server");
    server.start().unwrap();

    let shutdown = WaitableEvent::new(true, false);
    let handle = ChannelHandle::new("shutdown-abort");

    let swallow = SwallowListener::new();
    {
        let io_runner = io_runner.clone();
        let shutdown = shutdown.clone();
        let handle = handle.clone();
        let swallow = swallow.clone();
        run_on(&server.task_runner().unwrap(), move || {
            let channel = SyncChannel::create(
                &handle,
                Mode::Server,
                swallow.clone(),
                io_runner,
                true,
                shutdown,
            )
            .unwrap();
            *swallow.sender.lock().unwrap() = Some(channel.sender());
            hold_channel("server", channel);
        });
    }

    let client = SyncChannel::create(
        &handle,
        Mode::Client,
        Arc::new(NullListener),
        io_runner.clone(),
        true,
        shutdown.clone(),
    )
    .unwrap();

    let signaler = shutdown.clone();
    let aborter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        signaler.signal();
    });

    let deserializer_ran = Arc::new(AtomicBool::new(false));
    let flag = deserializer_ran.clone();
    let request = SyncMessage::new(
        1,
        100,
        Box::new(move |_: &[u8]| {
            flag.store(true, Ordering::SeqCst);
            true
        }),
    );

    let started = Instant::now();
    assert!(!client.send(request));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(30));
    assert!(elapsed < GENEROUS);
    assert!(!deserializer_ran.load(Ordering::SeqCst));

    // A reply that limps in after the abort is discarded, not delivered.
    {
        let swallow = swallow.clone();
        run_on(&server.task_runner().unwrap(), move || {
            let reply = swallow
                .held_reply
                .lock()
                .unwrap()
                .take()
                .expect("request never arrived");
            swallow
                .sender
                .lock()
                .unwrap()
                .as_ref()
                .unwrap()
                .send(reply);
        });
    }
    std::thread::sleep(Duration::from_millis(100));
    RunLoop::new().run_until_idle();
    assert!(!deserializer_ran.load(Ordering::SeqCst));

    drop(client);
    drop_held_channels(&server.task_runner().unwrap());
    server.stop();
    io.stop();
}

#[test]
fn send_with_timeout_expires() {
    init();

    let _main_loop = MessageLoop::new(LoopType::Default);
    let mut io = Thread::new("io");
    io.start().unwrap();
    let io_runner = io.task_runner().unwrap();
    let mut server = Thread::new("server");
    server.start().unwrap();

    let shutdown = WaitableEvent::new(true, false);
    let handle = ChannelHandle::new("send-timeout");

    let swallow = SwallowListener::new();
    {
        let io_runner = io_runner.clone();
        let shutdown = shutdown.clone();
        let handle = handle.clone();
        let swallow = swallow.clone();
        run_on(&server.task_runner().unwrap(), move || {
            let channel = SyncChannel::create(
                &handle,
                Mode::Server,
                swallow,
                io_runner,
                true,
                shutdown,
            )
            .unwrap();
            hold_channel("server", channel);
        });
    }

    let client = SyncChannel::create(
        &handle,
        Mode::Client,
        Arc::new(NullListener),
        io_runner.clone(),
        true,
        shutdown.clone(),
    )
    .unwrap();

    let reply = Arc::new(Mutex::new(Vec::new()));
    let started = Instant::now();
    assert!(!client.send_with_timeout(echo_request(b"never", &reply), Duration::from_millis(50)));
    assert!(started.elapsed() >= Duration::from_millis(50));

    drop(client);
    drop_held_channels(&server.task_runner().unwrap());
    server.stop();
    io.stop();
}

#[test]
fn channel_error_aborts_a_blocked_send() {
    init();

    let _main_loop = MessageLoop::new(LoopType::Default);
    let mut io = Thread::new("io");
    io.start().unwrap();
    let io_runner = io.task_runner().unwrap();
    let mut server = Thread::new("server");
    server.start().unwrap();

    let shutdown = WaitableEvent::new(true, false);
    let handle = ChannelHandle::new("error-abort");

    // A listener that tears its own channel down on the first sync request.
    struct SelfDestructListener;
    impl Listener for SelfDestructListener {
        fn on_message_received(&self, message: &Message) -> bool {
            if message.is_sync() {
                looper::runner::current()
                    .unwrap()
                    .post_task(Closure::new(|| {
                        HELD_CHANNELS.with(|held| held.borrow_mut().clear());
                    }));
            }
            true
        }
    }

    {
        let io_runner = io_runner.clone();
        let shutdown = shutdown.clone();
        let handle = handle.clone();
        run_on(&server.task_runner().unwrap(), move || {
            let channel = SyncChannel::create(
                &handle,
                Mode::Server,
                Arc::new(SelfDestructListener),
                io_runner,
                true,
                shutdown,
            )
            .unwrap();
            hold_channel("server", channel);
        });
    }

    let client = SyncChannel::create(
        &handle,
        Mode::Client,
        Arc::new(NullListener),
        io_runner.clone(),
        true,
        shutdown.clone(),
    )
    .unwrap();

    let reply = Arc::new(Mutex::new(Vec::new()));
    assert!(!client.send(echo_request(b"doomed", &reply)));
    assert!(reply.lock().unwrap().is_empty());

    drop(client);
    server.stop();
    io.stop();
}

#[test]
fn filter_sends_sync_messages_from_plain_threads() {
    init();

    let _main_loop = MessageLoop::new(LoopType::Default);
    let mut io = Thread::new("io");
    io.start().unwrap();
    let io_runner = io.task_runner().unwrap();
    let mut server = Thread::new("server");
    server.start().unwrap();

    let shutdown = WaitableEvent::new(true, false);
    let handle = ChannelHandle::new("filter-sync");
    host_echo_server(&server, "server", &handle, &io_runner, &shutdown, Duration::ZERO);

    let client = SyncChannel::create(
        &handle,
        Mode::Client,
        Arc::new(NullListener),
        io_runner.clone(),
        true,
        shutdown.clone(),
    )
    .unwrap();
    let filter = client.create_sync_message_filter();

    let worker = std::thread::spawn(move || {
        let reply = Arc::new(Mutex::new(Vec::new()));
        let ok = filter.send(echo_request(b"from a plain thread", &reply));
        let payload = reply.lock().unwrap().clone();
        (ok, payload)
    });

    let (ok, payload) = worker.join().unwrap();
    assert!(ok);
    assert_eq!(payload, b"from a plain thread");

    drop(client);
    drop_held_channels(&server.task_runner().unwrap());
    server.stop();
    io.stop();
}

/// Local listener for channel B in the deep-nesting test: handling B's
/// request performs a further pump-mode sync send on channel D before
/// replying.
struct DeepListener {
    b_sender: Mutex<Option<MessageSender>>,
    d_sender: Mutex<Option<MessageSender>>,
    order: Arc<Mutex<Vec<&'static str>>>,
}

impl Listener for DeepListener {
    fn on_message_received(&self, message: &Message) -> bool {
        if !message.is_sync() {
            return true;
        }

        let d_reply = Arc::new(Mutex::new(Vec::new()));
        let mut request = echo_request(b"deep", &d_reply);
        request.enable_message_pumping();
        let ok = self
            .d_sender
            .lock()
            .unwrap()
            .as_ref()
            .expect("D not wired up")
            .send(request);
        assert!(ok);
        assert_eq!(&*d_reply.lock().unwrap(), b"deep");
        self.order.lock().unwrap().push("D done");

        let mut reply = SyncMessage::generate_reply(message);
        reply.write_bytes(SyncMessage::data(message));
        self.b_sender
            .lock()
            .unwrap()
            .as_ref()
            .expect("B not wired up")
            .send(reply);
        true
    }
}

#[test]
fn nested_pump_sends_unwind_outermost_last() {
    init();

    let _main_loop = MessageLoop::new(LoopType::Default);
    let mut io = Thread::new("io");
    io.start().unwrap();
    let io_runner = io.task_runner().unwrap();
    let mut remote1 = Thread::new("remote1");
    remote1.start().unwrap();
    let mut remote2 = Thread::new("remote2");
    remote2.start().unwrap();

    let shutdown = WaitableEvent::new(true, false);
    let handle_a = ChannelHandle::new("deep-a");
    let handle_b = ChannelHandle::new("deep-b");
    let handle_d = ChannelHandle::new("deep-d");

    // remote1: A's listener calls back over B before replying.
    {
        let io_runner = io_runner.clone();
        let shutdown = shutdown.clone();
        let handle_a = handle_a.clone();
        let handle_b = handle_b.clone();
        run_on(&remote1.task_runner().unwrap(), move || {
            let listener = Arc::new(CallbackListener {
                a_sender: Mutex::new(None),
                b_sender: Mutex::new(None),
                b_send_ok: Arc::new(AtomicBool::new(false)),
            });
            let a = SyncChannel::create(
                &handle_a,
                Mode::Server,
                listener.clone(),
                io_runner.clone(),
                true,
                shutdown.clone(),
            )
            .unwrap();
            let b = SyncChannel::create(
                &handle_b,
                Mode::Server,
                Arc::new(NullListener),
                io_runner,
                true,
                shutdown,
            )
            .unwrap();
            *listener.a_sender.lock().unwrap() = Some(a.sender());
            *listener.b_sender.lock().unwrap() = Some(b.sender());
            hold_channel("a", a);
            hold_channel("b", b);
        });
    }

    // remote2: a slow echo server for D, so D's pump-mode send really nests.
    host_echo_server(
        &remote2,
        "d",
        &handle_d,
        &io_runner,
        &shutdown,
        Duration::from_millis(30),
    );

    let order = Arc::new(Mutex::new(Vec::new()));
    let deep_listener = Arc::new(DeepListener {
        b_sender: Mutex::new(None),
        d_sender: Mutex::new(None),
        order: order.clone(),
    });

    let a = SyncChannel::create(
        &handle_a,
        Mode::Client,
        Arc::new(NullListener),
        io_runner.clone(),
        true,
        shutdown.clone(),
    )
    .unwrap();
    let b = SyncChannel::create(
        &handle_b,
        Mode::Client,
        deep_listener.clone(),
        io_runner.clone(),
        true,
        shutdown.clone(),
    )
    .unwrap();
    let d = SyncChannel::create(
        &handle_d,
        Mode::Client,
        Arc::new(NullListener),
        io_runner.clone(),
        true,
        shutdown.clone(),
    )
    .unwrap();
    *deep_listener.b_sender.lock().unwrap() = Some(b.sender());
    *deep_listener.d_sender.lock().unwrap() = Some(d.sender());

    let reply = Arc::new(Mutex::new(Vec::new()));
    let mut request = echo_request(b"outermost", &reply);
    request.enable_message_pumping();
    assert!(a.send(request));
    order.lock().unwrap().push("A done");

    assert_eq!(&*reply.lock().unwrap(), b"outermost");
    assert_eq!(*order.lock().unwrap(), ["D done", "A done"]);

    drop(a);
    drop(b);
    drop(d);
    drop_held_channels(&remote1.task_runner().unwrap());
    drop_held_channels(&remote2.task_runner().unwrap());
    remote1.stop();
    remote2.stop();
    io.stop();
}

#[test]
fn pump_messages_send_keeps_running_tasks() {
    init();

    let main_loop = MessageLoop::new(LoopType::Default);
    let mut io = Thread::new("io");
    io.start().unwrap();
    let io_runner = io.task_runner().unwrap();
    let mut server = Thread::new("server");
    server.start().unwrap();

    let shutdown = WaitableEvent::new(true, false);
    let handle = ChannelHandle::new("pumping");
    // Slow echo keeps us blocked long enough for the nested loop to spin.
    host_echo_server(
        &server,
        "server",
        &handle,
        &io_runner,
        &shutdown,
        Duration::from_millis(100),
    );

    let client = SyncChannel::create(
        &handle,
        Mode::Client,
        Arc::new(NullListener),
        io_runner.clone(),
        true,
        shutdown.clone(),
    )
    .unwrap();

    let task_ran = Arc::new(AtomicBool::new(false));
    let flag = task_ran.clone();
    main_loop.task_runner().post_task(Closure::new(move || {
        flag.store(true, Ordering::SeqCst);
    }));

    let reply = Arc::new(Mutex::new(Vec::new()));
    let mut request = echo_request(b"pumped", &reply);
    request.enable_message_pumping();
    assert!(client.send(request));

    // The task could only have run while send was blocked.
    assert!(task_ran.load(Ordering::SeqCst));
    assert_eq!(&*reply.lock().unwrap(), b"pumped");

    drop(client);
    drop_held_channels(&server.task_runner().unwrap());
    server.stop();
    io.stop();
}
