use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use looper::{LoopType, MessageLoop, RunLoop, WaitableEvent, WaitableEventWatcher};

mod util;

use util::{assert_send, init};

#[test]
fn watcher_is_send() {
    assert_send::<WaitableEventWatcher>();
}

#[test]
fn callback_runs_on_the_watching_thread() {
    init();

    let message_loop = MessageLoop::new(LoopType::Default);
    let event = WaitableEvent::new(false, false);

    let fired = Arc::new(AtomicUsize::new(0));
    let mut run_loop = RunLoop::new();
    let quit = run_loop.quit_closure();

    let mut watcher = WaitableEventWatcher::new();
    let counter = fired.clone();
    let watched = event.clone();
    assert!(watcher.start_watching(
        &event,
        Arc::new(move |signaled: &WaitableEvent| {
            assert_eq!(*signaled, watched);
            counter.fetch_add(1, Ordering::SeqCst);
            quit();
        }),
    ));
    assert!(watcher.is_watching());

    let signaler = event.clone();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        signaler.signal();
    });

    run_loop.run();
    handle.join().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    drop(message_loop);
}

#[test]
fn already_signaled_event_delivers_immediately() {
    init();

    let message_loop = MessageLoop::new(LoopType::Default);
    let event = WaitableEvent::new(true, true);

    let fired = Arc::new(AtomicUsize::new(0));
    let mut watcher = WaitableEventWatcher::new();
    let counter = fired.clone();
    watcher.start_watching(
        &event,
        Arc::new(move |_: &WaitableEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    message_loop.run_until_idle();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn stop_watching_cancels_a_delivered_signal() {
    init();

    let message_loop = MessageLoop::new(LoopType::Default);
    let event = WaitableEvent::new(false, false);

    let fired = Arc::new(AtomicUsize::new(0));
    let mut watcher = WaitableEventWatcher::new();
    let counter = fired.clone();
    watcher.start_watching(
        &event,
        Arc::new(move |_: &WaitableEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    // The signal fires the waiter and posts the callback...
    event.signal();
    // ...but stopping before the loop runs must suppress it. (This is the
    // documented auto-reset caveat: the signal is consumed and lost.)
    watcher.stop_watching();
    assert!(!watcher.is_watching());

    message_loop.run_until_idle();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    assert!(!event.is_signaled());
}

#[test]
fn dropping_the_watcher_cancels_delivery() {
    init();

    let message_loop = MessageLoop::new(LoopType::Default);
    let event = WaitableEvent::new(false, false);

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let mut watcher = WaitableEventWatcher::new();
        let counter = fired.clone();
        watcher.start_watching(
            &event,
            Arc::new(move |_: &WaitableEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        event.signal();
    }

    message_loop.run_until_idle();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn manual_reset_event_redelivers_on_rearm() {
    init();

    let message_loop = MessageLoop::new(LoopType::Default);
    let event = WaitableEvent::new(true, false);

    let fired = Arc::new(AtomicUsize::new(0));
    let mut watcher = WaitableEventWatcher::new();
    let counter = fired.clone();
    let callback: looper::EventCallback = Arc::new(move |_: &WaitableEvent| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    watcher.start_watching(&event, callback.clone());
    event.signal();
    message_loop.run_until_idle();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // The event is manual reset and still signaled: a new watch observes it
    // again immediately.
    watcher.start_watching(&event, callback);
    message_loop.run_until_idle();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn watch_info_supports_suspend_and_rearm() {
    init();

    let message_loop = MessageLoop::new(LoopType::Default);
    let event = WaitableEvent::new(true, false);

    let fired = Arc::new(AtomicUsize::new(0));
    let mut watcher = WaitableEventWatcher::new();
    let counter = fired.clone();
    watcher.start_watching(
        &event,
        Arc::new(move |_: &WaitableEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    // Suspend the watch, as a nested blocking send does with an outer one.
    let suspended_event = watcher.watched_event().unwrap();
    let suspended_callback = watcher.callback().unwrap();
    watcher.stop_watching();

    // A signal while suspended is not delivered...
    event.signal();
    message_loop.run_until_idle();
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // ...but the manual-reset state is still there on re-arm.
    watcher.start_watching(&suspended_event, suspended_callback);
    message_loop.run_until_idle();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
