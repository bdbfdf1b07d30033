// Not all helpers are used by all test binaries.
#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use looper::{Closure, TaskRunner, WaitableEvent};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}

/// Generous bound for "happens promptly" assertions; loose enough for slow
/// CI machines.
pub const GENEROUS: Duration = Duration::from_secs(5);

/// Runs `f` on `runner` and blocks until it finished.
pub fn run_on(runner: &std::sync::Arc<dyn TaskRunner>, f: impl FnOnce() + Send + 'static) {
    let done = WaitableEvent::new(false, false);
    let signal = done.clone();
    assert!(runner.post_task(Closure::new(move || {
        f();
        signal.signal();
    })));
    assert!(done.timed_wait(GENEROUS), "task did not finish in time");
}
