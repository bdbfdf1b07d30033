//! Per-thread message loops, cooperative task scheduling, and synchronous
//! IPC channels.
//!
//! The core of the crate is the [`MessageLoop`]: a per-thread event pump
//! that executes posted closures (immediate, delayed, and non-nestable)
//! interleaved with I/O completion events. Foreign threads reach a loop only
//! through its thread-safe [`TaskRunner`]; [`RunLoop`] drives a loop with
//! nesting and quit-when-idle semantics; [`WaitableEvent`] and
//! [`WaitableEventWatcher`] bridge blocking synchronization into the loop;
//! and [`Thread`] bundles an OS thread with a loop of its own.
//!
//! On top of that, the [`ipc`] module layers message channels whose
//! synchronous sends block for a reply *while still dispatching nested
//! inbound synchronous requests*, the pattern that lets two event-loop
//! threads call into each other without deadlocking.
//!
//! # Example
//!
//! ```
//! use looper::{Closure, LoopType, MessageLoop, RunLoop, TaskRunner};
//!
//! let message_loop = MessageLoop::new(LoopType::Default);
//! let runner = message_loop.task_runner();
//!
//! let mut run_loop = RunLoop::new();
//! let quit = run_loop.quit_closure();
//! runner.post_task(Closure::new(move || {
//!     println!("on the loop");
//!     quit();
//! }));
//! run_loop.run();
//! ```

#![warn(missing_docs, missing_debug_implementations)]
#![allow(clippy::new_without_default)]

mod event;
mod queue;
mod run_loop;
mod sys;
mod watcher;

pub mod ipc;
pub mod message_loop;
pub mod pump;
pub mod runner;
pub mod task;
pub mod thread;
pub mod weak;

pub use crate::event::{wait_many, WaitableEvent, MAX_WAIT_OBJECTS};
pub use crate::message_loop::{
    CurrentLoop, DestructionObserver, LoopType, MessageLoop, TaskObserver, UnboundLoop,
};
pub use crate::pump::{CompletionPort, Delegate, IoHandler, Pump, Waker};
pub use crate::run_loop::RunLoop;
pub use crate::runner::{TaskRunner, TaskRunnerExt};
pub use crate::task::{Closure, PendingTask};
pub use crate::thread::Thread;
pub use crate::watcher::{EventCallback, WaitableEventWatcher};
pub use crate::weak::{WeakFactory, WeakHandle};
