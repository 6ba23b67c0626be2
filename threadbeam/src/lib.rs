//! # Threadbeam
//!
//! A thread-affine synchronization library: single-threaded-looking
//! asynchronous code that safely spans multiple worker threads.
//!
//! ## Features
//!
//! - **Deferreds**: one-shot promises that settle exactly once from any
//!   thread, with callbacks guaranteed to run on the thread that registered
//!   them
//! - **Events**: a named publish/subscribe bus with the same cross-thread
//!   delivery guarantee
//! - **Workers**: dedicated threads hosting submitted tasks and repeating
//!   timer loops, with drain-on-shutdown
//! - **Zero Unsafe Code**: completely safe Rust implementation
//!
//! ## Core Components
//!
//! - `mailbox`: the per-thread dispatch substrate every other component
//!   rides on
//! - `sync`: the deferred engine, the event bus and the combinators
//! - `worker`: dedicated worker threads with task and loop hosting
//!
//! ## Example
//!
//! ```rust,no_run
//! use threadbeam::{Deferred, ThreadWorker};
//!
//! let worker = ThreadWorker::spawn().unwrap();
//! let computed = Deferred::<u32>::new();
//!
//! let provider = computed.clone();
//! worker.exec_in_thread(move || {
//!     provider.resolve(42);
//! });
//!
//! computed.done(|value| println!("computed: {value}"));
//! assert!(computed.wait());
//! worker.quit_thread().wait();
//! ```
//!
//! ## Design Philosophy
//!
//! 1. **Thread affinity is explicit**: a callback belongs to the thread that
//!    registered it; nothing ever migrates
//! 2. **Posting never blocks**: settlement from any thread only enqueues;
//!    each thread's own run loop does the dispatch
//! 3. **Misuse is loud, not fatal**: double settlement and friends warn and
//!    no-op, because the loser of a settle race often cannot know in advance
//! 4. **Cancellation is cooperative**: the only implicit drop is a dead
//!    thread's undelivered mailbox
//!
//! ## Usage Notes
//!
//! - A thread only receives callbacks while it drains its mailbox: workers
//!   do this automatically, other threads via [`Deferred::wait`],
//!   [`mailbox::process_queued`] or [`mailbox::run_while`]
//! - Waiting on a deferred that only the current thread could settle
//!   deadlocks; settlement must come from elsewhere
#![forbid(unsafe_code)]

pub mod mailbox;
pub mod sync;
pub mod worker;

pub use mailbox::TaskPriority;
pub use sync::deferred::{Defer, Deferred, PromiseState};
pub use sync::eventer::{BusLifecycle, Eventer};
pub use sync::events::{Events, EventsHandle};
pub use sync::operations::{wait_all, when, DeferredLike};
pub use worker::{LoopId, ThreadWorker, WorkerError};
