//! Dedicated worker threads with task submission and repeating loops.
//!
//! A [`ThreadWorker`] owns one OS thread and that thread's mailbox. The
//! thread's run loop interleaves posted tasks with due loop timers, and the
//! shutdown sequence is drain-then-stop: once quitting, no new work is
//! accepted, all loops are cancelled, everything already submitted runs to
//! completion, and only then does the thread go away.

mod timers;

use std::io;
use std::panic::resume_unwind;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use threadbeam_io::Mutex;

use crate::mailbox::{self, TaskPriority, ThreadMailbox};
use crate::sync::deferred::Defer;
use crate::worker::timers::{LoopBody, LoopTimers};

/// Identifies one repeating loop hosted on a worker thread.
///
/// Allocated immediately by [`ThreadWorker::start_loop_in_thread`], before
/// the loop's timer is actually armed on the worker thread; arm and disarm
/// requests travel the same FIFO, so the id is always valid for a stop.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct LoopId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("worker has begun shutting down")]
    ShuttingDown,
    #[error("worker thread is not running")]
    NotRunning,
    #[error("unknown loop id {0:?}")]
    UnknownLoop(LoopId),
}

/// State shared between worker handles and the worker thread's run loop.
struct WorkerControl {
    requested_quit: AtomicBool,
    in_flight: AtomicUsize,
    quit: Mutex<Option<Defer>>,
    timers: Mutex<LoopTimers>,
    next_loop_id: AtomicU64,
}

struct WorkerInner {
    name: String,
    thread_id: ThreadId,
    mailbox: Arc<ThreadMailbox>,
    control: Arc<WorkerControl>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// A shared handle to a dedicated worker thread.
///
/// Cloning the handle shares the same thread. The thread is shut down by
/// [`ThreadWorker::quit_thread`] or, failing that, when the last handle
/// drops (which also joins the thread).
pub struct ThreadWorker {
    inner: Arc<WorkerInner>,
}

impl Clone for ThreadWorker {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

static WORKER_COUNT: AtomicU64 = AtomicU64::new(0);

impl ThreadWorker {
    /// Spawns a worker with a generated name.
    pub fn spawn() -> io::Result<Self> {
        let n = WORKER_COUNT.fetch_add(1, Ordering::Relaxed);
        Self::spawn_named(format!("threadbeam-worker-{n}"))
    }

    /// Spawns a worker thread with the given name and blocks until its
    /// mailbox is registered and its run loop is about to start.
    pub fn spawn_named(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let control = Arc::new(WorkerControl {
            requested_quit: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            quit: Mutex::new(None),
            timers: Mutex::new(LoopTimers::new()),
            next_loop_id: AtomicU64::new(1),
        });
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let thread_control = control.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_main(thread_control, ready_tx))?;
        let (thread_id, mailbox) = ready_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "worker thread died on startup"))?;
        Ok(Self {
            inner: Arc::new(WorkerInner {
                name,
                thread_id,
                mailbox,
                control,
                handle: Mutex::new(Some(handle)),
            }),
        })
    }

    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_running(&self) -> bool {
        !self.inner.mailbox.is_closed()
    }

    /// Submits a one-shot task to the worker thread at normal priority.
    /// False once shutdown has begun or the thread is gone.
    pub fn exec_in_thread<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.exec_in_thread_with_priority(task, TaskPriority::Normal)
    }

    /// Submits a one-shot task with an explicit scheduling class. The
    /// in-flight counter is raised before posting and lowered after the
    /// task body returns; shutdown waits for it to hit zero.
    pub fn exec_in_thread_with_priority<F>(&self, task: F, priority: TaskPriority) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let control = &self.inner.control;
        if control.requested_quit.load(Ordering::Acquire) {
            return false;
        }
        control.in_flight.fetch_add(1, Ordering::AcqRel);
        let counted = control.clone();
        let posted = self.inner.mailbox.post(
            priority,
            Box::new(move || {
                task();
                counted.in_flight.fetch_sub(1, Ordering::AcqRel);
            }),
        );
        if !posted {
            control.in_flight.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Starts a repeating loop on the worker thread, firing `body` every
    /// `interval`. The returned id is usable immediately, even before the
    /// timer is armed.
    pub fn start_loop_in_thread<F>(
        &self,
        body: F,
        interval: Duration,
    ) -> Result<LoopId, WorkerError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let control = &self.inner.control;
        if control.requested_quit.load(Ordering::Acquire) {
            return Err(WorkerError::ShuttingDown);
        }
        let loop_id = LoopId(control.next_loop_id.fetch_add(1, Ordering::Relaxed));
        let body: LoopBody = Arc::new(body);
        let arming = control.clone();
        let posted = self.inner.mailbox.post(
            TaskPriority::Normal,
            Box::new(move || {
                let timer_id = arming.timers.lock().arm(loop_id, body, interval);
                log::trace!("armed {loop_id:?} as timer {timer_id}");
            }),
        );
        if !posted {
            return Err(WorkerError::NotRunning);
        }
        Ok(loop_id)
    }

    /// Cancels one loop. The returned deferred resolves once the loop is
    /// disarmed on the worker thread and rejects if the id is unknown or
    /// the worker is already gone.
    pub fn stop_loop_in_thread(&self, loop_id: LoopId) -> Defer {
        let stopped = Defer::new();
        let settle = stopped.clone();
        let control = self.inner.control.clone();
        let posted = self.inner.mailbox.post(
            TaskPriority::Normal,
            Box::new(move || {
                if control.timers.lock().disarm(loop_id) {
                    settle.resolve(());
                } else {
                    log::warn!("{}", WorkerError::UnknownLoop(loop_id));
                    settle.reject(());
                }
            }),
        );
        if !posted {
            stopped.reject(());
        }
        stopped
    }

    /// Cancels every loop on the worker; resolves once all are disarmed.
    pub fn stop_all_loops_in_thread(&self) -> Defer {
        let stopped = Defer::new();
        let settle = stopped.clone();
        let control = self.inner.control.clone();
        let posted = self.inner.mailbox.post(
            TaskPriority::Normal,
            Box::new(move || {
                let cancelled = control.timers.lock().clear();
                log::trace!("cancelled {cancelled} loops");
                settle.resolve(());
            }),
        );
        if !posted {
            stopped.reject(());
        }
        stopped
    }

    /// Begins graceful shutdown: refuse new work, cancel every loop, let
    /// already-submitted tasks drain, then stop the thread. The returned
    /// deferred resolves once the thread's mailbox is torn down and the run
    /// loop is exiting.
    ///
    /// Idempotent: every call (including after the thread has stopped)
    /// returns the same deferred.
    pub fn quit_thread(&self) -> Defer {
        let control = self.inner.control.clone();
        let quitting = {
            let mut quit = control.quit.lock();
            if let Some(existing) = quit.as_ref() {
                return existing.clone();
            }
            let quitting = Defer::new();
            *quit = Some(quitting.clone());
            quitting
        };
        control.requested_quit.store(true, Ordering::Release);
        let draining = control.clone();
        let posted = self.inner.mailbox.post(
            TaskPriority::Normal,
            Box::new(move || {
                let cancelled = draining.timers.lock().clear();
                if cancelled > 0 {
                    log::trace!("shutdown cancelled {cancelled} loops");
                }
            }),
        );
        if !posted {
            // thread already gone; nothing to drain
            quitting.resolve(());
        }
        quitting
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        {
            let mut quit = self.control.quit.lock();
            if quit.is_none() {
                *quit = Some(Defer::new());
            }
        }
        self.control.requested_quit.store(true, Ordering::Release);
        let draining = self.control.clone();
        let _ = self.mailbox.post(
            TaskPriority::Normal,
            Box::new(move || {
                draining.timers.lock().clear();
            }),
        );
        // never self-join: the last handle may die inside a worker task
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            match handle.join() {
                Ok(()) => {}
                Err(payload) => {
                    if !thread::panicking() {
                        resume_unwind(payload);
                    }
                }
            }
        }
    }
}

/// The worker thread's run loop: tasks interleaved with due timers, then a
/// drain-and-teardown once quit is requested.
fn worker_main(control: Arc<WorkerControl>, ready_tx: Sender<(ThreadId, Arc<ThreadMailbox>)>) {
    let mailbox = mailbox::install_current_thread();
    let thread_id = thread::current().id();
    log::trace!("worker thread {thread_id:?} starting");
    let _ = ready_tx.send((thread_id, mailbox.clone()));
    drop(ready_tx);

    loop {
        let deadline = control.timers.lock().next_deadline();
        let task = match deadline {
            Some(deadline) => mailbox.pop_wait_until(deadline),
            None => {
                if control.requested_quit.load(Ordering::Acquire) {
                    match mailbox.try_pop() {
                        Some(task) => Some(task),
                        None => {
                            if control.in_flight.load(Ordering::Acquire) == 0 {
                                break;
                            }
                            // a submission raised the counter but its post
                            // has not landed yet; wait briefly for it
                            mailbox.pop_wait_until(Instant::now() + Duration::from_millis(50))
                        }
                    }
                } else {
                    mailbox.pop_wait()
                }
            }
        };
        match task {
            Some(task) => task(),
            None => {
                let due = {
                    let mut timers = control.timers.lock();
                    timers.take_due(Instant::now())
                };
                for body in due {
                    body();
                }
            }
        }
    }

    let quitting = control.quit.lock().clone();
    // close the mailbox before resolving: late posts must be dropped, and
    // per-thread callback tables keyed by this thread must be released
    mailbox::uninstall_current_thread();
    log::trace!("worker thread {thread_id:?} exiting");
    if let Some(quitting) = quitting {
        quitting.resolve(());
    }
}
