//! The thread-affine dispatch substrate.
//!
//! Every thread that registers a callback anywhere in this crate gets a
//! [`ThreadMailbox`]: a FIFO of posted closures that only the owning thread
//! ever executes, by draining it from its own run loop. Producers on any
//! thread post into the mailbox without blocking; the process-wide registry
//! maps thread ids to live mailboxes so settlement code can find them.
//!
//! A mailbox dies with its thread. A thread-local guard installed on first
//! use removes the mailbox from the registry during thread teardown, drops
//! whatever tasks were still queued, and runs any close hooks other
//! components registered (promise states and event buses use those hooks to
//! release the callback tables they keyed by the dead thread). Posting to a
//! terminated thread is a logged no-op, never an error.
//!
//! Lock order, outermost first: instance lock (promise/bus/worker), registry
//! lock, mailbox queue lock. Queued tasks always run with no engine lock
//! held.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Instant;

use once_cell::sync::Lazy;
use threadbeam_io::{Condvar, Mutex};

/// A closure queued for execution on a specific thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling class for a posted task.
///
/// All engine-internal posts use [`TaskPriority::Normal`], so promise and
/// event deliveries to one thread always run in post order. The other levels
/// exist for explicit task submission through a worker handle.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

struct QueuedTask {
    priority: TaskPriority,
    seq: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: higher priority wins, then FIFO within a priority
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct MailboxQueue {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
    closed: bool,
    close_hooks: Vec<Task>,
}

/// A per-thread FIFO of posted closures, drained only by its owning thread.
pub struct ThreadMailbox {
    owner: ThreadId,
    queue: Mutex<MailboxQueue>,
    ready: Condvar,
}

impl ThreadMailbox {
    fn new(owner: ThreadId) -> Self {
        Self {
            owner,
            queue: Mutex::new(MailboxQueue::default()),
            ready: Condvar::new(),
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Enqueues a task for the owning thread. Never blocks beyond the queue
    /// lock. Returns false (and drops the task) once the mailbox is closed.
    pub fn post(&self, priority: TaskPriority, task: Task) -> bool {
        let mut queue = self.queue.lock();
        if queue.closed {
            log::trace!(
                "dropping task posted to terminated thread {:?}",
                self.owner
            );
            return false;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(QueuedTask {
            priority,
            seq,
            task,
        });
        drop(queue);
        self.ready.notify_all();
        true
    }

    /// Registers teardown work to run when the owning thread terminates.
    ///
    /// Returns false (and drops the hook) if the mailbox is already closed;
    /// callers must not register per-thread state against a dead mailbox.
    pub fn on_close(&self, hook: Task) -> bool {
        let mut queue = self.queue.lock();
        if queue.closed {
            return false;
        }
        queue.close_hooks.push(hook);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().heap.is_empty()
    }

    /// Pops the next task without waiting. Owner thread only.
    pub fn try_pop(&self) -> Option<Task> {
        debug_assert_eq!(thread::current().id(), self.owner);
        self.queue.lock().heap.pop().map(|queued| queued.task)
    }

    /// Blocks the owning thread until a task arrives. Returns None once the
    /// mailbox is closed and drained.
    pub fn pop_wait(&self) -> Option<Task> {
        debug_assert_eq!(thread::current().id(), self.owner);
        let mut queue = self.queue.lock();
        loop {
            if let Some(queued) = queue.heap.pop() {
                return Some(queued.task);
            }
            if queue.closed {
                return None;
            }
            self.ready.wait(&mut queue);
        }
    }

    /// Like [`ThreadMailbox::pop_wait`], but gives up at `deadline` so the
    /// caller can interleave timer work with task dispatch.
    pub fn pop_wait_until(&self, deadline: Instant) -> Option<Task> {
        debug_assert_eq!(thread::current().id(), self.owner);
        let mut queue = self.queue.lock();
        loop {
            if let Some(queued) = queue.heap.pop() {
                return Some(queued.task);
            }
            if queue.closed {
                return None;
            }
            if self.ready.wait_until(&mut queue, deadline).timed_out() {
                return queue.heap.pop().map(|queued| queued.task);
            }
        }
    }

    /// Marks the mailbox closed, drops undelivered tasks and runs the close
    /// hooks. Idempotent.
    pub(crate) fn close(&self) {
        let (undelivered, hooks) = {
            let mut queue = self.queue.lock();
            if queue.closed {
                return;
            }
            queue.closed = true;
            (
                std::mem::take(&mut queue.heap),
                std::mem::take(&mut queue.close_hooks),
            )
        };
        self.ready.notify_all();
        if !undelivered.is_empty() {
            log::trace!(
                "mailbox for {:?} closed with {} undelivered tasks",
                self.owner,
                undelivered.len()
            );
        }
        // user captures drop outside the queue lock
        drop(undelivered);
        for hook in hooks {
            hook();
        }
    }
}

static REGISTRY: Lazy<Mutex<HashMap<ThreadId, Arc<ThreadMailbox>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

thread_local! {
    static CURRENT: RefCell<Option<MailboxGuard>> = RefCell::new(None);
}

/// Removes the calling thread's mailbox from the registry and closes it when
/// the thread terminates (thread-local storage teardown).
struct MailboxGuard {
    mailbox: Arc<ThreadMailbox>,
}

impl Drop for MailboxGuard {
    fn drop(&mut self) {
        REGISTRY.lock().remove(&self.mailbox.owner());
        // hooks run after the registry lock is released
        self.mailbox.close();
    }
}

/// Returns the calling thread's mailbox, creating and registering it on
/// first use.
pub fn install_current_thread() -> Arc<ThreadMailbox> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(guard) = slot.as_ref() {
            return guard.mailbox.clone();
        }
        let id = thread::current().id();
        let mailbox = REGISTRY
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(ThreadMailbox::new(id)))
            .clone();
        log::trace!("registered mailbox for thread {:?}", id);
        *slot = Some(MailboxGuard {
            mailbox: mailbox.clone(),
        });
        mailbox
    })
}

/// Looks up a live mailbox by thread id. None means the thread never
/// registered or has already terminated.
pub fn get(thread: ThreadId) -> Option<Arc<ThreadMailbox>> {
    REGISTRY.lock().get(&thread).cloned()
}

/// Deterministically tears down the calling thread's mailbox ahead of thread
/// exit. Used by worker shutdown so late posts are dropped before the quit
/// promise resolves.
pub(crate) fn uninstall_current_thread() {
    CURRENT.with(|slot| {
        slot.borrow_mut().take();
    });
}

/// Runs every task currently queued for the calling thread, then returns the
/// number executed. Tasks posted while draining are picked up too.
pub fn process_queued() -> usize {
    let mailbox = install_current_thread();
    let mut executed = 0;
    while let Some(task) = mailbox.try_pop() {
        task();
        executed += 1;
    }
    executed
}

/// The calling thread's run loop: executes posted tasks for as long as
/// `keep_going` returns true, parking between tasks.
///
/// This is re-entrant; a task may itself call back into `run_while`, which
/// is how a blocking promise wait keeps the thread's dispatch alive.
pub fn run_while(mut keep_going: impl FnMut() -> bool) {
    let mailbox = install_current_thread();
    while keep_going() {
        match mailbox.pop_wait() {
            Some(task) => task(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    fn setup_log() {
        std::env::set_var("RUST_LOG", "error,warn,info,trace");
        let _ = env_logger::try_init();
    }

    #[test]
    fn posts_execute_in_post_order() {
        setup_log();
        let mailbox = install_current_thread();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8usize {
            let order = order.clone();
            mailbox.post(
                TaskPriority::Normal,
                Box::new(move || order.lock().push(i)),
            );
        }
        process_queued();
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn high_priority_preempts_normal_but_stays_fifo() {
        setup_log();
        let mailbox = install_current_thread();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (label, priority) in [
            ("n1", TaskPriority::Normal),
            ("n2", TaskPriority::Normal),
            ("h1", TaskPriority::High),
            ("h2", TaskPriority::High),
            ("l1", TaskPriority::Low),
        ] {
            let order = order.clone();
            mailbox.post(priority, Box::new(move || order.lock().push(label)));
        }
        process_queued();
        assert_eq!(*order.lock(), vec!["h1", "h2", "n1", "n2", "l1"]);
    }

    #[test]
    fn cross_thread_post_wakes_parked_owner() {
        setup_log();
        let counter = Arc::new(AtomicUsize::new(0));
        let thread_counter = counter.clone();
        let handle = thread::spawn(move || {
            let mailbox = install_current_thread();
            // drain exactly one task, parking until it arrives
            if let Some(task) = mailbox.pop_wait() {
                task();
            }
            thread_counter.load(Ordering::SeqCst)
        });
        // wait for the other thread's mailbox to appear in the registry
        let target = loop {
            if let Some(found) = REGISTRY
                .lock()
                .iter()
                .find(|(id, _)| **id == handle.thread().id())
                .map(|(_, m)| m.clone())
            {
                break found;
            }
            thread::sleep(Duration::from_millis(1));
        };
        let poster_counter = counter.clone();
        assert!(target.post(
            TaskPriority::Normal,
            Box::new(move || {
                poster_counter.fetch_add(1, Ordering::SeqCst);
            })
        ));
        assert_eq!(handle.join().unwrap(), 1);
    }

    #[test]
    fn mailbox_is_unregistered_when_thread_dies() {
        setup_log();
        let hook_ran = Arc::new(AtomicUsize::new(0));
        let thread_hook = hook_ran.clone();
        let id = thread::spawn(move || {
            let mailbox = install_current_thread();
            mailbox.on_close(Box::new(move || {
                thread_hook.fetch_add(1, Ordering::SeqCst);
            }));
            thread::current().id()
        })
        .join()
        .unwrap();
        // teardown is synchronous with thread exit
        assert!(get(id).is_none());
        assert_eq!(hook_ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn post_to_closed_mailbox_is_dropped() {
        setup_log();
        let mailbox = thread::spawn(|| {
            let mailbox = install_current_thread();
            uninstall_current_thread();
            mailbox
        })
        .join()
        .unwrap();
        assert!(mailbox.is_closed());
        assert!(!mailbox.post(TaskPriority::Normal, Box::new(|| ())));
        assert!(!mailbox.on_close(Box::new(|| ())));
    }

    #[test]
    fn pop_wait_until_times_out_with_empty_queue() {
        setup_log();
        let mailbox = install_current_thread();
        process_queued();
        let started = Instant::now();
        let deadline = started + Duration::from_millis(20);
        assert!(mailbox.pop_wait_until(deadline).is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
