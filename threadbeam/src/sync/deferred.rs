//! The deferred (promise) engine.
//!
//! A [`Deferred`] is a cheap handle over shared settlement state: cloning a
//! handle clones an `Arc`, never the state. Callbacks are segmented by the
//! thread that registered them, and always execute on that thread by being
//! posted through its mailbox; the thread that calls [`Deferred::resolve`]
//! never runs anyone else's callbacks inline.
//!
//! Settlement is one-shot. Resolving or rejecting an already settled
//! deferred is a logged no-op rather than an error: in a racy multithreaded
//! program the loser of a settle race often cannot know it lost until after
//! the fact.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

use threadbeam_io::Mutex;

use crate::mailbox::{self, TaskPriority, ThreadMailbox};

/// Settlement state of a [`Deferred`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PromiseState {
    Pending,
    Resolved,
    Rejected,
}

/// A deferred with no payload.
pub type Defer = Deferred<()>;

type SettleCallback<T> = Box<dyn FnOnce(&T) + Send>;
type ZeroCallback = Box<dyn FnOnce() + Send>;
type ProgressCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Callbacks registered from one particular thread.
///
/// The one-shot lists are taken (and therefore cleared) at settlement; the
/// progress list stays live for the deferred's whole lifetime so repeated
/// notifications keep working.
struct ThreadCallbacks<T> {
    done: Vec<SettleCallback<T>>,
    fail: Vec<SettleCallback<T>>,
    progress: Vec<ProgressCallback<T>>,
    done_zero: Vec<ZeroCallback>,
    fail_zero: Vec<ZeroCallback>,
}

impl<T> Default for ThreadCallbacks<T> {
    fn default() -> Self {
        Self {
            done: Vec::new(),
            fail: Vec::new(),
            progress: Vec::new(),
            done_zero: Vec::new(),
            fail_zero: Vec::new(),
        }
    }
}

struct DeferredState<T> {
    state: PromiseState,
    outcome: Option<T>,
    callbacks: HashMap<ThreadId, ThreadCallbacks<T>>,
}

/// A one-shot, thread-affine promise handle.
///
/// `T` is the settlement payload; use a tuple for multiple values and `()`
/// (or the [`Defer`] alias) for none. Payloads are cloned once per
/// subscriber thread, so each thread's callbacks read a snapshot that no
/// other thread mutates.
pub struct Deferred<T> {
    inner: Arc<Mutex<DeferredState<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeferredState {
                state: PromiseState::Pending,
                outcome: None,
                callbacks: HashMap::new(),
            })),
        }
    }

    /// Current settlement state; safe from any thread.
    pub fn state(&self) -> PromiseState {
        self.inner.lock().state
    }

    pub(crate) fn outcome(&self) -> Option<T> {
        self.inner.lock().outcome.clone()
    }

    /// Registers `callback` to run on the calling thread once resolved.
    ///
    /// If the deferred is already resolved the callback is not invoked
    /// synchronously; it is posted through the calling thread's mailbox like
    /// any live delivery, so it cannot jump ahead of work posted earlier.
    pub fn done<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let mailbox = mailbox::install_current_thread();
        let mut state = self.inner.lock();
        match state.state {
            PromiseState::Resolved => {
                self.replay(&mailbox, state.outcome.clone(), Box::new(callback));
            }
            PromiseState::Rejected => {
                // settled the other way; this callback can never fire
            }
            PromiseState::Pending => {
                if let Some(slot) = self.thread_slot(&mut state, &mailbox) {
                    slot.done.push(Box::new(callback));
                }
            }
        }
        self
    }

    /// Registers `callback` to run on the calling thread once rejected.
    ///
    /// A rejection produced by chain short-circuiting carries no payload; in
    /// that case typed fail callbacks are dropped and only the zero-argument
    /// propagation path fires.
    pub fn fail<F>(&self, callback: F) -> &Self
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let mailbox = mailbox::install_current_thread();
        let mut state = self.inner.lock();
        match state.state {
            PromiseState::Rejected => {
                self.replay(&mailbox, state.outcome.clone(), Box::new(callback));
            }
            PromiseState::Resolved => {}
            PromiseState::Pending => {
                if let Some(slot) = self.thread_slot(&mut state, &mailbox) {
                    slot.fail.push(Box::new(callback));
                }
            }
        }
        self
    }

    /// Registers a multi-shot progress callback on the calling thread.
    ///
    /// Progress callbacks are never replayed retroactively and survive
    /// settlement (notifying a settled deferred is a no-op anyway).
    pub fn progress<F>(&self, callback: F) -> &Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mailbox = mailbox::install_current_thread();
        let mut state = self.inner.lock();
        if let Some(slot) = self.thread_slot(&mut state, &mailbox) {
            slot.progress.push(Arc::new(callback));
        }
        self
    }

    /// Zero-argument done registration; the type-erased face used by
    /// combinators and chaining.
    pub(crate) fn done_zero(&self, callback: ZeroCallback) {
        let mailbox = mailbox::install_current_thread();
        let mut state = self.inner.lock();
        match state.state {
            PromiseState::Resolved => {
                self.replay_zero(&mailbox, callback);
            }
            PromiseState::Rejected => {}
            PromiseState::Pending => {
                if let Some(slot) = self.thread_slot(&mut state, &mailbox) {
                    slot.done_zero.push(callback);
                }
            }
        }
    }

    /// Zero-argument fail registration, counterpart of
    /// [`Deferred::done_zero`]. Fires for both typed and payload-less
    /// rejections.
    pub(crate) fn fail_zero(&self, callback: ZeroCallback) {
        let mailbox = mailbox::install_current_thread();
        let mut state = self.inner.lock();
        match state.state {
            PromiseState::Rejected => {
                self.replay_zero(&mailbox, callback);
            }
            PromiseState::Resolved => {}
            PromiseState::Pending => {
                if let Some(slot) = self.thread_slot(&mut state, &mailbox) {
                    slot.fail_zero.push(callback);
                }
            }
        }
    }

    /// Settles the deferred as resolved, firing every registered done
    /// callback on its own thread with a snapshot of `value`.
    ///
    /// No-op (with a warning) if already settled.
    pub fn resolve(&self, value: T) {
        self.settle(PromiseState::Resolved, Some(value));
    }

    /// Settles the deferred as rejected. No-op (with a warning) if already
    /// settled.
    pub fn reject(&self, value: T) {
        self.settle(PromiseState::Rejected, Some(value));
    }

    /// Rejection without a payload, used when a chain short-circuits before
    /// the typed outcome exists. Only zero-argument fail callbacks fire.
    pub(crate) fn reject_zero(&self) {
        self.settle(PromiseState::Rejected, None);
    }

    /// Delivers a progress notification to every subscribed thread. Legal
    /// only while pending; notifying a settled deferred warns and does
    /// nothing.
    pub fn notify(&self, value: T) {
        let state = self.inner.lock();
        if state.state != PromiseState::Pending {
            log::warn!(
                "cannot notify a deferred that is already {:?}",
                state.state
            );
            return;
        }
        for (thread, slot) in state.callbacks.iter() {
            if slot.progress.is_empty() {
                continue;
            }
            let target = match mailbox::get(*thread) {
                Some(target) => target,
                None => continue,
            };
            let callbacks: Vec<ProgressCallback<T>> = slot.progress.clone();
            let snapshot = value.clone();
            let keep_alive = self.clone();
            target.post(
                TaskPriority::Normal,
                Box::new(move || {
                    for callback in &callbacks {
                        callback(&snapshot);
                    }
                    drop(keep_alive);
                }),
            );
        }
    }

    /// Chains a new deferred of a different payload type off this one.
    ///
    /// When this deferred resolves, `on_resolved` runs (on the thread that
    /// called `then`) and must produce an inner deferred; the returned
    /// deferred then resolves, rejects and progresses in lockstep with that
    /// inner one. If this deferred rejects instead, the returned deferred is
    /// rejected without a payload.
    pub fn then<U, F>(&self, on_resolved: F) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(&T) -> Deferred<U> + Send + 'static,
    {
        self.then_impl(on_resolved, None)
    }

    /// Like [`Deferred::then`], with a zero-argument handler that fires if
    /// this deferred rejects before the chain could start.
    pub fn then_or_else<U, F, G>(&self, on_resolved: F, on_rejected: G) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(&T) -> Deferred<U> + Send + 'static,
        G: FnOnce() + Send + 'static,
    {
        self.then_impl(on_resolved, Some(Box::new(on_rejected)))
    }

    fn then_impl<U, F>(&self, on_resolved: F, on_rejected: Option<ZeroCallback>) -> Deferred<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(&T) -> Deferred<U> + Send + 'static,
    {
        let chained = Deferred::<U>::new();
        {
            let chained = chained.clone();
            self.done(move |args| {
                let inner = on_resolved(args);
                {
                    let chained = chained.clone();
                    inner.done(move |value| chained.resolve(value.clone()));
                }
                {
                    let chained = chained.clone();
                    inner.progress(move |value| chained.notify(value.clone()));
                }
                // one fail-side hook only: rejecting through both the typed
                // and the zero path would double-settle the chained deferred
                let source = inner.clone();
                inner.fail_zero(Box::new(move || match source.outcome() {
                    Some(value) => chained.reject(value),
                    None => chained.reject_zero(),
                }));
            });
        }
        {
            let chained = chained.clone();
            self.fail_zero(Box::new(move || {
                if let Some(handler) = on_rejected {
                    handler();
                }
                chained.reject_zero();
            }));
        }
        chained
    }

    /// Blocks the calling thread until this deferred settles, by running the
    /// thread's own mailbox loop rather than parking it. Returns true if it
    /// resolved, false if it rejected.
    ///
    /// Precondition: settlement must come from another thread. Waiting on a
    /// deferred only the current thread could settle deadlocks, and the
    /// engine makes no attempt to detect that.
    pub fn wait(&self) -> bool {
        crate::sync::operations::wait_all([self.clone()])
    }

    /// Locates (creating if needed) the calling thread's callback slot, and
    /// ties the slot's lifetime to the thread via a mailbox close hook.
    /// Returns None when the thread is already terminating.
    fn thread_slot<'a>(
        &self,
        state: &'a mut DeferredState<T>,
        mailbox: &Arc<ThreadMailbox>,
    ) -> Option<&'a mut ThreadCallbacks<T>> {
        let thread = mailbox.owner();
        if !state.callbacks.contains_key(&thread) {
            let weak = Arc::downgrade(&self.inner);
            let registered = mailbox.on_close(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.lock().callbacks.remove(&thread);
                }
            }));
            if !registered {
                log::warn!("dropping callback registered from terminating thread {thread:?}");
                return None;
            }
            state.callbacks.insert(thread, ThreadCallbacks::default());
        }
        state.callbacks.get_mut(&thread)
    }

    /// Replays an already-decided outcome to a late subscriber through the
    /// normal posting path, preserving causal order with earlier posts.
    fn replay(
        &self,
        mailbox: &Arc<ThreadMailbox>,
        outcome: Option<T>,
        callback: SettleCallback<T>,
    ) {
        let keep_alive = self.clone();
        mailbox.post(
            TaskPriority::Normal,
            Box::new(move || {
                if let Some(args) = outcome {
                    callback(&args);
                }
                drop(keep_alive);
            }),
        );
    }

    fn replay_zero(&self, mailbox: &Arc<ThreadMailbox>, callback: ZeroCallback) {
        let keep_alive = self.clone();
        mailbox.post(
            TaskPriority::Normal,
            Box::new(move || {
                callback();
                drop(keep_alive);
            }),
        );
    }

    /// The one-shot state transition. Everything between the pending check
    /// and the queuing of per-thread deliveries happens under the state
    /// lock, so a concurrent settle race has exactly one winner.
    fn settle(&self, target: PromiseState, value: Option<T>) {
        let mut state = self.inner.lock();
        if state.state != PromiseState::Pending {
            log::warn!(
                "cannot settle an already {:?} deferred (attempted {:?})",
                state.state,
                target
            );
            return;
        }
        state.state = target;
        state.outcome = value;
        let resolved = target == PromiseState::Resolved;

        let per_thread: Vec<(ThreadId, Vec<SettleCallback<T>>, Vec<ZeroCallback>)> = state
            .callbacks
            .iter_mut()
            .map(|(thread, slot)| {
                let (list, zero) = if resolved {
                    slot.fail.clear();
                    slot.fail_zero.clear();
                    (
                        std::mem::take(&mut slot.done),
                        std::mem::take(&mut slot.done_zero),
                    )
                } else {
                    slot.done.clear();
                    slot.done_zero.clear();
                    (
                        std::mem::take(&mut slot.fail),
                        std::mem::take(&mut slot.fail_zero),
                    )
                };
                (*thread, list, zero)
            })
            .collect();

        for (thread, list, zero) in per_thread {
            if list.is_empty() && zero.is_empty() {
                continue;
            }
            let target_mailbox = match mailbox::get(thread) {
                Some(target_mailbox) => target_mailbox,
                None => continue,
            };
            let snapshot = state.outcome.clone();
            let keep_alive = self.clone();
            target_mailbox.post(
                TaskPriority::Normal,
                Box::new(move || {
                    if let Some(args) = snapshot {
                        for callback in list {
                            callback(&args);
                        }
                    }
                    for callback in zero {
                        callback();
                    }
                    // the state must outlive its own deliveries even if
                    // every user handle is gone
                    drop(keep_alive);
                }),
            );
        }
    }
}
