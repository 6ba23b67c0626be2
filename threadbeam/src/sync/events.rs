//! Named publish/subscribe events with thread-affine delivery.
//!
//! An [`Events`] bus carries one payload type. Subscriptions are keyed by
//! event name, registering thread and a process-wide monotonic id, so a
//! trigger from any thread fans out one posted closure per subscriber
//! thread and callbacks run where they were registered, in registration
//! order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use threadbeam_io::Mutex;

use crate::mailbox::{self, TaskPriority};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

type EventCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// name -> registering thread -> subscription id -> callback. The inner map
/// is ordered by id, which is registration order.
type SubscriberTable<T> = HashMap<String, HashMap<ThreadId, BTreeMap<u64, EventCallback<T>>>>;

struct EventsState<T> {
    persistent: SubscriberTable<T>,
    once: SubscriberTable<T>,
    /// Threads whose death-cleanup hook is already installed.
    hooked_threads: HashSet<ThreadId>,
}

/// Identifies one `on`/`once` call for removal: all names the call covered,
/// jointly.
#[derive(Clone, Debug)]
pub struct EventsHandle {
    names: String,
    thread: ThreadId,
    id: u64,
}

/// A reference-counted, multi-thread event bus for payloads of type `T`.
pub struct Events<T> {
    inner: Arc<Mutex<EventsState<T>>>,
}

impl<T> Clone for Events<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Events<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Events<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventsState {
                persistent: HashMap::new(),
                once: HashMap::new(),
                hooked_threads: HashSet::new(),
            })),
        }
    }

    /// Subscribes `callback` on the calling thread to each whitespace
    /// separated name in `names`. The returned handle removes every one of
    /// those subscriptions at once.
    pub fn on<F>(&self, names: &str, callback: F) -> EventsHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe(names, Arc::new(callback), false)
    }

    /// Like [`Events::on`], but each name's subscription is consumed at its
    /// first delivery.
    pub fn once<F>(&self, names: &str, callback: F) -> EventsHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe(names, Arc::new(callback), true)
    }

    fn subscribe(&self, names: &str, callback: EventCallback<T>, once: bool) -> EventsHandle {
        let mailbox = mailbox::install_current_thread();
        let thread = mailbox.owner();
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let handle = EventsHandle {
            names: names.to_owned(),
            thread,
            id,
        };
        let mut state = self.inner.lock();
        if !state.hooked_threads.contains(&thread) {
            let weak = Arc::downgrade(&self.inner);
            let registered = mailbox.on_close(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let mut state = inner.lock();
                    for per_thread in state.persistent.values_mut() {
                        per_thread.remove(&thread);
                    }
                    for per_thread in state.once.values_mut() {
                        per_thread.remove(&thread);
                    }
                    state.hooked_threads.remove(&thread);
                }
            }));
            if !registered {
                log::warn!("dropping subscription from terminating thread {thread:?}");
                return handle;
            }
            state.hooked_threads.insert(thread);
        }
        let table = if once {
            &mut state.once
        } else {
            &mut state.persistent
        };
        for name in names.split_whitespace() {
            table
                .entry(name.to_owned())
                .or_default()
                .entry(thread)
                .or_default()
                .insert(id, callback.clone());
        }
        handle
    }

    /// Removes the exact subscriptions created by the `on`/`once` call that
    /// produced `handle`.
    pub fn off(&self, handle: &EventsHandle) {
        let mut state = self.inner.lock();
        for name in handle.names.split_whitespace() {
            remove_subscription(&mut state.persistent, name, handle.thread, handle.id);
            remove_subscription(&mut state.once, name, handle.thread, handle.id);
        }
    }

    /// Removes every subscriber (persistent and once, on every thread) of
    /// each listed event name.
    pub fn off_event(&self, names: &str) {
        let mut state = self.inner.lock();
        for name in names.split_whitespace() {
            state.persistent.remove(name);
            state.once.remove(name);
        }
    }

    /// Removes every subscription on the bus.
    pub fn off_all(&self) {
        let mut state = self.inner.lock();
        state.persistent.clear();
        state.once.clear();
    }

    /// Fires each whitespace separated name in `names` with a snapshot of
    /// `payload`.
    ///
    /// For every subscriber thread, the persistent callbacks are captured as
    /// an immutable snapshot under the bus lock (a concurrent `off` cannot
    /// retract an already-triggered delivery) and posted as one closure; the
    /// once callbacks for that thread are taken out of the table entirely
    /// and posted as a second closure, so they cannot fire twice even when
    /// triggers race from several threads.
    pub fn trigger(&self, names: &str, payload: T) {
        let mut state = self.inner.lock();
        for name in names.split_whitespace() {
            if let Some(per_thread) = state.persistent.get(name) {
                for (thread, subscribers) in per_thread {
                    let target = match mailbox::get(*thread) {
                        Some(target) => target,
                        None => continue,
                    };
                    let callbacks: Vec<EventCallback<T>> =
                        subscribers.values().cloned().collect();
                    let snapshot = payload.clone();
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
            let mut name_is_drained = false;
            if let Some(per_thread) = state.once.get_mut(name) {
                let threads: Vec<ThreadId> = per_thread.keys().copied().collect();
                for thread in threads {
                    let subscribers = match per_thread.remove(&thread) {
                        Some(subscribers) => subscribers,
                        None => continue,
                    };
                    let target = match mailbox::get(thread) {
                        Some(target) => target,
                        None => continue,
                    };
                    let snapshot = payload.clone();
                    let keep_alive = self.clone();
                    target.post(
                        TaskPriority::Normal,
                        Box::new(move || {
                            for callback in subscribers.values() {
                                callback(&snapshot);
                            }
                            drop(keep_alive);
                        }),
                    );
                }
                name_is_drained = per_thread.is_empty();
            }
            if name_is_drained {
                state.once.remove(name);
            }
        }
    }
}

fn remove_subscription<T>(
    table: &mut SubscriberTable<T>,
    name: &str,
    thread: ThreadId,
    id: u64,
) {
    let mut drop_name = false;
    if let Some(per_thread) = table.get_mut(name) {
        let mut drop_thread = false;
        if let Some(subscribers) = per_thread.get_mut(&thread) {
            subscribers.remove(&id);
            drop_thread = subscribers.is_empty();
        }
        if drop_thread {
            per_thread.remove(&thread);
        }
        drop_name = per_thread.is_empty();
    }
    if drop_name {
        table.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::mailbox::process_queued;

    fn setup_log() {
        std::env::set_var("RUST_LOG", "error,warn,info");
        let _ = env_logger::try_init();
    }

    #[test]
    fn trigger_delivers_in_registration_order() {
        setup_log();
        let events = Events::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in ["a", "b", "c"] {
            let order = order.clone();
            events.on("tick", move |value| order.lock().push((label, *value)));
        }
        events.trigger("tick", 7);
        process_queued();
        assert_eq!(*order.lock(), vec![("a", 7), ("b", 7), ("c", 7)]);
    }

    #[test]
    fn multiple_names_in_one_subscription() {
        setup_log();
        let events = Events::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = events.on("started stopped", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        events.trigger("started", ());
        events.trigger("stopped", ());
        process_queued();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        // the handle removes both names at once
        events.off(&handle);
        events.trigger("started stopped", ());
        process_queued();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_is_consumed_at_first_delivery() {
        setup_log();
        let events = Events::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        events.once("x", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        events.trigger("x", 1);
        events.trigger("x", 2);
        process_queued();
        events.trigger("x", 3);
        process_queued();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_under_two_names_fires_once_per_name() {
        setup_log();
        let events = Events::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        events.once("first second", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        events.trigger("first", ());
        events.trigger("first", ());
        events.trigger("second", ());
        process_queued();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn once_fires_at_most_once_under_racing_triggers() {
        setup_log();
        let events = Events::<u32>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        events.once("race", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut triggers = Vec::new();
        for value in 0..4 {
            let events = events.clone();
            triggers.push(std::thread::spawn(move || events.trigger("race", value)));
        }
        for trigger in triggers {
            trigger.join().unwrap();
        }
        process_queued();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_event_removes_all_subscribers_of_that_name() {
        setup_log();
        let events = Events::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = count.clone();
            events.on("gone", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        let counter = count.clone();
        events.on("kept", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        events.off_event("gone");
        events.trigger("gone kept", ());
        process_queued();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_all_clears_everything() {
        setup_log();
        let events = Events::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        events.on("a", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = count.clone();
        events.once("b", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        events.off_all();
        events.trigger("a b", ());
        process_queued();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn off_after_trigger_does_not_retract_the_delivery() {
        setup_log();
        let events = Events::<()>::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = events.on("snapshot", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        events.trigger("snapshot", ());
        // removal races the posted delivery and must lose to the snapshot
        events.off(&handle);
        process_queued();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
