//! A single object hosting one event bus per payload type.
//!
//! Pure composition over [`Events`]: the typed `on`/`once`/`trigger` API is
//! reached through a type-indexed lookup-or-create, while the lifecycle
//! operations (`off` in its three shapes) work polymorphically across every
//! hosted bus through a small trait object.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use threadbeam_io::Mutex;

use crate::sync::events::{Events, EventsHandle};

/// The lifecycle face of a typed event bus, the only part the [`Eventer`]
/// needs polymorphically.
pub trait BusLifecycle: Send + Sync {
    fn off(&self, handle: &EventsHandle);
    fn off_event(&self, names: &str);
    fn off_all(&self);
    fn as_any(&self) -> &dyn Any;
}

impl<T: Clone + Send + 'static> BusLifecycle for Events<T> {
    fn off(&self, handle: &EventsHandle) {
        Events::off(self, handle)
    }

    fn off_event(&self, names: &str) {
        Events::off_event(self, names)
    }

    fn off_all(&self) {
        Events::off_all(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hosts one [`Events`] bus per payload type, created on first use.
#[derive(Default)]
pub struct Eventer {
    buses: Mutex<HashMap<TypeId, Arc<dyn BusLifecycle>>>,
}

impl Eventer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bus carrying payloads of type `T`, created on first use. The
    /// returned handle shares state with the hosted bus.
    pub fn bus<T: Clone + Send + 'static>(&self) -> Events<T> {
        let mut buses = self.buses.lock();
        let entry = buses
            .entry(TypeId::of::<Events<T>>())
            .or_insert_with(|| Arc::new(Events::<T>::new()));
        match entry.as_any().downcast_ref::<Events<T>>() {
            Some(bus) => bus.clone(),
            None => {
                debug_assert!(false, "type-indexed bus registry out of sync");
                Events::new()
            }
        }
    }

    pub fn on<T, F>(&self, names: &str, callback: F) -> EventsHandle
    where
        T: Clone + Send + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.bus::<T>().on(names, callback)
    }

    pub fn once<T, F>(&self, names: &str, callback: F) -> EventsHandle
    where
        T: Clone + Send + 'static,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.bus::<T>().once(names, callback)
    }

    pub fn trigger<T: Clone + Send + 'static>(&self, names: &str, payload: T) {
        self.bus::<T>().trigger(names, payload)
    }

    /// Removes the subscriptions behind `handle`, whichever typed bus they
    /// live on. Subscription ids are process-wide, so this touches at most
    /// one bus in practice.
    pub fn off(&self, handle: &EventsHandle) {
        for bus in self.buses.lock().values() {
            bus.off(handle);
        }
    }

    /// Removes all subscribers of each listed name on every hosted bus.
    pub fn off_event(&self, names: &str) {
        for bus in self.buses.lock().values() {
            bus.off_event(names);
        }
    }

    /// Clears every hosted bus.
    pub fn off_all(&self) {
        for bus in self.buses.lock().values() {
            bus.off_all();
        }
    }
}
