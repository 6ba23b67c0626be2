//! Combinators over one or more deferreds.

pub mod wait;
pub mod when;

pub use wait::wait_all;
pub use when::when;

use crate::sync::deferred::{Deferred, PromiseState};

/// The type-erased face of a deferred: zero-argument settlement
/// registration plus a state probe.
///
/// Combinators count settlements and pick rejection winners without caring
/// about each member's payload type, so a heterogeneous group of deferreds
/// can feed one combinator through this trait.
pub trait DeferredLike: Send {
    fn state(&self) -> PromiseState;
    /// Registers a callback for resolution, fired with no arguments on the
    /// calling thread.
    fn done_zero(&self, callback: Box<dyn FnOnce() + Send>);
    /// Registers a callback for rejection, fired with no arguments on the
    /// calling thread. Fires for payload-less rejections too.
    fn fail_zero(&self, callback: Box<dyn FnOnce() + Send>);
}

impl<T: Clone + Send + 'static> DeferredLike for Deferred<T> {
    fn state(&self) -> PromiseState {
        Deferred::state(self)
    }

    fn done_zero(&self, callback: Box<dyn FnOnce() + Send>) {
        Deferred::done_zero(self, callback)
    }

    fn fail_zero(&self, callback: Box<dyn FnOnce() + Send>) {
        Deferred::fail_zero(self, callback)
    }
}

impl DeferredLike for Box<dyn DeferredLike> {
    fn state(&self) -> PromiseState {
        (**self).state()
    }

    fn done_zero(&self, callback: Box<dyn FnOnce() + Send>) {
        (**self).done_zero(callback)
    }

    fn fail_zero(&self, callback: Box<dyn FnOnce() + Send>) {
        (**self).fail_zero(callback)
    }
}

/// Combines deferreds of differing payload types into one [`when`] call by
/// boxing a clone of each handle.
#[macro_export]
macro_rules! when {
    ($($deferred:expr),+ $(,)?) => {
        $crate::when(vec![
            $(::std::boxed::Box::new(::core::clone::Clone::clone(&$deferred))
                as ::std::boxed::Box<dyn $crate::DeferredLike>),+
        ])
    };
}
