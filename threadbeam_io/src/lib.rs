//! Locking primitives for the threadbeam crates.
//!
//! Everything here is a thin alias over parking_lot. The aliases exist so the
//! rest of the workspace names one set of lock types, and so the
//! `deadlock-detection` feature can be switched on in one place when chasing
//! lock-order bugs across the mailbox registry and promise state locks.

/// A mutual exclusion primitive protecting shared engine state.
/// Re-exported from parking_lot; unlike the std mutex it cannot be poisoned.
pub type Mutex<T> = parking_lot::Mutex<T>;

/// RAII guard for a [`Mutex`]. The lock is released when the guard drops.
pub type MutexGuard<'a, T> = parking_lot::MutexGuard<'a, T>;

/// A reader-writer lock, allowing multiple readers or a single writer.
pub type RwLock<T> = parking_lot::RwLock<T>;

/// RAII guard for read access to an [`RwLock`].
pub type RwLockReadGuard<'a, T> = parking_lot::RwLockReadGuard<'a, T>;

/// RAII guard for write access to an [`RwLock`].
pub type RwLockWriteGuard<'a, T> = parking_lot::RwLockWriteGuard<'a, T>;

/// A condition variable for parking a thread until its mailbox has work.
pub type Condvar = parking_lot::Condvar;

pub use parking_lot::{const_mutex, const_rwlock, WaitTimeoutResult};

#[cfg(feature = "deadlock-detection")]
pub use parking_lot::deadlock;
