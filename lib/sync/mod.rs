//! Synchronization primitives.
//!
//! Shims between loom and std synchronization primitives so the
//! concurrency-heavy parts of the crate can be model-checked.

pub mod atomic;

#[cfg(loom)]
pub use loom::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
#[cfg(loom)]
pub use std::sync::OnceLock;

#[cfg(not(loom))]
pub use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, RwLock, Weak};

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// Poisoning is not part of this crate's error taxonomy; the protected
/// structures are left in whatever state the panicking holder produced.
#[cfg(not(loom))]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(loom)]
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// Block on a condvar, recovering the guard on poisoning like [`lock`].
#[cfg(not(loom))]
pub fn wait<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cv.wait(guard).unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(loom)]
pub fn wait<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cv.wait(guard).unwrap()
}
