//! Exclusive and recursive mutexes over the parking_lot raw primitives.
//!
//! These carry no data payload: they guard state that lives elsewhere (the
//! StackGuard thread state, process-wide counters). That is why they wrap
//! `RawMutex` rather than `parking_lot::Mutex<T>` — the locked region is a
//! protocol, not a value.

use parking_lot::lock_api::{RawMutex as _, RawReentrantMutex};
use parking_lot::{RawMutex, RawThreadId};

#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicI32, Ordering};

/// A synchronization primitive offering exclusive, non-recursive ownership:
///
/// - A thread owns the mutex from a successful `lock()` or `try_lock()` until
///   it calls `unlock()`.
/// - While owned, other threads block in `lock()` or get `false` from
///   `try_lock()`.
///
/// A thread must not already own the mutex when calling `lock()` or
/// `try_lock()`; dropping an owned mutex is likewise the caller's bug. Debug
/// builds track an ownership level and assert it transitions 0↔1; release
/// builds carry no bookkeeping.
pub struct Mutex {
    raw: RawMutex,
    #[cfg(debug_assertions)]
    level: AtomicI32,
}

impl Mutex {
    /// Create an unlocked mutex. `const` so statics need no runtime init.
    pub const fn new() -> Self {
        Self {
            raw: RawMutex::INIT,
            #[cfg(debug_assertions)]
            level: AtomicI32::new(0),
        }
    }

    /// Block until exclusive ownership is acquired.
    ///
    /// May block indefinitely; there is no built-in timeout. Re-locking from
    /// the owning thread deadlocks.
    pub fn lock(&self) {
        self.raw.lock();
        self.assert_unheld_and_mark();
    }

    /// Non-blocking acquire. Returns whether ownership was taken.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        if self.raw.try_lock() {
            self.assert_unheld_and_mark();
            true
        } else {
            false
        }
    }

    /// Release the mutex.
    ///
    /// # Safety
    ///
    /// The calling thread must currently own the mutex. Prefer [`LockGuard`],
    /// which upholds this by construction.
    pub unsafe fn unlock(&self) {
        self.assert_held_and_unmark();
        // SAFETY: ownership is the caller's contract, checked above in debug.
        unsafe { self.raw.unlock() }
    }

    #[inline]
    fn assert_unheld_and_mark(&self) {
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(0, self.level.load(Ordering::Relaxed));
            self.level.store(1, Ordering::Relaxed);
        }
    }

    #[inline]
    fn assert_held_and_unmark(&self) {
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(1, self.level.load(Ordering::Relaxed));
            self.level.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// A synchronization primitive offering exclusive, recursive ownership: the
/// owning thread may call `lock()`/`try_lock()` repeatedly and releases
/// ownership only after a matching number of `unlock()` calls. Other threads
/// block (or fail `try_lock()`) for the whole ownership period.
pub struct RecursiveMutex {
    raw: RawReentrantMutex<RawMutex, RawThreadId>,
    #[cfg(debug_assertions)]
    level: AtomicI32,
}

impl RecursiveMutex {
    /// Create an unlocked recursive mutex.
    pub const fn new() -> Self {
        Self {
            raw: RawReentrantMutex::INIT,
            #[cfg(debug_assertions)]
            level: AtomicI32::new(0),
        }
    }

    /// Acquire the mutex, blocking if another thread owns it. Nesting by the
    /// owner is permitted.
    pub fn lock(&self) {
        self.raw.lock();
        #[cfg(debug_assertions)]
        {
            debug_assert!(self.level.load(Ordering::Relaxed) >= 0);
            self.level.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Non-blocking acquire. Succeeds when the mutex is free or already owned
    /// by the calling thread.
    #[must_use]
    pub fn try_lock(&self) -> bool {
        if self.raw.try_lock() {
            #[cfg(debug_assertions)]
            {
                debug_assert!(self.level.load(Ordering::Relaxed) >= 0);
                self.level.fetch_add(1, Ordering::Relaxed);
            }
            true
        } else {
            false
        }
    }

    /// Drop one level of ownership; the mutex is released when the level
    /// reaches zero.
    ///
    /// # Safety
    ///
    /// The calling thread must currently own the mutex.
    pub unsafe fn unlock(&self) {
        #[cfg(debug_assertions)]
        {
            debug_assert!(self.level.load(Ordering::Relaxed) > 0);
            self.level.fetch_sub(1, Ordering::Relaxed);
        }
        // SAFETY: ownership is the caller's contract, checked above in debug.
        unsafe { self.raw.unlock() }
    }
}

impl Default for RecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive-lock capability shared by [`Mutex`] and [`RecursiveMutex`] so
/// [`LockGuard`] can bind to either.
pub trait Lockable {
    /// Block until the lock is acquired.
    fn lock(&self);

    /// Non-blocking acquire; returns whether the lock was taken.
    fn try_lock(&self) -> bool;

    /// Release one level of ownership.
    ///
    /// # Safety
    ///
    /// The calling thread must currently own the lock.
    unsafe fn unlock(&self);
}

impl Lockable for Mutex {
    fn lock(&self) {
        Mutex::lock(self)
    }

    fn try_lock(&self) -> bool {
        Mutex::try_lock(self)
    }

    unsafe fn unlock(&self) {
        // SAFETY: forwarded contract.
        unsafe { Mutex::unlock(self) }
    }
}

impl Lockable for RecursiveMutex {
    fn lock(&self) {
        RecursiveMutex::lock(self)
    }

    fn try_lock(&self) -> bool {
        RecursiveMutex::try_lock(self)
    }

    unsafe fn unlock(&self) {
        // SAFETY: forwarded contract.
        unsafe { RecursiveMutex::unlock(self) }
    }
}

/// RAII wrapper owning a mutex for the duration of a scope.
///
/// Acquires on construction, releases exactly once on drop — including early
/// return and panic unwind. Non-copyable; this is the only sanctioned way
/// application code holds a [`Mutex`] or [`RecursiveMutex`].
pub struct LockGuard<'a, M: Lockable> {
    mutex: &'a M,
}

impl<'a, M: Lockable> LockGuard<'a, M> {
    /// Acquire `mutex` and bind its release to the guard's lifetime.
    pub fn new(mutex: &'a M) -> Self {
        mutex.lock();
        Self { mutex }
    }
}

impl<M: Lockable> Drop for LockGuard<'_, M> {
    fn drop(&mut self) {
        // SAFETY: the guard acquired the lock in `new` and releases it here
        // exactly once.
        unsafe { self.mutex.unlock() }
    }
}
