//! Lazily constructed process-wide singletons.
//!
//! `static` items in Rust run no constructors, so a lazily initialized
//! instance sidesteps static-initialization-order problems by definition:
//! construction happens on first access, guarded by a one-time-init
//! primitive, and is race-free when many threads touch the instance for the
//! first time concurrently.

use once_cell::sync::OnceCell;

use crate::mutex::{Mutex, RecursiveMutex};

/// A process-wide singleton of `T`, default-constructed exactly once on
/// first access.
///
/// ```
/// use marten_sync::{LazyMutex, LockGuard};
///
/// static MY_MUTEX: LazyMutex = LazyMutex::new();
///
/// fn my_function() {
///     let _guard = LockGuard::new(MY_MUTEX.get());
///     // Do something.
/// }
/// ```
pub struct LazyInstance<T> {
    cell: OnceCell<T>,
}

impl<T: Default> LazyInstance<T> {
    /// Create an empty slot. `const`, so usable as a `static` initializer.
    pub const fn new() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }

    /// Return the instance, default-constructing it on first call.
    ///
    /// Safe to race from multiple threads: exactly one construction happens
    /// and every caller observes the same instance.
    pub fn get(&self) -> &T {
        self.cell.get_or_init(T::default)
    }
}

impl<T: Default> Default for LazyInstance<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`Mutex`] initialized lazily on first `get()`.
pub type LazyMutex = LazyInstance<Mutex>;

/// A [`RecursiveMutex`] initialized lazily on first `get()`.
pub type LazyRecursiveMutex = LazyInstance<RecursiveMutex>;
