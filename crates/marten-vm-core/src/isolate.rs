//! VM isolate surface for the interrupt core.
//!
//! An `Isolate` is the unit of thread confinement: `Send` but not `Sync`, it
//! may move between threads but only one thread runs it at a time (enforced
//! by `&mut self` on `enter()`). Cross-thread operations — interrupt,
//! terminate, GC request — go through the `Send + Sync` [`IsolateHandle`],
//! which routes them into the shared [`StackGuard`] bitset rather than into
//! the running thread's state.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use marten_sync::{LazyMutex, LockGuard};

use crate::stack_guard::StackGuard;

/// Configuration for creating a new [`Isolate`].
#[derive(Debug, Clone)]
pub struct IsolateConfig {
    /// Stack headroom reserved below the entry point of the thread that
    /// enters the isolate; the real stack limits are derived from it.
    pub stack_size: usize,
}

impl Default for IsolateConfig {
    fn default() -> Self {
        Self {
            stack_size: 1024 * 1024, // 1 MiB
        }
    }
}

fn next_isolate_id() -> u64 {
    static ID_MUTEX: LazyMutex = LazyMutex::new();
    // Atomic only so the static is Sync; mutation is serialized by the lazy
    // mutex above, initialized race-free on first use.
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);

    let _guard = LockGuard::new(ID_MUTEX.get());
    let id = NEXT_ID.load(Ordering::Relaxed);
    NEXT_ID.store(id + 1, Ordering::Relaxed);
    id
}

/// A VM instance, reduced here to its interrupt core: the stack guard plus
/// entry bookkeeping.
pub struct Isolate {
    id: u64,
    config: IsolateConfig,
    stack_guard: Arc<StackGuard>,
    /// Whether the isolate is currently entered (on some thread).
    entered: bool,
    /// Send but intentionally not Sync.
    _not_sync: PhantomData<Cell<()>>,
}

impl Isolate {
    /// Create a new isolate. It is not entered — call
    /// [`enter`](Self::enter) before executing on it.
    pub fn new(config: IsolateConfig) -> Self {
        Self {
            id: next_isolate_id(),
            config,
            stack_guard: Arc::new(StackGuard::new()),
            entered: false,
            _not_sync: PhantomData,
        }
    }

    /// Process-unique isolate id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Enter the isolate on the current thread: initializes the stack-guard
    /// thread slot (idempotent) and returns a guard that re-arms `enter` on
    /// drop.
    ///
    /// # Panics
    ///
    /// Panics if the isolate is already entered.
    pub fn enter(&mut self) -> IsolateGuard<'_> {
        assert!(
            !self.entered,
            "Isolate::enter() called while already entered"
        );
        self.entered = true;
        self.stack_guard.init_thread(self.config.stack_size);
        IsolateGuard { isolate: self }
    }

    /// The isolate's stack guard.
    pub fn stack_guard(&self) -> &StackGuard {
        &self.stack_guard
    }

    /// Get a thread-safe handle for cross-thread interrupt operations.
    pub fn handle(&self) -> IsolateHandle {
        IsolateHandle {
            stack_guard: Arc::clone(&self.stack_guard),
        }
    }
}

/// RAII guard for an entered isolate.
pub struct IsolateGuard<'a> {
    isolate: &'a mut Isolate,
}

impl IsolateGuard<'_> {
    /// The isolate's stack guard.
    pub fn stack_guard(&self) -> &StackGuard {
        &self.isolate.stack_guard
    }
}

impl Drop for IsolateGuard<'_> {
    fn drop(&mut self) {
        self.isolate.entered = false;
    }
}

/// Thread-safe handle to an [`Isolate`].
///
/// Cloneable and `Send + Sync`; any thread may use it to request interrupts
/// of the running computation.
#[derive(Clone)]
pub struct IsolateHandle {
    stack_guard: Arc<StackGuard>,
}

impl IsolateHandle {
    /// Request a cooperative (stack-check) interrupt. Non-blocking; serviced
    /// at the computation's next entry check.
    pub fn interrupt(&self) {
        self.stack_guard.interrupt();
    }

    /// Request termination of the running computation. The request stays
    /// pending until [`cancel_terminate_execution`](Self::cancel_terminate_execution).
    pub fn terminate_execution(&self) {
        self.stack_guard.terminate_execution();
    }

    /// Withdraw a pending termination request.
    pub fn cancel_terminate_execution(&self) {
        self.stack_guard.cancel_terminate_execution();
    }

    /// Request a garbage collection at the next entry check.
    pub fn request_gc(&self) {
        self.stack_guard.request_gc();
    }

    /// Whether termination has been requested and not yet cancelled.
    pub fn is_execution_terminating(&self) -> bool {
        self.stack_guard.is_terminate_execution()
    }

    /// Whether a cooperative interrupt is pending.
    pub fn is_interrupted(&self) -> bool {
        self.stack_guard.is_interrupted()
    }
}
