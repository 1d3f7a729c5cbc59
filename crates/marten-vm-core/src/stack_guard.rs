//! Stack-guard interrupt state machine.
//!
//! The VM checks, on every function entry, whether its stack pointer has
//! crossed a limit word. The `StackGuard` reuses that single check as the
//! interrupt delivery point: when an interrupt is requested, the *effective*
//! limit is lowered to a poison value so the next entry check trips and
//! control reaches the slow dispatch path, which services pending flags and
//! restores the real limit.
//!
//! # Thread Safety Model
//!
//! - The entry-check reads (`jslimit()`/`climit()`) are lock-free relaxed
//!   loads of a single word. They may observe a stale value; at worst that
//!   costs one extra harmless trip through the slow path.
//! - Every mutation of the flag bitset, the postponement counter, and the
//!   limit words happens under the guard's internal [`Mutex`], witnessed by
//!   an [`ExecutionAccess`] token.
//! - The registered API callback slot is only touched while the lock is
//!   held.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::mem;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use marten_sync::{LockGuard, Mutex};
use tracing::{debug, trace};

/// Poison limit: compares as "exceeded" against any stack position, forcing
/// the entry check to fail while an interrupt is pending.
#[cfg(target_pointer_width = "64")]
pub const INTERRUPT_LIMIT: usize = 0xffff_ffff_ffff_fffe;
/// Sentinel marking an uninitialized/cleared thread slot. Never a valid
/// stack boundary.
#[cfg(target_pointer_width = "64")]
pub const ILLEGAL_LIMIT: usize = 0xffff_ffff_ffff_fff8;

/// Poison limit (32-bit targets).
#[cfg(target_pointer_width = "32")]
pub const INTERRUPT_LIMIT: usize = 0xffff_fffe;
/// Uninitialized-slot sentinel (32-bit targets).
#[cfg(target_pointer_width = "32")]
pub const ILLEGAL_LIMIT: usize = 0xffff_fff8;

const WORD: usize = mem::size_of::<usize>();

/// Bytes needed to archive one thread's stack-guard state: four limit words,
/// three 32-bit counters/bitsets, and the callback function/data words.
pub const ARCHIVE_SPACE_PER_THREAD: usize = 6 * WORD + 3 * 4;

/// Decoded view of a limit word. The sentinels stay single-word encodable so
/// the hot-path check remains one unsynchronized load, but call sites reason
/// about the state by name instead of magic constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitState {
    /// A real stack boundary: the stack must not grow below this address.
    Normal(usize),
    /// Poisoned: an interrupt is pending and the next entry check must trip.
    InterruptPending,
    /// The thread slot has not been initialized (or was cleared).
    Uninitialized,
}

impl LimitState {
    /// Decode a limit word read from the guard.
    pub const fn decode(word: usize) -> Self {
        match word {
            INTERRUPT_LIMIT => LimitState::InterruptPending,
            ILLEGAL_LIMIT => LimitState::Uninitialized,
            addr => LimitState::Normal(addr),
        }
    }

    /// Encode back to the single-word hot-path representation.
    pub const fn encode(self) -> usize {
        match self {
            LimitState::Normal(addr) => addr,
            LimitState::InterruptPending => INTERRUPT_LIMIT,
            LimitState::Uninitialized => ILLEGAL_LIMIT,
        }
    }
}

/// One bit per interrupt kind. Multiple bits may be pending at once.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptFlag {
    /// Synthetic stack-check interrupt; reported as a stack overflow.
    Interrupt = 1 << 0,
    /// Debugger break request.
    DebugBreak = 1 << 1,
    /// Debugger command pending.
    DebugCommand = 1 << 2,
    /// Preemption request for cooperative scheduling.
    Preempt = 1 << 3,
    /// Terminate the active computation.
    Terminate = 1 << 4,
    /// Garbage collection request.
    GcRequest = 1 << 5,
    /// Deoptimize all optimized code.
    FullDeopt = 1 << 6,
    /// Install pending optimized code.
    InstallCode = 1 << 7,
    /// Externally registered API callback.
    ApiInterrupt = 1 << 8,
    /// Deoptimize code dependent on marked allocation sites.
    DeoptMarkedAllocationSites = 1 << 9,
}

impl InterruptFlag {
    /// The bit this flag occupies in the pending bitset.
    pub const fn bit(self) -> u32 {
        self as u32
    }

    /// Deterministic dispatch order. `Terminate` is the highest-priority,
    /// most time-sensitive flag and is checked first. `Interrupt` is last:
    /// it reports an exceptional condition and would otherwise shadow the
    /// flags behind it. The remaining flags run in ascending bit order.
    pub const DISPATCH_ORDER: [InterruptFlag; 10] = [
        InterruptFlag::Terminate,
        InterruptFlag::DebugBreak,
        InterruptFlag::DebugCommand,
        InterruptFlag::Preempt,
        InterruptFlag::GcRequest,
        InterruptFlag::FullDeopt,
        InterruptFlag::InstallCode,
        InterruptFlag::ApiInterrupt,
        InterruptFlag::DeoptMarkedAllocationSites,
        InterruptFlag::Interrupt,
    ];
}

/// Externally registered interrupt callback: a plain function pointer plus
/// an opaque context word, so it survives the fixed-layout thread archive.
pub type InterruptCallback = fn(data: *mut c_void);

/// Witness that the guard's internal lock is held. Methods that require the
/// lock take a reference to this token; it is only obtainable by locking.
struct ExecutionAccess<'a> {
    _guard: LockGuard<'a, Mutex>,
}

/// Per-thread stack-guard state.
///
/// The stack limit is split into a JS and a C limit (the same on native
/// targets; they differ when JS runs on a simulated stack). Each has two
/// values: the `real_*` field is the actual boundary configured for the VM;
/// the other is the effective boundary consulted by the entry check, equal
/// to the real one except while an interrupt is pending, when it is lowered
/// to [`INTERRUPT_LIMIT`] so entry checks fail.
///
/// Word fields are atomics so the entry check can read them without the
/// lock; all writes still happen under it.
struct ThreadState {
    real_jslimit: AtomicUsize,
    jslimit: AtomicUsize,
    real_climit: AtomicUsize,
    climit: AtomicUsize,

    /// Dispatch re-entrancy depth, for diagnostics only.
    nesting: AtomicI32,
    /// While > 0, requested interrupts are recorded but not delivered.
    postpone_interrupts_nesting: AtomicI32,
    /// Pending interrupt bitset; zero means none pending.
    interrupt_flags: AtomicU32,
}

impl ThreadState {
    const fn cleared() -> Self {
        Self {
            real_jslimit: AtomicUsize::new(ILLEGAL_LIMIT),
            jslimit: AtomicUsize::new(ILLEGAL_LIMIT),
            real_climit: AtomicUsize::new(ILLEGAL_LIMIT),
            climit: AtomicUsize::new(ILLEGAL_LIMIT),
            nesting: AtomicI32::new(0),
            postpone_interrupts_nesting: AtomicI32::new(0),
            interrupt_flags: AtomicU32::new(0),
        }
    }

    fn clear(&self) {
        self.real_jslimit.store(ILLEGAL_LIMIT, Ordering::Relaxed);
        self.jslimit.store(ILLEGAL_LIMIT, Ordering::Relaxed);
        self.real_climit.store(ILLEGAL_LIMIT, Ordering::Relaxed);
        self.climit.store(ILLEGAL_LIMIT, Ordering::Relaxed);
        self.nesting.store(0, Ordering::Relaxed);
        self.postpone_interrupts_nesting.store(0, Ordering::Relaxed);
        self.interrupt_flags.store(0, Ordering::Relaxed);
    }
}

/// Interrupt-flag state machine for one VM instance.
///
/// Any thread may request an interrupt; the thread running the computation
/// observes the poisoned limit at its next entry check and services the
/// pending flags through the dispatch path. One `StackGuard` exists per
/// engine instance and is never shared across instances.
pub struct StackGuard {
    lock: Mutex,
    state: ThreadState,
    /// At most one registered API callback plus its context. Only accessed
    /// while `lock` is held.
    callback: UnsafeCell<Option<(InterruptCallback, *mut c_void)>>,
}

// SAFETY: the callback slot (the only non-Sync field) is read and written
// exclusively under `lock`, so no two threads touch it concurrently. The
// raw context pointer is opaque to the guard; its cross-thread validity is
// the registrant's contract (see `request_interrupt`). Everything else is
// atomics.
unsafe impl Send for StackGuard {}
// SAFETY: as above.
unsafe impl Sync for StackGuard {}

impl StackGuard {
    /// Create a guard with a cleared (uninitialized) thread slot. Call
    /// [`init_thread`](Self::init_thread) or
    /// [`set_stack_limit`](Self::set_stack_limit) before relying on the
    /// entry check.
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(),
            state: ThreadState::cleared(),
            callback: UnsafeCell::new(None),
        }
    }

    fn access(&self) -> ExecutionAccess<'_> {
        ExecutionAccess {
            _guard: LockGuard::new(&self.lock),
        }
    }

    // ---------------------------------------------------------------------
    // Hot-path accessors: single-word relaxed reads, no lock.

    /// Effective JS stack limit consulted by the entry check.
    #[inline]
    pub fn jslimit(&self) -> usize {
        self.state.jslimit.load(Ordering::Relaxed)
    }

    /// Effective C stack limit consulted by the entry check.
    #[inline]
    pub fn climit(&self) -> usize {
        self.state.climit.load(Ordering::Relaxed)
    }

    /// Real (configured) JS stack limit, independent of pending interrupts.
    #[inline]
    pub fn real_jslimit(&self) -> usize {
        self.state.real_jslimit.load(Ordering::Relaxed)
    }

    /// Real (configured) C stack limit, independent of pending interrupts.
    #[inline]
    pub fn real_climit(&self) -> usize {
        self.state.real_climit.load(Ordering::Relaxed)
    }

    // ---------------------------------------------------------------------
    // Limit configuration.

    /// Set the real stack boundary. The stack is assumed to grow downward;
    /// execution must not cross `limit`. If no interrupt is pending the
    /// effective boundary is updated as well; a poisoned boundary is left
    /// poisoned so delivery is not lost.
    pub fn set_stack_limit(&self, limit: usize) {
        debug_assert!(limit != INTERRUPT_LIMIT && limit != ILLEGAL_LIMIT);
        let _access = self.access();
        // Mirror into the effective limits only when they currently equal
        // the real ones (i.e. not poisoned).
        if self.state.jslimit.load(Ordering::Relaxed) == self.state.real_jslimit.load(Ordering::Relaxed)
        {
            self.state.jslimit.store(limit, Ordering::Relaxed);
        }
        if self.state.climit.load(Ordering::Relaxed) == self.state.real_climit.load(Ordering::Relaxed)
        {
            self.state.climit.store(limit, Ordering::Relaxed);
        }
        self.state.real_jslimit.store(limit, Ordering::Relaxed);
        self.state.real_climit.store(limit, Ordering::Relaxed);
    }

    /// True when the stack has genuinely crossed the real boundary,
    /// independent of the interrupt bitset. The dispatch path uses this to
    /// distinguish a real overflow from a synthetic trip caused by a
    /// pending interrupt.
    pub fn is_stack_overflow(&self, stack_position: usize) -> bool {
        let _access = self.access();
        match LimitState::decode(self.state.real_climit.load(Ordering::Relaxed)) {
            LimitState::Normal(limit) => stack_position < limit,
            // No real limit configured: nothing to overflow.
            LimitState::InterruptPending | LimitState::Uninitialized => false,
        }
    }

    // ---------------------------------------------------------------------
    // Interrupt requests. Each ORs its bit into the pending set and, unless
    // postponed, poisons the effective limits. Re-requesting a set flag is
    // a no-op beyond the OR.

    fn request(&self, flag: InterruptFlag) {
        let access = self.access();
        self.state.interrupt_flags.fetch_or(flag.bit(), Ordering::Relaxed);
        if !self.should_postpone(&access) {
            self.set_interrupt_limits(&access);
        }
        trace!(?flag, "interrupt requested");
    }

    /// Request the synthetic stack-check interrupt.
    pub fn interrupt(&self) {
        self.request(InterruptFlag::Interrupt);
    }

    /// Request preemption of the running computation.
    pub fn preempt(&self) {
        self.request(InterruptFlag::Preempt);
    }

    /// Request a garbage collection at the next entry check.
    pub fn request_gc(&self) {
        self.request(InterruptFlag::GcRequest);
    }

    /// Request installation of pending optimized code.
    pub fn request_install_code(&self) {
        self.request(InterruptFlag::InstallCode);
    }

    /// Request deoptimization of all optimized code.
    pub fn full_deopt(&self) {
        self.request(InterruptFlag::FullDeopt);
    }

    /// Request deoptimization of code dependent on marked allocation sites.
    pub fn deopt_marked_allocation_sites(&self) {
        self.request(InterruptFlag::DeoptMarkedAllocationSites);
    }

    /// Request a debugger break.
    pub fn debug_break(&self) {
        self.request(InterruptFlag::DebugBreak);
    }

    /// Signal a pending debugger command.
    pub fn debug_command(&self) {
        self.request(InterruptFlag::DebugCommand);
    }

    /// Request termination of the active computation. Settable from any
    /// thread; does not allocate. The request stays pending — and entry
    /// checks keep tripping — until
    /// [`cancel_terminate_execution`](Self::cancel_terminate_execution).
    pub fn terminate_execution(&self) {
        debug!("termination requested");
        self.request(InterruptFlag::Terminate);
    }

    /// Withdraw a pending termination request and, if nothing else is
    /// pending, restore the real limits.
    pub fn cancel_terminate_execution(&self) {
        self.continue_interrupt(InterruptFlag::Terminate);
    }

    // ---------------------------------------------------------------------
    // Queries. Each reads its bit under the lock without clearing it.

    /// Whether `flag` is pending.
    pub fn is_interrupt_requested(&self, flag: InterruptFlag) -> bool {
        let _access = self.access();
        self.state.interrupt_flags.load(Ordering::Relaxed) & flag.bit() != 0
    }

    /// Whether the synthetic stack-check interrupt is pending.
    pub fn is_interrupted(&self) -> bool {
        self.is_interrupt_requested(InterruptFlag::Interrupt)
    }

    /// Whether preemption is pending.
    pub fn is_preempted(&self) -> bool {
        self.is_interrupt_requested(InterruptFlag::Preempt)
    }

    /// Whether termination of the active computation is pending.
    pub fn is_terminate_execution(&self) -> bool {
        self.is_interrupt_requested(InterruptFlag::Terminate)
    }

    /// Whether a GC request is pending.
    pub fn is_gc_requested(&self) -> bool {
        self.is_interrupt_requested(InterruptFlag::GcRequest)
    }

    /// Whether a code-installation request is pending.
    pub fn is_install_code_requested(&self) -> bool {
        self.is_interrupt_requested(InterruptFlag::InstallCode)
    }

    /// Whether a full deoptimization is pending.
    pub fn is_full_deopt_requested(&self) -> bool {
        self.is_interrupt_requested(InterruptFlag::FullDeopt)
    }

    /// Whether deoptimization of marked allocation sites is pending.
    pub fn is_deopt_marked_allocation_sites(&self) -> bool {
        self.is_interrupt_requested(InterruptFlag::DeoptMarkedAllocationSites)
    }

    /// Whether a debugger break is pending.
    pub fn is_debug_break(&self) -> bool {
        self.is_interrupt_requested(InterruptFlag::DebugBreak)
    }

    /// Whether a debugger command is pending.
    pub fn is_debug_command(&self) -> bool {
        self.is_interrupt_requested(InterruptFlag::DebugCommand)
    }

    /// Whether an API callback is pending.
    pub fn is_api_interrupt(&self) -> bool {
        self.is_interrupt_requested(InterruptFlag::ApiInterrupt)
    }

    // ---------------------------------------------------------------------
    // Interrupt completion.

    /// Clear exactly one pending bit after its handler ran. When the bitset
    /// reaches zero (and delivery is not postponed) the effective limits
    /// are restored to the real ones. This is the sole path by which the
    /// poisoned state is undone; a handler that fails to call it leaves
    /// every entry check tripping.
    pub fn continue_interrupt(&self, flag: InterruptFlag) {
        let access = self.access();
        self.state.interrupt_flags.fetch_and(!flag.bit(), Ordering::Relaxed);
        if !self.should_postpone(&access) && !self.has_pending_interrupts(&access) {
            self.reset_limits(&access);
        }
        trace!(?flag, "interrupt continued");
    }

    // ---------------------------------------------------------------------
    // API callback.

    /// Register `callback` plus its opaque context and mark the API
    /// interrupt pending. At most one callback is registered at a time; a
    /// second call before the first fires overwrites it (last-writer-wins),
    /// a documented race that multiple registrants must exclude externally.
    ///
    /// `data` is passed back verbatim when the callback fires. It may be
    /// dereferenced on whichever thread services the interrupt, so it must
    /// remain valid (and be safe to use from that thread) until the
    /// callback runs or is cleared.
    pub fn request_interrupt(&self, callback: InterruptCallback, data: *mut c_void) {
        let access = self.access();
        // SAFETY: lock held; sole access to the slot.
        unsafe {
            *self.callback.get() = Some((callback, data));
        }
        self.state
            .interrupt_flags
            .fetch_or(InterruptFlag::ApiInterrupt.bit(), Ordering::Relaxed);
        if !self.should_postpone(&access) {
            self.set_interrupt_limits(&access);
        }
    }

    /// Drop the registered callback and its pending bit without firing it.
    pub fn clear_api_interrupt(&self) {
        {
            let _access = self.access();
            // SAFETY: lock held; sole access to the slot.
            unsafe {
                *self.callback.get() = None;
            }
        }
        self.continue_interrupt(InterruptFlag::ApiInterrupt);
    }

    /// Fire the registered callback (outside the lock), then clear the API
    /// interrupt bit. Called by the dispatch path when the bit is seen.
    pub fn invoke_interrupt_callback(&self) {
        let registered = {
            let _access = self.access();
            // SAFETY: lock held; sole access to the slot.
            unsafe { (*self.callback.get()).take() }
        };
        if let Some((callback, data)) = registered {
            callback(data);
        }
        self.continue_interrupt(InterruptFlag::ApiInterrupt);
    }

    // ---------------------------------------------------------------------
    // Postponement.

    /// Whether interrupt delivery is currently suppressed by a
    /// [`PostponeInterruptsScope`].
    pub fn should_postpone_interrupts(&self) -> bool {
        let access = self.access();
        self.should_postpone(&access)
    }

    // ---------------------------------------------------------------------
    // Thread lifecycle.

    /// Set up the thread slot if it has not already been set up: derive the
    /// real limits from the current stack position minus `stack_size`.
    /// Idempotent — initializing an initialized slot is a no-op.
    pub fn init_thread(&self, stack_size: usize) {
        let access = self.access();
        if LimitState::decode(self.state.real_climit.load(Ordering::Relaxed))
            != LimitState::Uninitialized
        {
            return;
        }
        let limit = current_stack_position().saturating_sub(stack_size);
        self.state.real_jslimit.store(limit, Ordering::Relaxed);
        self.state.real_climit.store(limit, Ordering::Relaxed);
        if self.state.interrupt_flags.load(Ordering::Relaxed) != 0 && !self.should_postpone(&access)
        {
            self.set_interrupt_limits(&access);
        } else {
            self.reset_limits(&access);
        }
    }

    /// Clear the thread slot so it no longer looks set up: sentinel limits,
    /// zero counters and flags, no callback. Idempotent.
    pub fn clear_thread(&self) {
        let _access = self.access();
        self.state.clear();
        // SAFETY: lock held; sole access to the slot.
        unsafe {
            *self.callback.get() = None;
        }
    }

    // ---------------------------------------------------------------------
    // Archive / restore: cooperative hand-off of the thread slot.

    /// Serialize the full thread slot into the first
    /// [`ARCHIVE_SPACE_PER_THREAD`] bytes of `to`, clear the live slot, and
    /// return the remaining tail of `to`.
    ///
    /// The layout is fixed (native endianness, no versioning): archiver and
    /// restorer must come from the same build.
    ///
    /// # Panics
    ///
    /// Panics if `to` is shorter than [`ARCHIVE_SPACE_PER_THREAD`].
    pub fn archive_stack_guard<'a>(&self, to: &'a mut [u8]) -> &'a mut [u8] {
        let _access = self.access();
        let (buf, rest) = to.split_at_mut(ARCHIVE_SPACE_PER_THREAD);

        let mut at = 0;
        for word in [
            self.state.real_jslimit.load(Ordering::Relaxed),
            self.state.jslimit.load(Ordering::Relaxed),
            self.state.real_climit.load(Ordering::Relaxed),
            self.state.climit.load(Ordering::Relaxed),
        ] {
            buf[at..at + WORD].copy_from_slice(&word.to_ne_bytes());
            at += WORD;
        }
        for half in [
            self.state.nesting.load(Ordering::Relaxed),
            self.state.postpone_interrupts_nesting.load(Ordering::Relaxed),
            self.state.interrupt_flags.load(Ordering::Relaxed) as i32,
        ] {
            buf[at..at + 4].copy_from_slice(&half.to_ne_bytes());
            at += 4;
        }
        // SAFETY: lock held; sole access to the slot.
        let registered = unsafe { *self.callback.get() };
        let (callback_word, data_word) = match registered {
            Some((callback, data)) => (callback as usize, data as usize),
            None => (0, 0),
        };
        buf[at..at + WORD].copy_from_slice(&callback_word.to_ne_bytes());
        at += WORD;
        buf[at..at + WORD].copy_from_slice(&data_word.to_ne_bytes());

        // The logical thread has been parked; leave a blank slot behind.
        self.state.clear();
        // SAFETY: lock held; sole access to the slot.
        unsafe {
            *self.callback.get() = None;
        }
        debug!("stack guard archived");
        rest
    }

    /// Restore a thread slot previously written by
    /// [`archive_stack_guard`](Self::archive_stack_guard), reproducing the
    /// exact observable state at archive time. Returns the remaining tail
    /// of `from`.
    ///
    /// # Panics
    ///
    /// Panics if `from` is shorter than [`ARCHIVE_SPACE_PER_THREAD`].
    pub fn restore_stack_guard<'a>(&self, from: &'a [u8]) -> &'a [u8] {
        let _access = self.access();
        let (buf, rest) = from.split_at(ARCHIVE_SPACE_PER_THREAD);

        let mut at = 0;
        let mut next_word = || {
            let word = usize::from_ne_bytes(buf[at..at + WORD].try_into().unwrap());
            at += WORD;
            word
        };
        self.state.real_jslimit.store(next_word(), Ordering::Relaxed);
        self.state.jslimit.store(next_word(), Ordering::Relaxed);
        self.state.real_climit.store(next_word(), Ordering::Relaxed);
        self.state.climit.store(next_word(), Ordering::Relaxed);
        drop(next_word);

        let mut next_half = || {
            let half = i32::from_ne_bytes(buf[at..at + 4].try_into().unwrap());
            at += 4;
            half
        };
        self.state.nesting.store(next_half(), Ordering::Relaxed);
        self.state
            .postpone_interrupts_nesting
            .store(next_half(), Ordering::Relaxed);
        self.state
            .interrupt_flags
            .store(next_half() as u32, Ordering::Relaxed);
        drop(next_half);

        let callback_word = usize::from_ne_bytes(buf[at..at + WORD].try_into().unwrap());
        let data_word = usize::from_ne_bytes(buf[at + WORD..at + 2 * WORD].try_into().unwrap());
        let registered = if callback_word == 0 {
            None
        } else {
            // SAFETY: the word was produced by `archive_stack_guard` in this
            // same build from a live `InterruptCallback`; the layout contract
            // forbids feeding buffers across builds.
            let callback = unsafe { mem::transmute::<usize, InterruptCallback>(callback_word) };
            Some((callback, data_word as *mut c_void))
        };
        // SAFETY: lock held; sole access to the slot.
        unsafe {
            *self.callback.get() = registered;
        }
        debug!("stack guard restored");
        rest
    }

    // ---------------------------------------------------------------------
    // Internals. All require the lock, witnessed by the access token.

    fn should_postpone(&self, _access: &ExecutionAccess<'_>) -> bool {
        self.state.postpone_interrupts_nesting.load(Ordering::Relaxed) > 0
    }

    fn has_pending_interrupts(&self, access: &ExecutionAccess<'_>) -> bool {
        // Pending-interrupt decisions are only meaningful once delivery is
        // no longer postponed.
        debug_assert!(!self.should_postpone(access));
        self.state.interrupt_flags.load(Ordering::Relaxed) != 0
    }

    /// Poison the effective limits so the next entry check trips.
    fn set_interrupt_limits(&self, _access: &ExecutionAccess<'_>) {
        self.state.jslimit.store(INTERRUPT_LIMIT, Ordering::Relaxed);
        self.state.climit.store(INTERRUPT_LIMIT, Ordering::Relaxed);
    }

    /// Restore the effective limits to the real values.
    fn reset_limits(&self, _access: &ExecutionAccess<'_>) {
        self.state
            .jslimit
            .store(self.state.real_jslimit.load(Ordering::Relaxed), Ordering::Relaxed);
        self.state
            .climit
            .store(self.state.real_climit.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    fn enable_interrupts(&self, access: &ExecutionAccess<'_>) {
        if self.has_pending_interrupts(access) {
            self.set_interrupt_limits(access);
        }
    }

    fn disable_interrupts(&self, access: &ExecutionAccess<'_>) {
        self.reset_limits(access);
    }

    pub(crate) fn enter_dispatch(&self) {
        self.state.nesting.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn leave_dispatch(&self) {
        let level = self.state.nesting.fetch_sub(1, Ordering::Relaxed) - 1;
        debug_assert!(level >= 0);
    }
}

impl Default for StackGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped suppression of interrupt delivery.
///
/// While at least one scope is alive, requested interrupts still set their
/// bit but the effective limits stay un-poisoned, so entry checks keep
/// passing. Dropping the outermost scope re-poisons the limits if any bits
/// ended up pending, so delivery is deferred, never lost. RAII guarantees
/// the nesting counter is balanced on every exit path.
pub struct PostponeInterruptsScope<'a> {
    stack_guard: &'a StackGuard,
}

impl<'a> PostponeInterruptsScope<'a> {
    /// Enter a postponement window on `stack_guard`.
    pub fn new(stack_guard: &'a StackGuard) -> Self {
        let access = stack_guard.access();
        stack_guard
            .state
            .postpone_interrupts_nesting
            .fetch_add(1, Ordering::Relaxed);
        stack_guard.disable_interrupts(&access);
        Self { stack_guard }
    }
}

impl Drop for PostponeInterruptsScope<'_> {
    fn drop(&mut self) {
        let access = self.stack_guard.access();
        let level = self
            .stack_guard
            .state
            .postpone_interrupts_nesting
            .fetch_sub(1, Ordering::Relaxed)
            - 1;
        debug_assert!(level >= 0);
        if level == 0 {
            self.stack_guard.enable_interrupts(&access);
        }
    }
}

/// Entry-check helper over a [`StackGuard`]: the single-word comparison the
/// engine's call machinery performs on every function entry.
pub struct StackLimitCheck<'a> {
    stack_guard: &'a StackGuard,
}

impl<'a> StackLimitCheck<'a> {
    /// Bind the check to `stack_guard`.
    pub fn new(stack_guard: &'a StackGuard) -> Self {
        Self { stack_guard }
    }

    /// Whether the JS entry check trips (real overflow or pending
    /// interrupt).
    pub fn js_has_overflowed(&self) -> bool {
        current_stack_position() < self.stack_guard.jslimit()
    }

    /// Whether the C entry check trips.
    pub fn has_overflowed(&self) -> bool {
        current_stack_position() < self.stack_guard.climit()
    }
}

/// Approximate the current stack position by the address of a local.
/// `inline(never)` so the frame belongs to a real callee.
#[inline(never)]
pub fn current_stack_position() -> usize {
    let marker = 0u8;
    std::ptr::addr_of!(marker) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initialized_guard(limit: usize) -> StackGuard {
        let guard = StackGuard::new();
        guard.set_stack_limit(limit);
        guard
    }

    #[test]
    fn test_limit_state_round_trip() {
        for state in [
            LimitState::Normal(0x1000),
            LimitState::InterruptPending,
            LimitState::Uninitialized,
        ] {
            assert_eq!(state, LimitState::decode(state.encode()));
        }
    }

    #[test]
    fn test_new_guard_is_uninitialized() {
        let guard = StackGuard::new();
        assert_eq!(LimitState::Uninitialized, LimitState::decode(guard.jslimit()));
        assert_eq!(LimitState::Uninitialized, LimitState::decode(guard.real_climit()));
    }

    #[test]
    fn test_request_poisons_and_continue_restores() {
        let guard = initialized_guard(0x1000);
        assert_eq!(0x1000, guard.jslimit());

        guard.interrupt();
        assert!(guard.is_interrupted());
        assert_eq!(LimitState::InterruptPending, LimitState::decode(guard.jslimit()));
        assert_eq!(LimitState::InterruptPending, LimitState::decode(guard.climit()));
        // Real limits are untouched.
        assert_eq!(0x1000, guard.real_jslimit());

        guard.continue_interrupt(InterruptFlag::Interrupt);
        assert!(!guard.is_interrupted());
        assert_eq!(0x1000, guard.jslimit());
        assert_eq!(0x1000, guard.climit());
    }

    #[test]
    fn test_request_is_idempotent() {
        let guard = initialized_guard(0x1000);
        guard.request_gc();
        guard.request_gc();
        guard.continue_interrupt(InterruptFlag::GcRequest);
        assert!(!guard.is_gc_requested());
        assert_eq!(0x1000, guard.jslimit());
    }

    #[test]
    fn test_limits_stay_poisoned_until_last_flag_cleared() {
        let guard = initialized_guard(0x1000);
        guard.request_gc();
        guard.preempt();

        guard.continue_interrupt(InterruptFlag::GcRequest);
        assert!(guard.is_preempted());
        assert_eq!(LimitState::InterruptPending, LimitState::decode(guard.jslimit()));

        guard.continue_interrupt(InterruptFlag::Preempt);
        assert_eq!(0x1000, guard.jslimit());
    }

    #[test]
    fn test_set_stack_limit_keeps_poison() {
        let guard = initialized_guard(0x1000);
        guard.terminate_execution();
        guard.set_stack_limit(0x2000);

        // Effective limits stay poisoned; real limits moved.
        assert_eq!(LimitState::InterruptPending, LimitState::decode(guard.climit()));
        assert_eq!(0x2000, guard.real_climit());

        guard.cancel_terminate_execution();
        assert_eq!(0x2000, guard.climit());
    }

    #[test]
    fn test_postpone_suppresses_delivery() {
        let guard = initialized_guard(0x1000);
        {
            let _postpone = PostponeInterruptsScope::new(&guard);
            assert!(guard.should_postpone_interrupts());
            guard.interrupt();
            // Bit recorded, limit not poisoned.
            assert!(guard.is_interrupted());
            assert_eq!(0x1000, guard.jslimit());
        }
        // Outermost scope left with a pending bit: poisoned now.
        assert!(!guard.should_postpone_interrupts());
        assert_eq!(LimitState::InterruptPending, LimitState::decode(guard.jslimit()));
    }

    #[test]
    fn test_nested_postpone_delivers_at_outermost_exit() {
        let guard = initialized_guard(0x1000);
        let outer = PostponeInterruptsScope::new(&guard);
        {
            let _inner = PostponeInterruptsScope::new(&guard);
            guard.request_gc();
        }
        // Inner scope gone, outer still active: no delivery.
        assert_eq!(0x1000, guard.jslimit());
        drop(outer);
        assert_eq!(LimitState::InterruptPending, LimitState::decode(guard.jslimit()));
    }

    #[test]
    fn test_postpone_with_nothing_pending() {
        let guard = initialized_guard(0x1000);
        {
            let _postpone = PostponeInterruptsScope::new(&guard);
        }
        assert_eq!(0x1000, guard.jslimit());
    }

    #[test]
    fn test_is_stack_overflow_ignores_flags() {
        let here = current_stack_position();
        let guard = StackGuard::new();

        // Real limit far below us, every flag set: not an overflow.
        guard.set_stack_limit(here.saturating_sub(1 << 20));
        guard.interrupt();
        guard.terminate_execution();
        assert!(!guard.is_stack_overflow(current_stack_position()));

        // Real limit above us, no flags: overflow.
        let guard = StackGuard::new();
        guard.set_stack_limit(here + (1 << 20));
        assert!(guard.is_stack_overflow(current_stack_position()));
    }

    #[test]
    fn test_stack_limit_check_trips_on_poison() {
        let here = current_stack_position();
        let guard = initialized_guard(here.saturating_sub(1 << 20));
        let check = StackLimitCheck::new(&guard);
        assert!(!check.js_has_overflowed());
        assert!(!check.has_overflowed());

        guard.preempt();
        assert!(check.js_has_overflowed());
        assert!(check.has_overflowed());
    }

    #[test]
    fn test_init_thread_idempotent() {
        let guard = StackGuard::new();
        guard.init_thread(1 << 16);
        let limit = guard.real_climit();
        assert!(matches!(LimitState::decode(limit), LimitState::Normal(_)));

        guard.init_thread(1 << 20);
        assert_eq!(limit, guard.real_climit());
    }

    #[test]
    fn test_init_thread_with_pending_interrupt_poisons() {
        let guard = StackGuard::new();
        guard.request_gc();
        guard.init_thread(1 << 16);
        assert_eq!(LimitState::InterruptPending, LimitState::decode(guard.jslimit()));
        guard.continue_interrupt(InterruptFlag::GcRequest);
        assert!(matches!(LimitState::decode(guard.jslimit()), LimitState::Normal(_)));
    }

    #[test]
    fn test_clear_thread_idempotent() {
        let guard = initialized_guard(0x1000);
        guard.interrupt();
        guard.clear_thread();
        assert_eq!(LimitState::Uninitialized, LimitState::decode(guard.jslimit()));
        assert!(!guard.is_interrupted());
        guard.clear_thread();
        assert_eq!(LimitState::Uninitialized, LimitState::decode(guard.jslimit()));
    }

    #[test]
    fn test_clear_api_interrupt_drops_callback() {
        fn never(_data: *mut c_void) {
            panic!("cleared callback must not fire");
        }

        let guard = initialized_guard(0x1000);
        guard.request_interrupt(never, std::ptr::null_mut());
        assert!(guard.is_api_interrupt());

        guard.clear_api_interrupt();
        assert!(!guard.is_api_interrupt());
        assert_eq!(0x1000, guard.jslimit());
        // Invoking now is a no-op.
        guard.invoke_interrupt_callback();
    }

    #[test]
    fn test_interrupt_requests_cross_threads() {
        use std::sync::Arc;

        let guard = Arc::new(initialized_guard(0x1000));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        match i % 4 {
                            0 => guard.interrupt(),
                            1 => guard.request_gc(),
                            2 => guard.preempt(),
                            _ => guard.debug_break(),
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for flag in [
            InterruptFlag::Interrupt,
            InterruptFlag::GcRequest,
            InterruptFlag::Preempt,
            InterruptFlag::DebugBreak,
        ] {
            assert!(guard.is_interrupt_requested(flag));
            guard.continue_interrupt(flag);
        }
        assert_eq!(0x1000, guard.jslimit());
    }
}
