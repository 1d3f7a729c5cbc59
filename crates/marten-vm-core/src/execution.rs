//! Slow-path interrupt dispatch.
//!
//! When an entry check trips, the engine's call machinery lands here. The
//! dispatch routine first decides whether the trip is a genuine stack
//! overflow or a synthetic one caused by a pending interrupt, then services
//! the pending flags through the [`InterruptHandler`] capability the engine
//! supplies, clearing each serviced bit via
//! [`StackGuard::continue_interrupt`].

use tracing::{debug, trace};

use crate::error::{ExecutionError, ExecutionResult};
use crate::stack_guard::{InterruptFlag, StackGuard, current_stack_position};

/// Capability interface for the subsystems that service interrupts: the GC,
/// the debugger, the deoptimizer, and the code-installation machinery. The
/// engine hands an implementation to [`handle_stack_guard_interrupt`];
/// default bodies are no-ops so embedders implement only what they service.
pub trait InterruptHandler {
    /// A garbage collection was requested.
    fn on_gc_request(&mut self) {}

    /// The debugger requested a break.
    fn on_debug_break(&mut self) {}

    /// A debugger command is pending.
    fn on_debug_command(&mut self) {}

    /// The running computation should yield to another logical thread.
    fn on_preempt(&mut self) {}

    /// All optimized code should be deoptimized.
    fn on_full_deopt(&mut self) {}

    /// Code dependent on marked allocation sites should be deoptimized.
    fn on_deopt_marked_allocation_sites(&mut self) {}

    /// Pending optimized code should be installed.
    fn on_install_code(&mut self) {}
}

/// Service a tripped entry check.
///
/// Order of decisions:
///
/// 1. A genuine overflow (real stack pointer past the *real* limit) is
///    reported as [`ExecutionError::StackOverflow`] without touching the
///    interrupt bitset.
/// 2. If delivery is postponed, nothing is dispatched.
/// 3. A pending termination returns
///    [`ExecutionError::TerminationRequested`] with the bit left set; entry
///    checks keep tripping until the engine calls
///    [`StackGuard::cancel_terminate_execution`], so the unwind cannot be
///    silently ignored.
/// 4. The remaining set bits are serviced in
///    [`InterruptFlag::DISPATCH_ORDER`], one [`StackGuard::continue_interrupt`]
///    per bit, so no bit starves.
pub fn handle_stack_guard_interrupt(
    stack_guard: &StackGuard,
    handler: &mut dyn InterruptHandler,
) -> ExecutionResult<()> {
    stack_guard.enter_dispatch();
    let result = dispatch(stack_guard, handler);
    stack_guard.leave_dispatch();
    result
}

fn dispatch(stack_guard: &StackGuard, handler: &mut dyn InterruptHandler) -> ExecutionResult<()> {
    if stack_guard.is_stack_overflow(current_stack_position()) {
        debug!("entry check tripped by genuine stack overflow");
        return Err(ExecutionError::StackOverflow);
    }
    if stack_guard.should_postpone_interrupts() {
        return Ok(());
    }

    for flag in InterruptFlag::DISPATCH_ORDER {
        if !stack_guard.is_interrupt_requested(flag) {
            continue;
        }
        trace!(?flag, "dispatching interrupt");
        match flag {
            InterruptFlag::Terminate => {
                // Left pending on purpose; see the function docs.
                return Err(ExecutionError::TerminationRequested);
            }
            InterruptFlag::ApiInterrupt => {
                // Clears its own bit after firing the callback.
                stack_guard.invoke_interrupt_callback();
            }
            InterruptFlag::Interrupt => {
                // Synthetic stack check: reported as an overflow condition.
                stack_guard.continue_interrupt(flag);
                return Err(ExecutionError::StackOverflow);
            }
            InterruptFlag::DebugBreak => {
                handler.on_debug_break();
                stack_guard.continue_interrupt(flag);
            }
            InterruptFlag::DebugCommand => {
                handler.on_debug_command();
                stack_guard.continue_interrupt(flag);
            }
            InterruptFlag::Preempt => {
                handler.on_preempt();
                stack_guard.continue_interrupt(flag);
            }
            InterruptFlag::GcRequest => {
                handler.on_gc_request();
                stack_guard.continue_interrupt(flag);
            }
            InterruptFlag::FullDeopt => {
                handler.on_full_deopt();
                stack_guard.continue_interrupt(flag);
            }
            InterruptFlag::InstallCode => {
                handler.on_install_code();
                stack_guard.continue_interrupt(flag);
            }
            InterruptFlag::DeoptMarkedAllocationSites => {
                handler.on_deopt_marked_allocation_sites();
                stack_guard.continue_interrupt(flag);
            }
        }
    }
    Ok(())
}
