//! # Marten VM interrupt core
//!
//! Cooperative interruption for a VM shared by multiple threads. The engine
//! already checks a stack limit on every function entry; this crate
//! repurposes that single check as the interrupt delivery point by lowering
//! the effective limit whenever an interrupt is pending, so the overflow
//! check trips and the slow dispatch path services the pending flags.
//!
//! ## Pieces
//!
//! - [`StackGuard`]: the dual real/effective limits plus the pending-flag
//!   bitset — the central state machine
//! - [`StackLimitCheck`]: the hot-path entry check (one word read, no lock)
//! - [`PostponeInterruptsScope`]: scoped suppression of delivery
//! - [`handle_stack_guard_interrupt`]: the slow path, dispatching to the
//!   engine's [`InterruptHandler`] collaborators
//! - [`Isolate`] / [`IsolateHandle`]: thread-confined VM instance and its
//!   `Send + Sync` cross-thread handle
//!
//! ## Example
//!
//! ```
//! use marten_vm_core::{Isolate, IsolateConfig, StackLimitCheck};
//!
//! let mut isolate = Isolate::new(IsolateConfig::default());
//! let handle = isolate.handle();
//!
//! // From any thread:
//! handle.terminate_execution();
//!
//! let guard = isolate.enter();
//! let check = StackLimitCheck::new(guard.stack_guard());
//! assert!(check.js_has_overflowed()); // limit poisoned by the request
//! assert!(guard.stack_guard().is_terminate_execution());
//! ```

#![warn(clippy::all)]

pub mod error;
pub mod execution;
pub mod isolate;
pub mod stack_guard;

pub use error::{ExecutionError, ExecutionResult};
pub use execution::{InterruptHandler, handle_stack_guard_interrupt};
pub use isolate::{Isolate, IsolateConfig, IsolateGuard, IsolateHandle};
pub use stack_guard::{
    ARCHIVE_SPACE_PER_THREAD, InterruptCallback, InterruptFlag, LimitState,
    PostponeInterruptsScope, StackGuard, StackLimitCheck, current_stack_position,
};
